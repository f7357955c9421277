use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::category::CategoryMembers;
use crate::error::{AuthError, ErrorKind, classify_error};
use crate::page::{PageContent, PageHandle, SaveOptions, SaveOutcome, WikiPageApi};

/// Lazily yields the pages a batch run visits. Sources may use the API
/// between items (continuation requests).
pub trait PageSource<A: WikiPageApi + ?Sized> {
    fn next_page(&mut self, api: &mut A) -> Result<Option<PageHandle>>;
}

impl<A: WikiPageApi + ?Sized> PageSource<A> for CategoryMembers {
    fn next_page(&mut self, api: &mut A) -> Result<Option<PageHandle>> {
        self.next_member(api)
    }
}

/// Fixed list of titles, e.g. read from a file or produced by a SPARQL query.
#[derive(Debug, Clone, Default)]
pub struct TitleList {
    pages: VecDeque<PageHandle>,
}

impl TitleList {
    pub fn new(pages: impl IntoIterator<Item = PageHandle>) -> Self {
        Self {
            pages: pages.into_iter().collect(),
        }
    }

    pub fn from_titles<S: Into<String>>(titles: impl IntoIterator<Item = S>, namespace: i32) -> Self {
        Self::new(
            titles
                .into_iter()
                .map(|title| PageHandle::new(title, namespace)),
        )
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl<A: WikiPageApi + ?Sized> PageSource<A> for TitleList {
    fn next_page(&mut self, _api: &mut A) -> Result<Option<PageHandle>> {
        Ok(self.pages.pop_front())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Proposed new body.
    Edit(String),
    /// The transform declined to touch the page; the reason goes into the report.
    Skip(String),
}

/// A pure page-to-page rewrite. Transforms never talk to the network.
pub trait Transform {
    fn apply(&mut self, page: &PageContent) -> Result<TransformOutcome>;
}

impl<F> Transform for F
where
    F: FnMut(&PageContent) -> Result<TransformOutcome>,
{
    fn apply(&mut self, page: &PageContent) -> Result<TransformOutcome> {
        self(page)
    }
}

#[derive(Debug, Clone)]
pub struct RunPolicy {
    /// Pause after every item, whatever its outcome.
    pub throttle: Duration,
    /// Extra pause after an item that failed.
    pub error_sleep: Duration,
    /// Re-read, re-transform and re-save once after an edit conflict.
    pub retry_conflicts: bool,
    pub dry_run: bool,
    pub max_items: Option<usize>,
    pub summary: String,
    pub save_options: SaveOptions,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(1),
            error_sleep: Duration::from_secs(3),
            retry_conflicts: false,
            dry_run: false,
            max_items: None,
            summary: "Bot: automated edit".to_string(),
            save_options: SaveOptions::default(),
        }
    }
}

impl RunPolicy {
    /// No pauses; for tests and local mirrors.
    pub fn immediate(summary: impl Into<String>) -> Self {
        Self {
            throttle: Duration::ZERO,
            error_sleep: Duration::ZERO,
            summary: summary.into(),
            ..Self::default()
        }
    }
}

/// Cooperative stop signal, checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchOutcome {
    Written,
    SkippedUnchanged,
    SkippedError,
    SkippedPolicy,
    WouldWrite,
}

impl BatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::SkippedUnchanged => "skipped-unchanged",
            Self::SkippedError => "skipped-error",
            Self::SkippedPolicy => "skipped-policy",
            Self::WouldWrite => "would-write",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub page: PageHandle,
    pub outcome: BatchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub dry_run: bool,
    pub processed: usize,
    pub written: Vec<String>,
    pub skipped_unchanged: Vec<String>,
    pub skipped_error: Vec<String>,
    pub skipped_policy: Vec<String>,
    pub would_write: Vec<String>,
    pub items: Vec<BatchItem>,
    pub cancelled: bool,
    /// Set when the page source failed and the run ended early.
    pub aborted: Option<String>,
}

impl BatchReport {
    fn record(&mut self, item: BatchItem) {
        let title = item.page.title.clone();
        match item.outcome {
            BatchOutcome::Written => self.written.push(title),
            BatchOutcome::SkippedUnchanged => self.skipped_unchanged.push(title),
            BatchOutcome::SkippedError => self.skipped_error.push(title),
            BatchOutcome::SkippedPolicy => self.skipped_policy.push(title),
            BatchOutcome::WouldWrite => self.would_write.push(title),
        }
        self.processed += 1;
        self.items.push(item);
    }

    pub fn count(&self, outcome: BatchOutcome) -> usize {
        self.items
            .iter()
            .filter(|item| item.outcome == outcome)
            .count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &BatchItem> {
        self.items
            .iter()
            .filter(|item| item.outcome == BatchOutcome::SkippedError)
    }

    pub fn is_clean(&self) -> bool {
        self.skipped_error.is_empty() && self.aborted.is_none()
    }

    /// Operator summary: counts, then the titles in each non-empty bucket.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("dry_run: {}", self.dry_run),
            format!("processed: {}", self.processed),
            format!("written: {}", self.written.len()),
            format!("skipped_unchanged: {}", self.skipped_unchanged.len()),
            format!("skipped_policy: {}", self.skipped_policy.len()),
            format!("skipped_error: {}", self.skipped_error.len()),
        ];
        if self.dry_run {
            lines.push(format!("would_write: {}", self.would_write.len()));
        }
        if self.cancelled {
            lines.push("cancelled: true".to_string());
        }
        if let Some(reason) = &self.aborted {
            lines.push(format!("aborted: {reason}"));
        }
        for (label, titles) in [
            ("written_titles", &self.written),
            ("would_write_titles", &self.would_write),
            ("skipped_policy_titles", &self.skipped_policy),
            ("skipped_unchanged_titles", &self.skipped_unchanged),
        ] {
            if !titles.is_empty() {
                lines.push(format!("{label}:"));
                lines.extend(titles.iter().map(|title| format!("  - {title}")));
            }
        }
        if !self.skipped_error.is_empty() {
            lines.push("errors:".to_string());
            for item in self.errors() {
                lines.push(format!(
                    "  - {}: {}",
                    item.page.title,
                    item.detail.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        lines
    }
}

/// Drives read-transform-write over a page source, one page at a time.
///
/// Every item is isolated: fetch, transform and save errors are recorded and
/// the run moves on. Only fatal errors (bad credentials, missing rights,
/// unusable endpoint) end the run with `Err`.
pub struct BatchEditOrchestrator {
    policy: RunPolicy,
    cancel: CancelFlag,
    sleeper: Arc<dyn Fn(Duration) + Send + Sync>,
}

impl BatchEditOrchestrator {
    pub fn new(policy: RunPolicy) -> Self {
        Self {
            policy,
            cancel: CancelFlag::new(),
            sleeper: Arc::new(sleep),
        }
    }

    /// Replace the function used for throttle and error pauses.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        let sleeper: Arc<dyn Fn(Duration) + Send + Sync> = Arc::new(sleeper);
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }

    pub fn run<A, S, X>(&self, api: &mut A, source: &mut S, transform: &mut X) -> Result<BatchReport>
    where
        A: WikiPageApi + ?Sized,
        S: PageSource<A> + ?Sized,
        X: Transform + ?Sized,
    {
        let mut report = BatchReport {
            dry_run: self.policy.dry_run,
            ..BatchReport::default()
        };

        loop {
            if self.cancel.is_cancelled() {
                info!(processed = report.processed, "batch cancelled");
                report.cancelled = true;
                break;
            }
            if self
                .policy
                .max_items
                .is_some_and(|limit| report.processed >= limit)
            {
                info!(processed = report.processed, "item limit reached");
                break;
            }

            let page = match source.next_page(api) {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(error) => {
                    if is_fatal(&error) {
                        return Err(error.context("page source failed"));
                    }
                    warn!("page source failed, ending run: {error:#}");
                    report.aborted = Some(format!("{error:#}"));
                    break;
                }
            };

            let item = match self.process(api, &page, transform) {
                Ok(item) => item,
                Err(error) if is_fatal(&error) => {
                    warn!(title = %page.title, "fatal error, aborting run: {error:#}");
                    return Err(error.context(format!(
                        "batch aborted at {} after {} items",
                        page.title, report.processed
                    )));
                }
                Err(error) => {
                    warn!(title = %page.title, kind = %classify_error(&error), "item failed: {error:#}");
                    BatchItem {
                        page: page.clone(),
                        outcome: BatchOutcome::SkippedError,
                        detail: Some(format!("{error:#}")),
                        revision_id: None,
                    }
                }
            };

            info!(title = %item.page.title, outcome = item.outcome.as_str(), "item done");
            let failed = item.outcome == BatchOutcome::SkippedError;
            report.record(item);

            self.pause(self.policy.throttle);
            if failed {
                self.pause(self.policy.error_sleep);
            }
        }

        info!(
            processed = report.processed,
            written = report.written.len(),
            errors = report.skipped_error.len(),
            "batch finished"
        );
        Ok(report)
    }

    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            (self.sleeper)(duration);
        }
    }

    fn process<A, X>(&self, api: &mut A, page: &PageHandle, transform: &mut X) -> Result<BatchItem>
    where
        A: WikiPageApi + ?Sized,
        X: Transform + ?Sized,
    {
        let item = |outcome, detail: Option<String>, revision_id| BatchItem {
            page: page.clone(),
            outcome,
            detail,
            revision_id,
        };

        let mut conflict_retries = usize::from(self.policy.retry_conflicts);
        loop {
            let Some(current) = api.get_page_text(&page.title)? else {
                return Ok(item(
                    BatchOutcome::SkippedError,
                    Some("page not found".to_string()),
                    None,
                ));
            };

            let proposed = match transform.apply(&current)? {
                TransformOutcome::Skip(reason) => {
                    debug!(title = %page.title, reason = %reason, "transform skipped page");
                    return Ok(item(BatchOutcome::SkippedPolicy, Some(reason), None));
                }
                TransformOutcome::Edit(text) => text,
            };
            if proposed == current.body {
                return Ok(item(BatchOutcome::SkippedUnchanged, None, current.revision_id));
            }

            if self.policy.dry_run {
                let diff = TextDiff::from_lines(current.body.as_str(), proposed.as_str())
                    .unified_diff()
                    .context_radius(2)
                    .header(&current.title, &format!("{} (proposed)", current.title))
                    .to_string();
                debug!(title = %page.title, "dry run diff:\n{diff}");
                return Ok(item(BatchOutcome::WouldWrite, None, current.revision_id));
            }

            let options = SaveOptions {
                base_revision: current.revision_id,
                ..self.policy.save_options.clone()
            };
            match api.save_page(&page.title, &proposed, &self.policy.summary, &options)? {
                SaveOutcome::Saved { revision_id } => {
                    return Ok(item(BatchOutcome::Written, None, revision_id));
                }
                SaveOutcome::NoChange => {
                    return Ok(item(BatchOutcome::SkippedUnchanged, None, current.revision_id));
                }
                SaveOutcome::Conflict if conflict_retries > 0 => {
                    conflict_retries -= 1;
                    info!(title = %page.title, "edit conflict, re-reading page");
                }
                SaveOutcome::Conflict => {
                    return Ok(item(
                        BatchOutcome::SkippedError,
                        Some("edit conflict".to_string()),
                        current.revision_id,
                    ));
                }
            }
        }
    }
}

fn is_fatal(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.downcast_ref::<AuthError>().is_some())
        || classify_error(error) == ErrorKind::Fatal
}

/// Convenience for transforms built from a plain text function.
pub fn text_transform<F>(mut rewrite: F) -> impl Transform
where
    F: FnMut(&str) -> Option<String>,
{
    move |page: &PageContent| -> Result<TransformOutcome> {
        Ok(match rewrite(&page.body) {
            Some(text) => TransformOutcome::Edit(text),
            None => TransformOutcome::Skip("no change requested".to_string()),
        })
    }
}
