//! Reusable wikitext transforms. All are pure functions of the fetched page.

use std::ops::Range;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::batch::{Transform, TransformOutcome};
use crate::page::PageContent;

static CATEGORY_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[\s*[Cc]ategory\s*:\s*([^\]|]+?)\s*(?:\|[^\]]*)?\]\]")
        .expect("category link pattern compiles")
});

/// Appends a marker (template, category tag, notice) unless the page already has it.
#[derive(Debug, Clone)]
pub struct AppendMarker {
    marker: String,
    present: Regex,
}

impl AppendMarker {
    /// The marker counts as present when it appears verbatim.
    pub fn new(marker: impl Into<String>) -> Result<Self> {
        let marker = marker.into();
        let present = Regex::new(&regex::escape(marker.trim()))
            .context("failed to build marker pattern")?;
        Ok(Self { marker, present })
    }

    /// The marker counts as present when `present` matches anywhere in the page.
    pub fn with_presence_pattern(marker: impl Into<String>, present: &str) -> Result<Self> {
        let present =
            Regex::new(present).with_context(|| format!("invalid presence pattern {present}"))?;
        Ok(Self {
            marker: marker.into(),
            present,
        })
    }
}

impl Transform for AppendMarker {
    fn apply(&mut self, page: &PageContent) -> Result<TransformOutcome> {
        if self.present.is_match(&page.body) {
            return Ok(TransformOutcome::Skip("marker already present".to_string()));
        }
        Ok(TransformOutcome::Edit(append_line(&page.body, &self.marker)))
    }
}

#[derive(Debug, Clone)]
pub struct AddCategory {
    name: String,
}

impl AddCategory {
    pub fn new(name: &str) -> Self {
        Self {
            name: normalize_category_name(name),
        }
    }
}

impl Transform for AddCategory {
    fn apply(&mut self, page: &PageContent) -> Result<TransformOutcome> {
        if category_links(&page.body).any(|(_, name)| name == self.name) {
            return Ok(TransformOutcome::Skip(format!(
                "already in Category:{}",
                self.name
            )));
        }
        let tag = format!("[[Category:{}]]", self.name);
        Ok(TransformOutcome::Edit(append_line(&page.body, &tag)))
    }
}

#[derive(Debug, Clone)]
pub struct RemoveCategory {
    name: String,
}

impl RemoveCategory {
    pub fn new(name: &str) -> Self {
        Self {
            name: normalize_category_name(name),
        }
    }
}

impl Transform for RemoveCategory {
    fn apply(&mut self, page: &PageContent) -> Result<TransformOutcome> {
        let mut output = String::with_capacity(page.body.len());
        let mut removed = 0usize;
        for line in page.body.split_inclusive('\n') {
            let mut kept = String::with_capacity(line.len());
            let mut cursor = 0;
            for (range, name) in category_links(line) {
                if name == self.name {
                    kept.push_str(&line[cursor..range.start]);
                    cursor = range.end;
                    removed += 1;
                }
            }
            kept.push_str(&line[cursor..]);
            let emptied = cursor > 0 && kept.trim().is_empty();
            if !emptied {
                output.push_str(&kept);
            }
        }
        if removed == 0 {
            return Ok(TransformOutcome::Skip(format!(
                "not in Category:{}",
                self.name
            )));
        }
        Ok(TransformOutcome::Edit(output))
    }
}

/// Regex search and replace across the whole page. `replacement` may use `$1`/`${name}`.
#[derive(Debug, Clone)]
pub struct RegexReplace {
    pattern: Regex,
    replacement: String,
}

impl RegexReplace {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern).with_context(|| format!("invalid pattern {pattern}"))?,
            replacement: replacement.into(),
        })
    }
}

impl Transform for RegexReplace {
    fn apply(&mut self, page: &PageContent) -> Result<TransformOutcome> {
        if !self.pattern.is_match(&page.body) {
            return Ok(TransformOutcome::Skip("pattern not found".to_string()));
        }
        let replaced = self
            .pattern
            .replace_all(&page.body, self.replacement.as_str());
        Ok(TransformOutcome::Edit(replaced.into_owned()))
    }
}

/// `foo_bar` and `Foo bar` name the same category.
pub fn normalize_category_name(name: &str) -> String {
    let name = name.trim();
    let name = name
        .strip_prefix("Category:")
        .or_else(|| name.strip_prefix("category:"))
        .unwrap_or(name);
    let spaced = name
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn category_links(text: &str) -> impl Iterator<Item = (Range<usize>, String)> + '_ {
    CATEGORY_LINK.captures_iter(text).filter_map(|captures| {
        let whole = captures.get(0)?;
        let name = captures.get(1)?;
        Some((whole.range(), normalize_category_name(name.as_str())))
    })
}

fn append_line(body: &str, line: &str) -> String {
    let mut text = String::with_capacity(body.len() + line.len() + 1);
    text.push_str(body);
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text
}
