use anyhow::Result;
use serde::Serialize;

pub const NS_MAIN: i32 = 0;
pub const NS_FILE: i32 = 6;
pub const NS_TEMPLATE: i32 = 10;
pub const NS_CATEGORY: i32 = 14;
/// WikibaseLexeme's namespace on most installations.
pub const NS_LEXEME: i32 = 146;

/// Identifies a page; carries no content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PageHandle {
    pub title: String,
    pub namespace: i32,
}

impl PageHandle {
    pub fn new(title: impl Into<String>, namespace: i32) -> Self {
        Self {
            title: title.into(),
            namespace,
        }
    }

    pub fn main(title: impl Into<String>) -> Self {
        Self::new(title, NS_MAIN)
    }
}

/// Current content of a page or entity as read from the wiki.
///
/// `body` is wikitext for ordinary pages and serialized JSON for Wikibase entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub title: String,
    pub namespace: i32,
    pub body: String,
    pub revision_id: Option<i64>,
    pub timestamp: Option<String>,
}

impl PageContent {
    pub fn new(title: impl Into<String>, namespace: i32, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            namespace,
            body: body.into(),
            revision_id: None,
            timestamp: None,
        }
    }

    /// Same page and revision marker, different body.
    pub fn with_body(&self, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..self.clone()
        }
    }

    pub fn handle(&self) -> PageHandle {
        PageHandle::new(self.title.clone(), self.namespace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    /// Re-read the page right before writing and skip the write if nothing changed.
    pub verify_unchanged: bool,
    /// Revision the new text was derived from; lets the server detect edit conflicts.
    pub base_revision: Option<i64>,
    pub minor: bool,
    pub bot: bool,
    pub no_create: bool,
    pub create_only: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            verify_unchanged: true,
            base_revision: None,
            minor: false,
            bot: true,
            no_create: false,
            create_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { revision_id: Option<i64> },
    NoChange,
    Conflict,
}

/// One continuation page of a category listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberBatch {
    pub members: Vec<PageHandle>,
    pub continuation: Option<String>,
}

/// Page-level operations the batch runner needs from a wiki.
pub trait WikiPageApi {
    /// `Ok(None)` when the page does not exist or has no revisions.
    fn get_page_text(&mut self, title: &str) -> Result<Option<PageContent>>;

    fn save_page(
        &mut self,
        title: &str,
        new_text: &str,
        summary: &str,
        options: &SaveOptions,
    ) -> Result<SaveOutcome>;

    fn category_members_batch(
        &mut self,
        category: &str,
        namespaces: &[i32],
        continuation: Option<&str>,
    ) -> Result<MemberBatch>;
}

/// `Foo` and `Category:Foo` both name the same category.
pub fn category_title(category: &str) -> String {
    let trimmed = category.trim();
    if trimmed.starts_with("Category:") {
        trimmed.to_string()
    } else {
        format!("Category:{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::{PageContent, category_title};

    #[test]
    fn category_prefix_is_added_once() {
        assert_eq!(category_title("Shinto shrines"), "Category:Shinto shrines");
        assert_eq!(category_title("Category:Shinto shrines"), "Category:Shinto shrines");
    }

    #[test]
    fn with_body_keeps_revision_marker() {
        let mut page = PageContent::new("Foo", 0, "old");
        page.revision_id = Some(42);
        let edited = page.with_body("new");
        assert_eq!(edited.revision_id, Some(42));
        assert_eq!(edited.body, "new");
        assert_eq!(edited.handle(), page.handle());
    }
}
