use std::collections::{HashSet, VecDeque};

use anyhow::Result;
use tracing::debug;

use crate::page::{PageHandle, WikiPageApi, category_title};

/// Lazy cursor over a category's members.
///
/// Fetches one `cmcontinue` page at a time and hands out members one by one.
/// The cursor does not borrow the API, so the same session can be used to
/// edit pages between two `next_member` calls.
#[derive(Debug, Clone)]
pub struct CategoryMembers {
    category: String,
    namespaces: Vec<i32>,
    continuation: Option<String>,
    buffer: VecDeque<PageHandle>,
    seen: HashSet<String>,
    started: bool,
    exhausted: bool,
}

impl CategoryMembers {
    pub fn new(category: &str, namespaces: &[i32]) -> Self {
        Self {
            category: category_title(category),
            namespaces: namespaces.to_vec(),
            continuation: None,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            started: false,
            exhausted: false,
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Start over from the first continuation page.
    pub fn restart(&mut self) {
        self.continuation = None;
        self.buffer.clear();
        self.seen.clear();
        self.started = false;
        self.exhausted = false;
    }

    pub fn next_member<A: WikiPageApi + ?Sized>(
        &mut self,
        api: &mut A,
    ) -> Result<Option<PageHandle>> {
        loop {
            if let Some(member) = self.buffer.pop_front() {
                return Ok(Some(member));
            }
            if self.exhausted {
                return Ok(None);
            }

            let continuation = if self.started {
                match self.continuation.as_deref() {
                    Some(token) => Some(token),
                    None => {
                        self.exhausted = true;
                        continue;
                    }
                }
            } else {
                None
            };
            let batch =
                api.category_members_batch(&self.category, &self.namespaces, continuation)?;
            self.started = true;
            debug!(
                category = %self.category,
                members = batch.members.len(),
                more = batch.continuation.is_some(),
                "fetched category page"
            );
            for member in batch.members {
                if self.seen.insert(member.title.clone()) {
                    self.buffer.push_back(member);
                }
            }
            if batch.continuation.is_none() || batch.continuation == self.continuation {
                self.exhausted = true;
            }
            self.continuation = batch.continuation;
        }
    }

    pub fn iter<A: WikiPageApi + ?Sized>(self, api: &mut A) -> CategoryMembersIter<'_, A> {
        CategoryMembersIter { cursor: self, api }
    }
}

/// `Iterator` view of a cursor that holds the API borrow for its lifetime.
pub struct CategoryMembersIter<'a, A: WikiPageApi + ?Sized> {
    cursor: CategoryMembers,
    api: &'a mut A,
}

impl<A: WikiPageApi + ?Sized> Iterator for CategoryMembersIter<'_, A> {
    type Item = Result<PageHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cursor.next_member(&mut *self.api) {
            Ok(Some(member)) => Some(Ok(member)),
            Ok(None) => None,
            Err(error) => {
                self.cursor.exhausted = true;
                self.cursor.buffer.clear();
                Some(Err(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::CategoryMembers;
    use crate::client::{ClientConfig, HttpApiClient};
    use crate::page::NS_MAIN;
    use crate::retry::RetryPolicy;
    use crate::session::WikiSession;
    use crate::testing::ScriptedTransport;

    fn three_page_transport() -> ScriptedTransport {
        let mut transport = ScriptedTransport::default();
        transport.push_json(json!({
            "continue": {"cmcontinue": "page|B|2", "continue": "-||"},
            "query": {"categorymembers": [
                {"pageid": 1, "ns": 0, "title": "Alpha"},
                {"pageid": 2, "ns": 0, "title": "Beta"}
            ]}
        }));
        transport.push_json(json!({
            "continue": {"cmcontinue": "page|D|4", "continue": "-||"},
            "query": {"categorymembers": [
                {"pageid": 3, "ns": 0, "title": "Gamma"},
                {"pageid": 4, "ns": 0, "title": "Delta"}
            ]}
        }));
        transport.push_json(json!({
            "batchcomplete": true,
            "query": {"categorymembers": [
                {"pageid": 5, "ns": 0, "title": "Epsilon"}
            ]}
        }));
        transport
    }

    fn session(transport: ScriptedTransport) -> WikiSession<ScriptedTransport> {
        let mut config = ClientConfig::new("https://shinto.example/w/api.php");
        config.retry = RetryPolicy::immediate(1);
        WikiSession::new(HttpApiClient::new(transport, config))
    }

    #[test]
    fn continuation_pages_are_joined_without_duplicates() {
        let mut session = session(three_page_transport());

        let titles = session
            .category_members("Shinto shrines", &[NS_MAIN])
            .map(|member| member.map(|handle| handle.title))
            .collect::<anyhow::Result<Vec<_>>>()
            .expect("members");

        assert_eq!(titles, vec!["Alpha", "Beta", "Gamma", "Delta", "Epsilon"]);
        let requests = &session.client().transport().requests;
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].param("cmtitle"), Some("Category:Shinto shrines"));
        assert_eq!(requests[0].param("cmnamespace"), Some("0"));
        assert_eq!(requests[0].param("cmcontinue"), None);
        assert_eq!(requests[1].param("cmcontinue"), Some("page|B|2"));
        assert_eq!(requests[2].param("cmcontinue"), Some("page|D|4"));
    }

    #[test]
    fn cursor_is_lazy_and_restartable() {
        let mut transport = ScriptedTransport::default();
        let first_page = three_page_transport().responses.pop_front().expect("first page");
        transport.push(first_page);
        for response in three_page_transport().responses {
            transport.push(response);
        }
        let mut session = session(transport);
        let mut cursor = CategoryMembers::new("Category:Shinto shrines", &[]);

        let first = cursor.next_member(&mut session).expect("first").expect("member");
        assert_eq!(first.title, "Alpha");
        assert_eq!(session.client().transport().requests.len(), 1);

        cursor.restart();
        let mut titles = Vec::new();
        while let Some(member) = cursor.next_member(&mut session).expect("member") {
            titles.push(member.title);
        }
        assert_eq!(titles.len(), 5);
        assert_eq!(titles[0], "Alpha");
        assert!(cursor.next_member(&mut session).expect("done").is_none());
    }

    #[test]
    fn repeated_members_across_pages_are_yielded_once() {
        let mut transport = ScriptedTransport::default();
        transport.push_json(json!({
            "continue": {"cmcontinue": "next"},
            "query": {"categorymembers": [{"ns": 0, "title": "Alpha"}]}
        }));
        transport.push_json(json!({
            "query": {"categorymembers": [{"ns": 0, "title": "Alpha"}, {"ns": 0, "title": "Beta"}]}
        }));
        let mut session = session(transport);
        let titles = session
            .category_members("X", &[])
            .map(|member| member.expect("member").title)
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["Alpha", "Beta"]);
    }
}
