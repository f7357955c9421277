use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::WikiSession;
use crate::transport::{HttpMethod, HttpRequest, Transport};

pub const DEFAULT_SPARQL_ENDPOINT: &str = "https://query.wikidata.org/sparql";
const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// One bound value in a SPARQL JSON result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparqlValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(default, rename = "xml:lang", skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl SparqlValue {
    pub fn is_uri(&self) -> bool {
        self.kind == "uri"
    }

    /// `Q42` for `http://www.wikidata.org/entity/Q42`.
    pub fn entity_id(&self) -> Option<&str> {
        if !self.is_uri() {
            return None;
        }
        self.value
            .split_once("/entity/")
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.contains('/'))
    }
}

pub type SparqlRow = BTreeMap<String, SparqlValue>;

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<SparqlRow>,
}

impl<T: Transport> WikiSession<T> {
    /// POST a query to a SPARQL endpoint and return its bindings.
    ///
    /// Goes through the client's retry loop; query-service timeouts (5xx)
    /// are retried like any other transient failure.
    pub fn run_sparql(&mut self, endpoint: &str, query: &str) -> Result<Vec<SparqlRow>> {
        let mut request = HttpRequest::new(HttpMethod::Post, endpoint);
        request.form.push(("query".to_string(), query.to_string()));
        request
            .headers
            .push(("Accept".to_string(), SPARQL_RESULTS_JSON.to_string()));
        let payload = self.client_mut().call_url(&request)?;
        let response: SparqlResponse = serde_json::from_value(payload)
            .context("SPARQL endpoint returned an unexpected document")?;
        debug!(rows = response.results.bindings.len(), "SPARQL query finished");
        Ok(response.results.bindings)
    }
}

/// Walks a query in `LIMIT`/`OFFSET` windows until a short page comes back.
///
/// The query must not carry its own `LIMIT` or `OFFSET`, and should have an
/// `ORDER BY` for the windows to be stable.
#[derive(Debug, Clone)]
pub struct SparqlPager {
    endpoint: String,
    query: String,
    page_size: usize,
    offset: usize,
    done: bool,
}

impl SparqlPager {
    pub fn new(endpoint: impl Into<String>, query: impl Into<String>, page_size: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: query.into(),
            page_size: page_size.max(1),
            offset: 0,
            done: false,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn next_page<T: Transport>(
        &mut self,
        session: &mut WikiSession<T>,
    ) -> Result<Option<Vec<SparqlRow>>> {
        if self.done {
            return Ok(None);
        }
        let windowed = format!(
            "{}\nLIMIT {}\nOFFSET {}",
            self.query.trim_end(),
            self.page_size,
            self.offset
        );
        let rows = session.run_sparql(&self.endpoint, &windowed)?;
        self.offset += rows.len();
        if rows.len() < self.page_size {
            self.done = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows))
    }

    /// Every row of every window.
    pub fn collect_all<T: Transport>(mut self, session: &mut WikiSession<T>) -> Result<Vec<SparqlRow>> {
        let mut rows = Vec::new();
        while let Some(page) = self.next_page(session)? {
            rows.extend(page);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::SparqlPager;
    use crate::client::{ClientConfig, HttpApiClient};
    use crate::retry::RetryPolicy;
    use crate::session::WikiSession;
    use crate::testing::ScriptedTransport;
    use crate::transport::HttpResponse;

    const ENDPOINT: &str = "https://query.example/sparql";

    fn session(transport: ScriptedTransport) -> WikiSession<ScriptedTransport> {
        let mut config = ClientConfig::new("https://www.wikidata.org/w/api.php");
        config.retry = RetryPolicy::immediate(3);
        WikiSession::new(HttpApiClient::new(transport, config))
    }

    fn bindings(ids: &[&str]) -> serde_json::Value {
        let rows = ids
            .iter()
            .map(|id| json!({"item": {"type": "uri", "value": format!("http://www.wikidata.org/entity/{id}")}}))
            .collect::<Vec<_>>();
        json!({"head": {"vars": ["item"]}, "results": {"bindings": rows}})
    }

    #[test]
    fn query_is_posted_with_results_accept_header() {
        let mut transport = ScriptedTransport::default();
        transport.push_json(json!({
            "head": {"vars": ["item", "label"]},
            "results": {"bindings": [{
                "item": {"type": "uri", "value": "http://www.wikidata.org/entity/Q42"},
                "label": {"type": "literal", "value": "Douglas Adams", "xml:lang": "en"}
            }]}
        }));
        let mut session = session(transport);

        let rows = session
            .run_sparql(ENDPOINT, "SELECT ?item ?label WHERE { }")
            .expect("rows");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["item"].entity_id(), Some("Q42"));
        assert_eq!(rows[0]["label"].lang.as_deref(), Some("en"));
        assert_eq!(rows[0]["label"].entity_id(), None);
        let request = &session.client().transport().requests[0];
        assert_eq!(request.url, ENDPOINT);
        assert_eq!(request.param("query"), Some("SELECT ?item ?label WHERE { }"));
        assert!(request.param("maxlag").is_none());
        assert!(
            request
                .headers
                .iter()
                .any(|(name, value)| name == "Accept" && value == "application/sparql-results+json")
        );
    }

    #[test]
    fn query_service_timeout_is_retried() {
        let mut transport = ScriptedTransport::default();
        transport.push(Ok(HttpResponse {
            status: 504,
            body: "upstream timeout".to_string(),
        }));
        transport.push_json(bindings(&["Q1"]));
        let mut session = session(transport);

        let rows = session.run_sparql(ENDPOINT, "SELECT ?item WHERE { }").expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(session.client().transport().requests.len(), 2);
    }

    #[test]
    fn pager_stops_on_short_window() {
        let mut transport = ScriptedTransport::default();
        transport.push_json(bindings(&["Q1", "Q2"]));
        transport.push_json(bindings(&["Q3", "Q4"]));
        transport.push_json(bindings(&["Q5"]));
        let mut session = session(transport);

        let rows = SparqlPager::new(ENDPOINT, "SELECT ?item WHERE { } ORDER BY ?item", 2)
            .collect_all(&mut session)
            .expect("rows");

        assert_eq!(rows.len(), 5);
        let requests = &session.client().transport().requests;
        assert_eq!(requests.len(), 3);
        assert!(requests[0].param("query").expect("q").ends_with("LIMIT 2\nOFFSET 0"));
        assert!(requests[2].param("query").expect("q").ends_with("LIMIT 2\nOFFSET 4"));
    }

    #[test]
    fn pager_handles_exact_multiple() {
        let mut transport = ScriptedTransport::default();
        transport.push_json(bindings(&["Q1", "Q2"]));
        transport.push_json(bindings(&[]));
        let mut session = session(transport);
        let mut pager = SparqlPager::new(ENDPOINT, "SELECT ?item WHERE { }", 2);

        assert_eq!(pager.next_page(&mut session).expect("page").map(|rows| rows.len()), Some(2));
        assert!(pager.next_page(&mut session).expect("page").is_none());
        assert!(pager.next_page(&mut session).expect("page").is_none());
        assert_eq!(pager.offset(), 2);
        assert_eq!(session.client().transport().requests.len(), 2);
    }
}
