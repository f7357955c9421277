//! Scripted transport used by unit tests in place of the network.

use std::collections::VecDeque;

use serde_json::{Value, json};

use crate::error::TransportError;
use crate::transport::{HttpRequest, HttpResponse, Transport};

#[derive(Default)]
pub struct ScriptedTransport {
    pub responses: VecDeque<Result<HttpResponse, TransportError>>,
    pub fallback: Option<HttpResponse>,
    pub requests: Vec<HttpRequest>,
}

impl ScriptedTransport {
    pub fn repeating(response: HttpResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::default()
        }
    }

    pub fn push(&mut self, response: Result<HttpResponse, TransportError>) {
        self.responses.push_back(response);
    }

    pub fn push_json(&mut self, body: Value) {
        self.push(Ok(HttpResponse::ok(body.to_string())));
    }

    /// Requests whose `action` parameter equals `action`.
    pub fn requests_for(&self, action: &str) -> Vec<&HttpRequest> {
        self.requests
            .iter()
            .filter(|request| request.param("action") == Some(action))
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.push(request.clone());
        if let Some(next) = self.responses.pop_front() {
            return next;
        }
        match &self.fallback {
            Some(response) => Ok(response.clone()),
            None => Err(TransportError::fatal(format!(
                "no scripted response left for request #{}",
                self.requests.len()
            ))),
        }
    }
}

pub fn api_error_body(code: &str, info: &str) -> Value {
    json!({"error": {"code": code, "info": info}})
}

pub fn csrf_token_body(token: &str) -> Value {
    json!({"query": {"tokens": {"csrftoken": token}}})
}

pub fn login_token_body(token: &str) -> Value {
    json!({"query": {"tokens": {"logintoken": token}}})
}

pub fn revision_body(title: &str, content: &str, revid: i64) -> Value {
    json!({
        "query": {
            "pages": [{
                "pageid": 7,
                "ns": 0,
                "title": title,
                "revisions": [{
                    "revid": revid,
                    "timestamp": "2025-06-01T00:00:00Z",
                    "slots": {"main": {"content": content}}
                }]
            }]
        }
    })
}

pub fn missing_page_body(title: &str) -> Value {
    json!({"query": {"pages": [{"ns": 0, "title": title, "missing": true}]}})
}
