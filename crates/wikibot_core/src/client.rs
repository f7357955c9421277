use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ApiError, CODE_INVALID_JSON, api_error_code};
use crate::retry::RetryPolicy;
use crate::transport::{FilePart, HttpMethod, HttpRequest, Transport};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    /// Sent as `maxlag` on every API call; `None` disables cooperative throttling.
    pub maxlag: Option<u32>,
    /// Sent as `assert` (`user` or `bot`) once a session exists.
    pub assert: Option<String>,
    pub rate_limit_read: Duration,
    pub rate_limit_write: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            maxlag: Some(5),
            assert: None,
            rate_limit_read: Duration::ZERO,
            rate_limit_write: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

/// One MediaWiki-family JSON endpoint plus the retry loop around it.
///
/// Holds no login state of its own; cookies live in the transport and tokens
/// in `WikiSession`.
pub struct HttpApiClient<T: Transport> {
    transport: T,
    config: ClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl<T: Transport> HttpApiClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            last_request_at: None,
            request_count: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn set_assert(&mut self, assert: Option<String>) {
        self.config.assert = assert;
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Call `action` with the configured retry policy.
    pub fn call(
        &mut self,
        action: &str,
        params: &[(&str, String)],
        method: HttpMethod,
    ) -> Result<Value> {
        let policy = self.config.retry;
        self.call_with_policy(action, params, method, &policy)
    }

    /// Single attempt; API errors come back exactly as the server sent them.
    pub fn call_once(
        &mut self,
        action: &str,
        params: &[(&str, String)],
        method: HttpMethod,
    ) -> Result<Value> {
        self.call_with_policy(action, params, method, &RetryPolicy::no_retry())
    }

    pub fn call_with_policy(
        &mut self,
        action: &str,
        params: &[(&str, String)],
        method: HttpMethod,
        policy: &RetryPolicy,
    ) -> Result<Value> {
        let request = self.api_request(action, params, method, None);
        self.execute(&request, policy, true)
            .with_context(|| format!("MediaWiki API action={action} failed"))
    }

    /// POST with a multipart file attached (`action=import`, uploads).
    pub fn call_with_file(
        &mut self,
        action: &str,
        params: &[(&str, String)],
        file: FilePart,
    ) -> Result<Value> {
        let request = self.api_request(action, params, HttpMethod::Post, Some(file));
        let policy = self.config.retry;
        self.execute(&request, &policy, true)
            .with_context(|| format!("MediaWiki API action={action} failed"))
    }

    /// Request against a non-API JSON endpoint (SPARQL), sharing the retry loop.
    pub fn call_url(&mut self, request: &HttpRequest) -> Result<Value> {
        let policy = self.config.retry;
        self.execute(request, &policy, false)
            .with_context(|| format!("request to {} failed", request.url))
    }

    fn api_request(
        &self,
        action: &str,
        params: &[(&str, String)],
        method: HttpMethod,
        file: Option<FilePart>,
    ) -> HttpRequest {
        let mut pairs = Vec::with_capacity(params.len() + 5);
        pairs.push(("action".to_string(), action.to_string()));
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        if let Some(maxlag) = self.config.maxlag {
            pairs.push(("maxlag".to_string(), maxlag.to_string()));
        }
        if let Some(assert) = &self.config.assert {
            pairs.push(("assert".to_string(), assert.clone()));
        }
        pairs.extend(
            params
                .iter()
                .map(|(key, value)| ((*key).to_string(), value.clone())),
        );

        let mut request = HttpRequest::new(method, self.config.api_url.clone());
        match method {
            HttpMethod::Get => request.query = pairs,
            HttpMethod::Post => request.form = pairs,
        }
        request.file = file;
        request
    }

    fn execute(
        &mut self,
        request: &HttpRequest,
        policy: &RetryPolicy,
        is_api: bool,
    ) -> Result<Value> {
        let attempts = policy.attempts();
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 1..=attempts {
            self.apply_rate_limit(request.method.is_write());
            let failure: anyhow::Error = match self.transport.send(request) {
                Err(error) if !error.retryable => return Err(error.into()),
                Err(error) => error.into(),
                Ok(response) if response.status == 404 => {
                    return Err(ApiError::invalid_endpoint(&request.url, "HTTP status 404").into());
                }
                Ok(response) if !response.is_success() => {
                    let error = ApiError::http_status(response.status);
                    if !error.is_retryable() {
                        return Err(error.into());
                    }
                    error.into()
                }
                Ok(response) => match serde_json::from_str::<Value>(&response.body) {
                    Err(error) => ApiError::new(
                        CODE_INVALID_JSON,
                        format!("response body is not JSON: {error}"),
                    )
                    .into(),
                    Ok(payload) => match is_api.then(|| extract_api_error(&payload)).flatten() {
                        None => return Ok(payload),
                        Some(error) if error.is_retryable() => error.into(),
                        Some(error) => return Err(error.into()),
                    },
                },
            };

            if attempt < attempts {
                let delay = policy.delay(attempt);
                warn!(
                    url = %request.url,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying after transient failure: {failure}"
                );
                sleep(delay);
            }
            last_error = Some(failure);
        }

        match last_error {
            Some(error) if attempts == 1 => Err(error),
            Some(error) if is_api && api_error_code(&error) == Some(CODE_INVALID_JSON) => {
                Err(ApiError::invalid_endpoint(&request.url, &error.to_string()).into())
            }
            Some(error) => Err(ApiError::exhausted(attempts, &error.to_string()).into()),
            None => Err(ApiError::exhausted(attempts, "no attempt was made").into()),
        }
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            self.config.rate_limit_write
        } else {
            self.config.rate_limit_read
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
        debug!(request = self.request_count, "sending API request");
    }
}

/// The `error` object of an API response, if the server reported one.
pub fn extract_api_error(payload: &Value) -> Option<ApiError> {
    let error = payload.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info");
    Some(ApiError::new(code, info))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ClientConfig, HttpApiClient};
    use crate::error::{ApiError, CODE_EXHAUSTED_RETRIES, CODE_INVALID_ENDPOINT, ErrorKind, TransportError};
    use crate::retry::RetryPolicy;
    use crate::testing::{ScriptedTransport, api_error_body};
    use crate::transport::{HttpMethod, HttpResponse};

    fn client(transport: ScriptedTransport, attempts: usize) -> HttpApiClient<ScriptedTransport> {
        let mut config = ClientConfig::new("https://wiki.example/w/api.php");
        config.retry = RetryPolicy::immediate(attempts);
        HttpApiClient::new(transport, config)
    }

    fn error_code(error: &anyhow::Error) -> String {
        crate::error::api_error_code(error)
            .expect("api error code")
            .to_string()
    }

    #[test]
    fn maxlag_forever_exhausts_exactly_max_attempts() {
        let transport = ScriptedTransport::repeating(HttpResponse::ok(
            api_error_body("maxlag", "Waiting for db: 7 seconds lagged").to_string(),
        ));
        let mut client = client(transport, 6);

        let error = client
            .call("query", &[("meta", "siteinfo".to_string())], HttpMethod::Get)
            .expect_err("must give up");

        assert_eq!(error_code(&error), CODE_EXHAUSTED_RETRIES);
        assert_eq!(client.transport().requests.len(), 6);
        assert_eq!(client.request_count(), 6);
    }

    #[test]
    fn success_on_attempt_k_stops_retrying() {
        let mut transport = ScriptedTransport::default();
        transport.push_json(api_error_body("maxlag", "lagged"));
        transport.push(Err(TransportError::retryable("connection reset")));
        transport.push(Ok(HttpResponse {
            status: 502,
            body: "<html>bad gateway</html>".to_string(),
        }));
        transport.push_json(json!({"query": {"general": {"sitename": "Shinto Wiki"}}}));
        let mut client = client(transport, 6);

        let payload = client
            .call("query", &[("meta", "siteinfo".to_string())], HttpMethod::Get)
            .expect("fourth attempt succeeds");

        assert_eq!(payload["query"]["general"]["sitename"], "Shinto Wiki");
        assert_eq!(client.transport().requests.len(), 4);
    }

    #[test]
    fn non_retryable_errors_surface_code_immediately() {
        let mut transport = ScriptedTransport::default();
        transport.push_json(api_error_body("permissiondenied", "You may not"));
        let mut client = client(transport, 6);

        let error = client
            .call("delete", &[("title", "Foo".to_string())], HttpMethod::Post)
            .expect_err("permission denied");

        assert_eq!(error_code(&error), "permissiondenied");
        assert_eq!(client.transport().requests.len(), 1);
    }

    #[test]
    fn call_once_does_not_retry_and_keeps_original_code() {
        let transport =
            ScriptedTransport::repeating(HttpResponse::ok(api_error_body("maxlag", "lagged").to_string()));
        let mut client = client(transport, 6);

        let error = client
            .call_once("query", &[], HttpMethod::Get)
            .expect_err("lagged");

        assert_eq!(error_code(&error), "maxlag");
        assert_eq!(client.transport().requests.len(), 1);
    }

    #[test]
    fn standard_parameters_are_attached() {
        let mut transport = ScriptedTransport::default();
        transport.push_json(json!({"edit": {"result": "Success"}}));
        let mut client = client(transport, 1);
        client.set_assert(Some("bot".to_string()));

        client
            .call(
                "edit",
                &[
                    ("title", "Foo".to_string()),
                    ("text", String::new()),
                ],
                HttpMethod::Post,
            )
            .expect("edit");

        let request = &client.transport().requests[0];
        assert!(request.query.is_empty());
        assert_eq!(request.param("action"), Some("edit"));
        assert_eq!(request.param("format"), Some("json"));
        assert_eq!(request.param("formatversion"), Some("2"));
        assert_eq!(request.param("maxlag"), Some("5"));
        assert_eq!(request.param("assert"), Some("bot"));
        assert_eq!(request.param("text"), Some(""));
    }

    #[test]
    fn not_found_endpoint_is_fatal_without_retry() {
        let transport = ScriptedTransport::repeating(HttpResponse {
            status: 404,
            body: "<html>Not Found</html>".to_string(),
        });
        let mut client = client(transport, 6);

        let error = client
            .call("query", &[], HttpMethod::Get)
            .expect_err("wrong endpoint");

        assert_eq!(error_code(&error), CODE_INVALID_ENDPOINT);
        assert_eq!(crate::error::classify_error(&error), ErrorKind::Fatal);
        assert_eq!(client.transport().requests.len(), 1);
    }

    #[test]
    fn html_from_api_endpoint_becomes_invalid_endpoint_after_retries() {
        let transport =
            ScriptedTransport::repeating(HttpResponse::ok("<!DOCTYPE html><title>Main Page</title>"));
        let mut client = client(transport, 3);

        let error = client
            .call("query", &[], HttpMethod::Get)
            .expect_err("html is not the API");

        assert_eq!(error_code(&error), CODE_INVALID_ENDPOINT);
        assert_eq!(client.transport().requests.len(), 3);
    }

    #[test]
    fn fatal_transport_error_is_not_retried() {
        let mut transport = ScriptedTransport::default();
        transport.push(Err(TransportError::fatal("invalid URL")));
        let mut client = client(transport, 6);

        let error = client
            .call("query", &[], HttpMethod::Get)
            .expect_err("invalid URL");
        assert!(error.chain().any(|cause| cause.is::<TransportError>()));
        assert!(!error.chain().any(|cause| cause.is::<ApiError>()));
        assert_eq!(client.transport().requests.len(), 1);
    }
}
