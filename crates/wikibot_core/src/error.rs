//! Failure taxonomy shared by the client, the session and the batch runner.
//!
//! MediaWiki reports failures as `{"error": {"code": ..., "info": ...}}`.
//! The code is kept verbatim so callers can branch on it; `ErrorKind`
//! groups codes by how the caller should react.

use std::fmt;

use thiserror::Error;

pub const CODE_EXHAUSTED_RETRIES: &str = "exhausted-retries";
pub const CODE_INVALID_JSON: &str = "invalid-json";
pub const CODE_INVALID_ENDPOINT: &str = "invalid-endpoint";

/// How a failure should be handled by whoever observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lag, rate limiting, 5xx, timeouts. Retry with backoff.
    Transient,
    /// CSRF token or login session no longer valid. Refresh once, retry once.
    TokenExpired,
    /// Someone else edited the page in between. Never retried blindly.
    Conflict,
    /// Only the current page is affected. Record and move on.
    ItemLocal,
    /// Credentials, endpoint or permissions are wrong. Stop the run.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::TokenExpired => "token_expired",
            Self::Conflict => "conflict",
            Self::ItemLocal => "item_local",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by (or synthesized on behalf of) a MediaWiki API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("MediaWiki API error [{code}]: {info}")]
pub struct ApiError {
    pub code: String,
    pub info: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            info: info.into(),
        }
    }

    pub fn http_status(status: u16) -> Self {
        Self::new(format!("http-{status}"), format!("HTTP status {status}"))
    }

    /// The configured URL does not answer like a MediaWiki API.
    pub fn invalid_endpoint(url: &str, detail: &str) -> Self {
        Self::new(CODE_INVALID_ENDPOINT, format!("{url} is not a usable API endpoint: {detail}"))
    }

    pub fn exhausted(attempts: usize, last: &str) -> Self {
        Self::new(
            CODE_EXHAUSTED_RETRIES,
            format!("gave up after {attempts} attempts; last failure: {last}"),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        if let Some(status) = self.code.strip_prefix("http-") {
            return match status.parse::<u16>() {
                Ok(408 | 429) => ErrorKind::Transient,
                Ok(status) if status >= 500 => ErrorKind::Transient,
                Ok(401 | 403) => ErrorKind::Fatal,
                _ => ErrorKind::ItemLocal,
            };
        }
        match self.code.as_str() {
            "maxlag" | "ratelimited" | "readonly" | "internal_api_error_DBQueryError"
            | CODE_INVALID_JSON => ErrorKind::Transient,
            "badtoken" | "notloggedin" | "assertuserfailed" | "assertbotfailed" => {
                ErrorKind::TokenExpired
            }
            "editconflict" => ErrorKind::Conflict,
            "permissiondenied" | "blocked" | "autoblocked" | "mwoauth-invalid-authorization"
            | "readapidenied" | "writeapidenied" | CODE_INVALID_ENDPOINT => ErrorKind::Fatal,
            _ => ErrorKind::ItemLocal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Login did not end in `result == "Success"`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("MediaWiki login failed for {username}: {reason}")]
pub struct AuthError {
    pub username: String,
    pub reason: String,
}

/// The request never produced an HTTP response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("HTTP transport failure: {message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// A statement IRI that cannot be turned into a statement GUID.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unexpected statement IRI form: {0}")]
pub struct GuidError(pub String);

/// Classify any error produced by this crate, looking through `anyhow` context layers.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    for cause in error.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            return api.kind();
        }
        if cause.downcast_ref::<AuthError>().is_some() {
            return ErrorKind::Fatal;
        }
        if let Some(transport) = cause.downcast_ref::<TransportError>() {
            return if transport.retryable {
                ErrorKind::Transient
            } else {
                ErrorKind::Fatal
            };
        }
    }
    ErrorKind::ItemLocal
}

/// The MediaWiki error code carried by `error`, if any.
pub fn api_error_code(error: &anyhow::Error) -> Option<&str> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ApiError>())
        .map(|api| api.code.as_str())
}
