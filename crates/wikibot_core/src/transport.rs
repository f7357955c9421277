use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Post)
    }
}

/// A file attached to a POST as multipart form data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub file: Option<FilePart>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            form: Vec::new(),
            headers: Vec::new(),
            file: None,
        }
    }

    /// Value of a parameter wherever it was placed (query string or form body).
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .chain(self.form.iter())
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one HTTP request. Implementations must not retry on their own.
pub trait Transport {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking `reqwest` transport with a cookie jar, so login sessions persist.
pub struct ReqwestTransport {
    client: Client,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }

    fn build(&self, request: &HttpRequest) -> Result<RequestBuilder, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|error| TransportError::fatal(format!("invalid URL {}: {error}", request.url)))?;
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };
        builder = builder.header("User-Agent", self.user_agent.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        match &request.file {
            Some(file) => {
                let part = Part::bytes(file.bytes.clone())
                    .file_name(file.filename.clone())
                    .mime_str(&file.mime)
                    .map_err(|error| {
                        TransportError::fatal(format!("invalid mime type {}: {error}", file.mime))
                    })?;
                let mut form = Form::new();
                for (key, value) in &request.form {
                    form = form.text(key.clone(), value.clone());
                }
                builder = builder.multipart(form.part(file.field.clone(), part));
            }
            None if !request.form.is_empty() => {
                builder = builder.form(&request.form);
            }
            None => {}
        }
        Ok(builder)
    }
}

impl Transport for ReqwestTransport {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self.build(request)?.send().map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(map_reqwest_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    let retryable =
        error.is_timeout() || error.is_connect() || error.is_request() || error.is_body();
    TransportError {
        message: error.to_string(),
        retryable,
    }
}
