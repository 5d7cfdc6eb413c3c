//! HTTP client seam.
//!
//! Engines never talk to `reqwest` directly: they build an [`HttpRequest`],
//! hand it to an [`HttpClient`], and get back an [`HttpResponse`]. Tests swap
//! in mock servers; hosts may plug in their own transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default timeout for outgoing calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// Upper-case method name, as used in OAuth1 base strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Whether requests with this method carry a form body.
    pub fn has_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body.
#[derive(Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),

    /// Pre-encoded body with an explicit content type.
    Raw { content_type: String, data: String },
}

impl RequestBody {
    /// Encode the body, returning content type and payload.
    pub fn encode(&self) -> (String, String) {
        match self {
            Self::Form(pairs) => (
                "application/x-www-form-urlencoded".to_string(),
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish(),
            ),
            Self::Raw { content_type, data } => (content_type.clone(), data.clone()),
        }
    }
}

/// An outgoing HTTP request.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl HttpRequest {
    /// Create a request without headers or body.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// Create a POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// Set a header, replacing any existing value with the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Set a form body.
    pub fn with_form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(pairs));
        self
    }

    /// Set a header in place, replacing any existing value (case-insensitive).
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    /// Get a header value (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Form pairs of the body, if it is a form.
    pub fn form(&self) -> Option<&[(String, String)]> {
        match &self.body {
            Some(RequestBody::Form(pairs)) => Some(pairs),
            _ => None,
        }
    }
}

// Header values, query strings and form values may carry credentials.
impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let url = self.url.split('?').next().unwrap_or_default();
        let headers: Vec<&str> = self.headers.iter().map(|(n, _)| n.as_str()).collect();
        let body = match &self.body {
            None => None,
            Some(RequestBody::Form(pairs)) => Some(format!("form({} fields)", pairs.len())),
            Some(RequestBody::Raw { content_type, .. }) => Some(content_type.clone()),
        };
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &url)
            .field("headers", &headers)
            .field("body", &body)
            .finish()
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// Create a response with no headers.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Get a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }
}

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The call did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Connection, TLS or protocol failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The request could not be built (bad URL, bad header).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

/// A resource call that did not produce a 2xx response.
///
/// Carries the raw response so callers can inspect it. `status` is `None`
/// when the call never got a response (timeout, connection failure).
#[derive(Debug, Clone, Error)]
#[error("request failed: {message}")]
pub struct RequestError {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub message: String,
}

impl RequestError {
    /// Build from a non-2xx response.
    pub fn from_response(response: HttpResponse) -> Self {
        Self {
            status: Some(response.status),
            message: format!("HTTP {}", response.status),
            headers: response.headers,
            body: response.body,
        }
    }

    /// Whether the provider answered 401.
    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }
}

impl From<HttpError> for RequestError {
    fn from(error: HttpError) -> Self {
        Self {
            status: None,
            headers: BTreeMap::new(),
            body: String::new(),
            message: error.to_string(),
        }
    }
}

/// Sends HTTP requests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send a request and return the response, whatever its status.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Configuration for [`ReqwestClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,

    /// Skip TLS certificate verification. Only for legacy providers.
    pub accept_invalid_certs: bool,

    /// User-Agent header sent with every call.
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            accept_invalid_certs: false,
            user_agent: format!("keyward/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Build a client from configuration.
    pub fn new(config: &HttpClientConfig) -> Result<Self, HttpError> {
        if config.accept_invalid_certs {
            tracing::warn!("TLS certificate verification disabled for outgoing calls");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| HttpError::Transport {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let url = reqwest::Url::parse(&request.url).map_err(|e| HttpError::InvalidRequest {
            message: format!("invalid URL: {}", e),
        })?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            let (content_type, data) = body.encode();
            if request.header("content-type").is_none() {
                builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
            }
            builder = builder.body(data);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(map_reqwest_error)?;

        tracing::debug!(
            "{} {} -> {}",
            request.method,
            request.url.split('?').next().unwrap_or_default(),
            status
        );

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout
    } else if error.is_builder() {
        HttpError::InvalidRequest {
            message: error.without_url().to_string(),
        }
    } else {
        // URLs may carry credentials in the query string.
        HttpError::Transport {
            message: error.without_url().to_string(),
        }
    }
}
