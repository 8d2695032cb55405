//! Transport capability and its HTTP implementation
//!
//! The dispatch queue hands each request to a [`Transport`] and waits for
//! exactly one result. [`HttpTransport`] performs the call with reqwest.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::config::TrackerConfig;
use crate::error::{Error, Result, TransportError};
use crate::request::Request;

/// Performs a request and produces its typed result.
///
/// Implementations must resolve every call exactly once.
#[async_trait]
pub trait Transport<R: Request>: Send + Sync + 'static {
    /// Send `request` and return the parsed response or a transport failure
    async fn send(&self, request: &R) -> std::result::Result<R::Response, TransportError>;
}

/// HTTP transport backed by a shared reqwest client
#[derive(Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport using the tracker's timeout
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("beacon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    /// Wrap an existing client
    pub fn from_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl<R: Request> Transport<R> for HttpTransport {
    async fn send(&self, request: &R) -> std::result::Result<R::Response, TransportError> {
        let url = request.url();

        let mut builder = self
            .http_client
            .request(request.method(), &url)
            .header(CONTENT_TYPE, request.content_type());

        let query = request.query_parameters();
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        for (name, value) in request.header_fields() {
            builder = builder.header(name, value);
        }

        if let Some(body) = request.build_body()? {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        request.check_status(status)?;

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        request.parse(&body, status)
    }
}

/// Map reqwest failures onto the transport taxonomy
fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_builder() {
        TransportError::InvalidRequest(error.to_string())
    } else if error.is_decode() || error.is_body() {
        TransportError::Decode(error.to_string())
    } else {
        TransportError::Network(error.to_string())
    }
}
