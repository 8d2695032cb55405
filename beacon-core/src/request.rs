//! Request abstraction handed to a [`Transport`](crate::transport::Transport)
//!
//! A request describes one HTTP call: where it goes, what it carries and how
//! its response is interpreted. The dispatch queue never looks inside; it only
//! moves requests from producers to the transport in order.

use reqwest::{Method, StatusCode};

use crate::error::TransportError;

/// One unit of work for the transport.
pub trait Request: Send + Sync + 'static {
    /// Typed result of a successful call
    type Response: Send + 'static;

    /// Identifier used in logs
    fn request_id(&self) -> &str;

    /// Scheme and host, without a trailing path (e.g., `https://collect.example.com`)
    fn base_url(&self) -> &str;

    /// Path appended to the base URL
    fn path(&self) -> &str;

    /// HTTP method
    fn method(&self) -> Method {
        Method::POST
    }

    /// Query string pairs
    fn query_parameters(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Extra header fields
    fn header_fields(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Value of the `Content-Type` header
    fn content_type(&self) -> &str {
        "application/json"
    }

    /// Serialize the request body, if any
    fn build_body(&self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Decide whether a status code is acceptable before parsing
    fn check_status(&self, status: StatusCode) -> Result<(), TransportError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                code: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            })
        }
    }

    /// Decode the response body
    fn parse(&self, body: &[u8], status: StatusCode) -> Result<Self::Response, TransportError>;

    /// Full URL of the request
    fn url(&self) -> String {
        format!("{}{}", self.base_url().trim_end_matches('/'), self.path())
    }
}
