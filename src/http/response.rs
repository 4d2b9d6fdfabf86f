//! Raw HTTP responses as returned by a fetcher.
//!
//! A [`RawResponse`] is what the injected network primitive hands back before
//! the transport adapter maps it to a typed success or a
//! [`FetchError`](crate::FetchError). The default fetcher copies one out of a
//! `reqwest` response; test fetchers build one with the fluent setters.

use bytes::Bytes;

use super::{Headers, StatusCode};

/// A response from the network primitive: status, headers and body bytes.
///
/// # Examples
///
/// ```
/// use swrkit::http::{RawResponse, StatusCode};
///
/// let response = RawResponse::new(StatusCode::OK)
///     .json(&serde_json::json!({ "id": 42 }));
///
/// assert!(response.status().is_success());
/// assert_eq!(response.headers().get("content-type"), Some("application/json"));
/// assert_eq!(response.body().as_ref(), br#"{"id":42}"#);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl RawResponse {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a response header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces every header at once.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the body from raw bytes.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and the matching `Content-Type` header.
    #[must_use]
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.headers.set("Content-Type", "application/json");
        self.body = Bytes::from(value.to_string());
        self
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
