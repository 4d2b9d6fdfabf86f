//! Per-request options handed to the transport.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use super::{Headers, Method};

/// The options bag for a single fetch: method, headers, body and an optional
/// timeout override.
///
/// Consumers attach these to a resource; the transport adapter clones them,
/// decorates the headers with credentials and hands them to the fetcher.
///
/// # Examples
///
/// ```
/// use swrkit::http::{Method, RequestOptions};
///
/// let options = RequestOptions::new()
///     .method(Method::Post)
///     .header("X-Request-Id", "abc-123")
///     .body("{}");
///
/// assert_eq!(options.get_method(), &Method::Post);
/// assert_eq!(options.headers().get("x-request-id"), Some("abc-123"));
/// assert_eq!(options.get_body().map(|b| b.len()), Some(2));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    method: Method,
    headers: Headers,
    body: Option<Bytes>,
    timeout: Option<Duration>,
}

impl RequestOptions {
    /// Creates a `GET` request with no headers and no body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a request header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the raw request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the JSON request body and sets `Content-Type`.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json::Error`] if `value` cannot be serialized.
    pub fn json<B: Serialize>(mut self, value: &B) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_vec(value)?;
        self.headers.set("Content-Type", "application/json");
        self.body = Some(Bytes::from(encoded));
        Ok(self)
    }

    /// Overrides the transport's default timeout for this request.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the request method.
    pub fn get_method(&self) -> &Method {
        &self.method
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request headers for in-place decoration.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the request body, if one was set.
    pub fn get_body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Returns the per-request timeout override, if any.
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_bodyless_get() {
        let options = RequestOptions::new();
        assert_eq!(options.get_method(), &Method::Get);
        assert!(options.headers().is_empty());
        assert!(options.get_body().is_none());
        assert!(options.get_timeout().is_none());
    }

    #[test]
    fn json_body_sets_content_type() {
        let options = RequestOptions::new()
            .header("content-type", "text/plain")
            .json(&serde_json::json!({ "title": "A" }))
            .unwrap();
        assert_eq!(options.headers().get("Content-Type"), Some("application/json"));
        assert_eq!(options.headers().len(), 1);
        assert_eq!(options.get_body().unwrap().as_ref(), br#"{"title":"A"}"#);
    }
}
