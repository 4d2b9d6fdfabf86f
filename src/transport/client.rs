//! Default [`Fetch`] implementation over a shared [`reqwest::Client`].
//!
//! `reqwest` owns connection pooling, TLS and transfer decoding; this module
//! only copies the status, headers and body into a [`RawResponse`] and caps
//! how much body it is willing to buffer.

use std::io;

use bytes::BytesMut;
use tracing::{debug, warn};
use url::Url;

use super::{Fetch, FetchFuture};
use crate::http::{Headers, RawResponse, RequestOptions, StatusCode};

/// Largest body the fetcher buffers before giving up (8 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 8 * 1024 * 1024;

/// Fetcher backed by a pooled [`reqwest::Client`].
///
/// # Examples
///
/// ```rust,no_run
/// use swrkit::transport::{HttpFetcher, TransportAdapter};
///
/// let adapter = TransportAdapter::new(HttpFetcher::new().max_response_size(1024 * 1024))
///     .base_url("https://api.example.com");
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_response_size: usize,
}

impl HttpFetcher {
    /// Creates a fetcher with a default client.
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Uses an existing client, e.g. one configured with proxies or root certificates.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }

    /// Caps the number of body bytes buffered per response.
    #[must_use]
    pub fn max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = bytes;
        self
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: String, request: RequestOptions) -> FetchFuture {
        let client = self.client.clone();
        let max = self.max_response_size;
        Box::pin(async move { send(&client, &url, &request, max).await })
    }
}

async fn send(client: &reqwest::Client, url: &str, request: &RequestOptions, max: usize) -> io::Result<RawResponse> {
    let url = Url::parse(url).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{url}: {e}")))?;
    let method = reqwest::Method::from_bytes(request.get_method().as_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut builder = client.request(method, url.clone());
    for (name, value) in request.headers().iter() {
        builder = builder.header(name, value);
    }
    if let Some(body) = request.get_body() {
        builder = builder.body(body.clone());
    }

    let mut response = builder.send().await.map_err(into_io)?;

    let status = StatusCode::from_u16(response.status().as_u16()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid status {}", response.status().as_u16()),
        )
    })?;

    if response.content_length().is_some_and(|length| length > max as u64) {
        warn!(url = %url, max, "response exceeds size limit");
        return Err(too_large(max));
    }

    let mut headers = Headers::with_capacity(response.headers().len());
    for (name, value) in response.headers() {
        match value.to_str() {
            Ok(value) => headers.insert(name.as_str(), value),
            Err(_) => debug!(url = %url, header = %name, "skipping non-text header"),
        }
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await.map_err(into_io)? {
        if body.len() + chunk.len() > max {
            warn!(url = %url, max, "response exceeds size limit");
            return Err(too_large(max));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(RawResponse::new(status).with_headers(headers).with_body(body.freeze()))
}

fn into_io(e: reqwest::Error) -> io::Error {
    if e.is_timeout() {
        io::Error::new(io::ErrorKind::TimedOut, e)
    } else {
        io::Error::other(e)
    }
}

fn too_large(max: usize) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("response body exceeds {max} bytes"))
}
