//! Transport adapter — the only component that touches the network.
//!
//! The network primitive itself is injected through the [`Fetch`] trait, so
//! the cache can run against [`HttpFetcher`], a platform client, or a
//! closure in tests. The adapter:
//!
//! 1. joins a configured base URL with the resolved key,
//! 2. decorates the request with [`Credentials`],
//! 3. enforces a timeout,
//! 4. maps the [`RawResponse`] to `Ok(T)` or a [`FetchError`].
//!
//! Nothing is thrown past this boundary: transport failures, non-2xx
//! statuses and undecodable payloads all come back as the `Err` arm.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::FetchError;
use crate::http::{Headers, RawResponse, RequestOptions};

pub mod client;

pub use client::HttpFetcher;

/// Default per-request timeout when neither the store nor the request sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Boxed future returned by a [`Fetch`] implementation.
pub type FetchFuture = Pin<Box<dyn Future<Output = io::Result<RawResponse>> + Send>>;

/// The injectable network primitive.
///
/// Receives a fully resolved URL and the decorated request options, performs
/// one network call and returns the raw response. Any
/// `Fn(String, RequestOptions) -> impl Future<Output = io::Result<RawResponse>>`
/// closure implements it.
///
/// # Examples
///
/// ```rust,no_run
/// use swrkit::http::{RawResponse, RequestOptions, StatusCode};
/// use swrkit::transport::TransportAdapter;
///
/// let adapter = TransportAdapter::new(|url: String, _req: RequestOptions| async move {
///     Ok::<_, std::io::Error>(RawResponse::new(StatusCode::OK).json(&serde_json::json!({ "url": url })))
/// });
/// ```
pub trait Fetch: Send + Sync + 'static {
    fn fetch(&self, url: String, request: RequestOptions) -> FetchFuture;
}

impl<F, Fut> Fetch for F
where
    F: Fn(String, RequestOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<RawResponse>> + Send + 'static,
{
    fn fetch(&self, url: String, request: RequestOptions) -> FetchFuture {
        Box::pin((self)(url, request))
    }
}

/// Decorates outgoing requests with credentials supplied by the
/// authentication collaborator.
pub trait Credentials: Send + Sync + 'static {
    fn decorate(&self, headers: &mut Headers);
}

/// Bearer-token credentials with an optional channel id.
///
/// # Examples
///
/// ```
/// use swrkit::http::Headers;
/// use swrkit::transport::{BearerCredentials, Credentials};
///
/// let creds = BearerCredentials::new("t0ken").channel_id("general");
/// let mut headers = Headers::new();
/// creds.decorate(&mut headers);
///
/// assert_eq!(headers.get("authorization"), Some("Bearer t0ken"));
/// assert_eq!(headers.get("x-channel-id"), Some("general"));
/// ```
#[derive(Debug, Clone)]
pub struct BearerCredentials {
    token: String,
    channel_id: Option<String>,
}

impl BearerCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            channel_id: None,
        }
    }

    #[must_use]
    pub fn channel_id(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}

impl Credentials for BearerCredentials {
    fn decorate(&self, headers: &mut Headers) {
        headers.set("Authorization", format!("Bearer {}", self.token));
        if let Some(channel) = &self.channel_id {
            headers.set("X-Channel-Id", channel.as_str());
        }
    }
}

/// Wraps the injected [`Fetch`] primitive and maps its responses to typed results.
#[derive(Clone)]
pub struct TransportAdapter {
    fetcher: Arc<dyn Fetch>,
    credentials: Option<Arc<dyn Credentials>>,
    base_url: Option<String>,
    timeout: Duration,
}

impl TransportAdapter {
    /// Creates an adapter around `fetcher` with no credentials and no base URL.
    pub fn new(fetcher: impl Fetch) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            credentials: None,
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Attaches a credential decorator applied to every request.
    #[must_use]
    pub fn credentials(mut self, credentials: impl Credentials) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    /// Sets the base URL that path keys (`/projects/42`) are resolved against.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_owned());
        self
    }

    /// Sets the default timeout; a request's own timeout takes precedence.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves `key` to the URL handed to the fetcher.
    ///
    /// Absolute keys (containing `://`) are used as-is; anything else is
    /// appended to the base URL when one is configured.
    pub fn resolve_url(&self, key: &str) -> String {
        match &self.base_url {
            Some(base) if !key.contains("://") => {
                if key.starts_with('/') {
                    format!("{base}{key}")
                } else {
                    format!("{base}/{key}")
                }
            }
            _ => key.to_owned(),
        }
    }

    /// Performs one network call for `key` and decodes the JSON body as `T`.
    ///
    /// An empty successful body decodes as JSON `null`, so `T = ()` or
    /// `Option<_>` accept `204 No Content`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`] — the fetcher failed or the timeout elapsed.
    /// - [`FetchError::Auth`] — the server answered `401` or `407`.
    /// - [`FetchError::Http`] — any other non-2xx status.
    /// - [`FetchError::Parse`] — a 2xx body that does not decode as `T`.
    pub async fn fetch_resource<T>(&self, key: &str, request: &RequestOptions) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        let url = self.resolve_url(key);
        let mut request = request.clone();
        if !request.headers().contains("accept") {
            request.headers_mut().insert("Accept", "application/json");
        }
        if let Some(credentials) = &self.credentials {
            credentials.decorate(request.headers_mut());
        }
        let timeout = request.get_timeout().unwrap_or(self.timeout);

        debug!(url = %url, method = %request.get_method(), "fetching resource");

        let response = match tokio::time::timeout(timeout, self.fetcher.fetch(url.clone(), request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(FetchError::network(e)),
            Err(_) => {
                return Err(FetchError::Network {
                    message: format!("request to {url} timed out after {timeout:?}"),
                });
            }
        };

        debug!(url = %url, status = %response.status(), "resource response");
        decode(response)
    }
}

/// Maps a raw response to the typed success or the matching failure variant.
fn decode<T: DeserializeOwned>(response: RawResponse) -> Result<T, FetchError> {
    let status = response.status();
    if status.is_success() {
        let body: &[u8] = if response.body().is_empty() {
            b"null"
        } else {
            response.body()
        };
        return serde_json::from_slice(body).map_err(FetchError::parse);
    }

    let payload = error_payload(response.body());
    if status.is_auth_failure() {
        Err(FetchError::Auth { status, payload })
    } else {
        Err(FetchError::Http { status, payload })
    }
}

/// Parses an error body as JSON, falling back to the raw text.
fn error_payload(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body)
        .ok()
        .or_else(|| Some(Value::String(String::from_utf8_lossy(body).into_owned())))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::Deserialize;

    use super::*;
    use crate::http::StatusCode;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Project {
        id: u32,
        title: String,
    }

    fn responding(response: RawResponse) -> TransportAdapter {
        TransportAdapter::new(move |_url: String, _req: RequestOptions| {
            let response = response.clone();
            async move { Ok::<_, io::Error>(response) }
        })
    }

    #[tokio::test]
    async fn decodes_success_body() {
        let adapter = responding(
            RawResponse::new(StatusCode::OK).json(&serde_json::json!({ "id": 42, "title": "A" })),
        );
        let project: Project = adapter
            .fetch_resource("/projects/42", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(project, Project { id: 42, title: "A".into() });
    }

    #[tokio::test]
    async fn unauthorized_is_tagged_as_auth() {
        let adapter = responding(
            RawResponse::new(StatusCode::UNAUTHORIZED).json(&serde_json::json!({ "error": "expired" })),
        );
        let err = adapter
            .fetch_resource::<Project>("/me", &RequestOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(err.payload().unwrap()["error"], "expired");
    }

    #[tokio::test]
    async fn other_failures_carry_status_and_text_payload() {
        let adapter = responding(RawResponse::new(StatusCode::BAD_GATEWAY).with_body("upstream down"));
        let err = adapter
            .fetch_resource::<Project>("/p", &RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(err.payload(), Some(&Value::String("upstream down".into())));
    }

    #[tokio::test]
    async fn undecodable_body_is_a_parse_error() {
        let adapter = responding(RawResponse::new(StatusCode::OK).with_body("{not json"));
        let err = adapter
            .fetch_resource::<Project>("/p", &RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }));
    }

    #[tokio::test]
    async fn empty_success_decodes_as_null() {
        let adapter = responding(RawResponse::new(StatusCode::NO_CONTENT));
        let value: Option<Project> = adapter
            .fetch_resource("/p", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn transport_failure_is_a_network_error() {
        let adapter = TransportAdapter::new(|_url: String, _req: RequestOptions| async {
            Err::<RawResponse, _>(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        });
        let err = adapter
            .fetch_resource::<Project>("/p", &RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out() {
        let adapter = TransportAdapter::new(|_url: String, _req: RequestOptions| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, io::Error>(RawResponse::new(StatusCode::OK))
        })
        .timeout(Duration::from_secs(1));
        let err = adapter
            .fetch_resource::<Option<Project>>("/p", &RequestOptions::new())
            .await
            .unwrap_err();
        match err {
            FetchError::Network { message } => assert!(message.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn decorates_and_resolves_against_base_url() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let adapter = TransportAdapter::new(move |url: String, req: RequestOptions| {
            *sink.lock().unwrap() = Some((url, req));
            async { Ok::<_, io::Error>(RawResponse::new(StatusCode::OK).with_body("1")) }
        })
        .base_url("http://api.local/")
        .credentials(BearerCredentials::new("abc").channel_id("ops"));

        let _: u32 = adapter
            .fetch_resource("/projects/42", &RequestOptions::new().header("Authorization", "stale"))
            .await
            .unwrap();

        let (url, req) = seen.lock().unwrap().take().unwrap();
        assert_eq!(url, "http://api.local/projects/42");
        assert_eq!(req.headers().get("authorization"), Some("Bearer abc"));
        assert_eq!(req.headers().get_all("authorization").count(), 1);
        assert_eq!(req.headers().get("x-channel-id"), Some("ops"));
        assert_eq!(req.headers().get("accept"), Some("application/json"));
    }

    #[test]
    fn absolute_keys_bypass_base_url() {
        let adapter = responding(RawResponse::new(StatusCode::OK)).base_url("http://api.local");
        assert_eq!(adapter.resolve_url("http://other/x"), "http://other/x");
        assert_eq!(adapter.resolve_url("projects"), "http://api.local/projects");
    }
}
