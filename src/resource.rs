//! The consumer-facing surface: bind a key, read its state, revalidate.
//!
//! A [`Resource`] is one consumer's binding to a key in a [`Cache`]. It owns
//! a [`Subscription`], so dropping the resource unsubscribes, and it exposes
//! the entry through [`ResourceState`] with the consumer's own
//! `initial_data` as a fallback. [`PagedResource`] adds `load_more` for keys
//! whose data is a [`Page`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, Settled, Status};
use crate::error::{ConfigurationError, FetchError};
use crate::http::RequestOptions;
use crate::key::ResourceKey;
use crate::pagination::{Identified, Page};
use crate::registry::Listener;
use crate::scheduler::Policy;
use crate::store::{Cache, CacheValue, Subscription};

/// Callback invoked with the error whenever the bound entry settles as failed.
pub type ErrorCallback = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Per-consumer options.
///
/// Unset revalidation flags fall back to the store's [`CacheConfig`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use swrkit::ResourceOptions;
/// use swrkit::http::RequestOptions;
///
/// let options = ResourceOptions::<Vec<String>>::new()
///     .refresh_interval(Duration::from_secs(30))
///     .revalidate_on_focus(false)
///     .initial_data(Vec::new())
///     .request_options(RequestOptions::new().header("X-Team", "core"))
///     .on_error(|e| eprintln!("refresh failed: {e}"));
/// ```
#[derive(Clone)]
pub struct ResourceOptions<T> {
    enabled: bool,
    revalidate_on_focus: Option<bool>,
    revalidate_on_mount: Option<bool>,
    refresh_interval: Option<Duration>,
    initial_data: Option<T>,
    request_options: RequestOptions,
    on_error: Option<ErrorCallback>,
}

impl<T> Default for ResourceOptions<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            revalidate_on_focus: None,
            revalidate_on_mount: None,
            refresh_interval: None,
            initial_data: None,
            request_options: RequestOptions::new(),
            on_error: None,
        }
    }
}

impl<T> fmt::Debug for ResourceOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceOptions")
            .field("enabled", &self.enabled)
            .field("revalidate_on_focus", &self.revalidate_on_focus)
            .field("revalidate_on_mount", &self.revalidate_on_mount)
            .field("refresh_interval", &self.refresh_interval)
            .field("has_initial_data", &self.initial_data.is_some())
            .field("request_options", &self.request_options)
            .field("has_on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<T> ResourceOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// When `false` the key is treated as absent: nothing is fetched or stored.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn revalidate_on_focus(mut self, revalidate: bool) -> Self {
        self.revalidate_on_focus = Some(revalidate);
        self
    }

    #[must_use]
    pub fn revalidate_on_mount(mut self, revalidate: bool) -> Self {
        self.revalidate_on_mount = Some(revalidate);
        self
    }

    /// Revalidates periodically while subscribed. `Duration::ZERO` opts out
    /// of the store-wide default.
    #[must_use]
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Data reported while the entry has none. Never written to the cache.
    #[must_use]
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Headers, method and body used when this consumer's key is fetched.
    ///
    /// Only the first subscriber of a key supplies the options.
    #[must_use]
    pub fn request_options(mut self, request: RequestOptions) -> Self {
        self.request_options = request;
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FetchError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    fn policy(&self, config: &CacheConfig) -> Policy {
        let defaults = config.default_policy();
        Policy {
            revalidate_on_mount: self.revalidate_on_mount.unwrap_or(defaults.revalidate_on_mount),
            revalidate_on_focus: self.revalidate_on_focus.unwrap_or(defaults.revalidate_on_focus),
            refresh_interval: self.refresh_interval.or(defaults.refresh_interval),
        }
    }
}

/// A snapshot of what a consumer should render.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
    pub data: Option<T>,
    pub error: Option<FetchError>,
    /// `true` while a fetch for the key is in flight, with or without stale data.
    pub loading: bool,
    pub status: Status,
}

struct Binding<T: CacheValue> {
    key: String,
    _subscription: Subscription<T>,
}

/// One consumer's binding to a cache key.
pub struct Resource<T: CacheValue> {
    cache: Cache<T>,
    options: ResourceOptions<T>,
    binding: Option<Binding<T>>,
    version: Arc<watch::Sender<u64>>,
    changes: watch::Receiver<u64>,
}

impl<T: CacheValue> Cache<T> {
    /// Binds a new consumer to `key`.
    ///
    /// An absent key, a lazy key that yields `None`, or `enabled(false)`
    /// leaves the resource unbound: no entry is created and nothing is
    /// fetched.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the key resolves to an invalid string.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use swrkit::{Cache, CacheConfig, ResourceOptions};
    /// use swrkit::transport::{HttpFetcher, TransportAdapter};
    ///
    /// # async fn run() -> Result<(), swrkit::ConfigurationError> {
    /// let cache: Cache<serde_json::Value> = Cache::new(
    ///     TransportAdapter::new(HttpFetcher::new()).base_url("http://127.0.0.1:8080"),
    ///     CacheConfig::default(),
    /// );
    ///
    /// let mut project = cache.use_resource("/projects/42", ResourceOptions::new())?;
    /// let state = project.changed().await;
    /// println!("loading={} data={:?}", state.loading, state.data);
    /// # Ok(())
    /// # }
    /// ```
    pub fn use_resource(
        &self,
        key: impl Into<ResourceKey>,
        options: ResourceOptions<T>,
    ) -> Result<Resource<T>, ConfigurationError> {
        let (version, changes) = watch::channel(0);
        let mut resource = Resource {
            cache: self.clone(),
            options,
            binding: None,
            version: Arc::new(version),
            changes,
        };
        resource.bind(key.into())?;
        resource.changes.borrow_and_update();
        Ok(resource)
    }
}

impl<T: CacheValue> Resource<T> {
    /// The resolved key this resource is bound to, if any.
    pub fn key(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.key.as_str())
    }

    pub fn state(&self) -> ResourceState<T> {
        let Some(binding) = &self.binding else {
            return ResourceState {
                data: self.options.initial_data.clone(),
                error: None,
                loading: false,
                status: Status::Idle,
            };
        };

        let entry = self.cache.get(&binding.key);
        let status = entry.status();
        let error = entry.error().cloned();
        let data = entry.into_data().or_else(|| self.options.initial_data.clone());
        ResourceState {
            data,
            error,
            loading: status.is_fetching(),
            status,
        }
    }

    pub fn data(&self) -> Option<T> {
        self.state().data
    }

    pub fn error(&self) -> Option<FetchError> {
        self.state().error
    }

    pub fn loading(&self) -> bool {
        self.state().loading
    }

    /// Starts a new fetch generation for the bound key and waits for it.
    ///
    /// Returns `None` when the resource is unbound.
    pub async fn revalidate(&self) -> Option<Settled<T>> {
        let key = self.key()?;
        Some(self.cache.revalidate(key).settled().await)
    }

    /// Rebinds to a new key: subscribes to the new key, then releases the old one.
    ///
    /// Setting the key it is already bound to does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the key resolves to an invalid
    /// string; the resource keeps its current binding.
    pub fn set_key(&mut self, key: impl Into<ResourceKey>) -> Result<(), ConfigurationError> {
        self.bind(key.into())
    }

    /// Waits for the next state change and returns the new state.
    pub async fn changed(&mut self) -> ResourceState<T> {
        // The sender lives in `self`, so this never observes a closed channel.
        let _ = self.changes.changed().await;
        self.state()
    }

    fn bind(&mut self, key: ResourceKey) -> Result<(), ConfigurationError> {
        let resolved = key.resolve()?.filter(|_| self.options.enabled);
        if resolved.as_deref() == self.key() {
            return Ok(());
        }

        let binding = resolved.map(|key| {
            let subscription = self.cache.subscribe_with(
                &key,
                self.options.policy(self.cache.config()),
                self.options.request_options.clone(),
                self.listener(),
            );
            Binding {
                key,
                _subscription: subscription,
            }
        });
        debug!(from = ?self.key(), to = ?binding.as_ref().map(|b| b.key.as_str()), "resource key changed");

        let previous = std::mem::replace(&mut self.binding, binding);
        drop(previous);
        self.version.send_modify(|v| *v += 1);
        Ok(())
    }

    fn listener(&self) -> Listener<T> {
        let version = Arc::clone(&self.version);
        let on_error = self.options.on_error.clone();
        Arc::new(move |entry: &CacheEntry<T>| {
            if entry.status() == Status::Error {
                if let (Some(callback), Some(error)) = (&on_error, entry.error()) {
                    callback(error);
                }
            }
            version.send_modify(|v| *v += 1);
        })
    }
}

impl<T: CacheValue + fmt::Debug> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("key", &self.key())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A consumer of a paginated key: `{ items, next, load_more() }`.
pub struct PagedResource<I: Identified + CacheValue> {
    inner: Resource<Page<I>>,
}

impl<I: Identified + CacheValue> Cache<Page<I>> {
    /// Binds a new consumer to a paginated `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the key resolves to an invalid string.
    pub fn use_paged(
        &self,
        key: impl Into<ResourceKey>,
        options: ResourceOptions<Page<I>>,
    ) -> Result<PagedResource<I>, ConfigurationError> {
        Ok(PagedResource {
            inner: self.use_resource(key, options)?,
        })
    }
}

impl<I: Identified + CacheValue> PagedResource<I> {
    pub fn key(&self) -> Option<&str> {
        self.inner.key()
    }

    pub fn state(&self) -> ResourceState<Page<I>> {
        self.inner.state()
    }

    /// Every item loaded so far, in order.
    pub fn items(&self) -> Vec<I> {
        self.inner.data().map(|page| page.items).unwrap_or_default()
    }

    /// The cursor for the next page, `None` once the server has no more data.
    pub fn next(&self) -> Option<String> {
        self.inner.data().and_then(|page| page.cursor().map(str::to_owned))
    }

    pub fn loading(&self) -> bool {
        self.inner.loading()
    }

    /// Fetches and appends the next page.
    ///
    /// Waits for a fetch of the first page that is already in flight, then
    /// continues from the cursor it leaves. A no-op returning `None` when
    /// there is no next cursor or the resource is unbound.
    pub async fn load_more(&self) -> Option<Settled<Page<I>>> {
        let key = self.inner.key()?;
        while let Some(pending) = self.inner.cache.in_flight(key) {
            pending.settled().await;
        }
        let flight = self.inner.cache.load_more(key)?;
        Some(flight.settled().await)
    }

    /// Refetches the first page, discarding the pages loaded so far.
    pub async fn revalidate(&self) -> Option<Settled<Page<I>>> {
        self.inner.revalidate().await
    }

    /// # Errors
    ///
    /// See [`Resource::set_key`].
    pub fn set_key(&mut self, key: impl Into<ResourceKey>) -> Result<(), ConfigurationError> {
        self.inner.set_key(key)
    }

    pub async fn changed(&mut self) -> ResourceState<Page<I>> {
        self.inner.changed().await
    }
}
