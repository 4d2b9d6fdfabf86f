//! Cache store — the process-wide keyed table of resource entries.
//!
//! [`Cache`] is an explicit handle constructed once per session and cloned
//! into every consumer. It owns the entries, the subscription registry, the
//! revalidation scheduler and the request coordinator, and is the only code
//! that mutates an entry.
//!
//! # Locking
//!
//! All bookkeeping lives behind one `std::sync::Mutex`. It is never held
//! across an `.await` and never held while listeners run: every mutation
//! snapshots the entry and the key's listeners under the lock, releases it,
//! then notifies in subscription order. The only suspension point of a fetch
//! is the network call inside the coordinator's spawned task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::coordinator::{FetchMode, Flight, Pending, RequestCoordinator};
use crate::entry::{CacheEntry, Generation, Settled};
use crate::http::RequestOptions;
use crate::pagination::{Identified, Page, merge, next_page_key};
use crate::registry::{Listener, SubscriberId, SubscriptionRegistry, notify};
use crate::scheduler::{Policy, RevalidationScheduler, Trigger};
use crate::transport::TransportAdapter;

/// Values a [`Cache`] can hold: decodable from JSON and shareable across tasks.
pub trait CacheValue: DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: DeserializeOwned + Clone + Send + Sync + 'static {}

struct Slot<T> {
    entry: CacheEntry<T>,
    /// Options used for automatic fetches; taken from the first subscriber.
    request: RequestOptions,
    /// Set when the last subscriber leaves; eviction waits out the grace period from here.
    idle_since: Option<Instant>,
}

impl<T> Slot<T> {
    fn watched(key: &str) -> Self {
        Self {
            entry: CacheEntry::idle(key),
            request: RequestOptions::new(),
            idle_since: None,
        }
    }

    fn unwatched(key: &str, now: Instant) -> Self {
        Self {
            idle_since: Some(now),
            ..Self::watched(key)
        }
    }
}

struct State<T> {
    entries: HashMap<String, Slot<T>>,
    registry: SubscriptionRegistry<T>,
    scheduler: RevalidationScheduler,
}

struct Inner<T> {
    config: CacheConfig,
    transport: TransportAdapter,
    coordinator: RequestCoordinator<T>,
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A keyed, in-memory cache of remote resources with stale-while-revalidate
/// semantics.
///
/// Cloning is cheap; clones share the same entries.
///
/// # Examples
///
/// ```rust,no_run
/// use swrkit::{Cache, CacheConfig};
/// use swrkit::transport::{HttpFetcher, TransportAdapter};
///
/// #[derive(Clone, serde::Deserialize)]
/// struct Project {
///     id: u64,
///     title: String,
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let transport = TransportAdapter::new(HttpFetcher::new()).base_url("http://127.0.0.1:8080");
///     let cache: Cache<Project> = Cache::new(transport, CacheConfig::default());
///
///     let _subscription = cache.subscribe("/projects/42", |entry| {
///         println!("{:?} {:?}", entry.status(), entry.data().map(|p| &p.title));
///     });
///
///     let settled = cache.revalidate("/projects/42").settled().await;
///     assert!(settled.result.is_ok());
/// }
/// ```
pub struct Cache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: CacheValue> Cache<T> {
    /// Creates an empty cache.
    ///
    /// The configured request timeout replaces the adapter's default.
    pub fn new(transport: TransportAdapter, config: CacheConfig) -> Self {
        let transport = transport.timeout(config.request_timeout());
        let scheduler = RevalidationScheduler::new(config.dedup_interval());
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                coordinator: RequestCoordinator::new(),
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    registry: SubscriptionRegistry::new(),
                    scheduler,
                }),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the current entry for `key`, or an `Idle` entry if none exists.
    pub fn get(&self, key: &str) -> CacheEntry<T> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map_or_else(|| CacheEntry::idle(key), |slot| slot.entry.clone())
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.lock().registry.count(key)
    }

    /// Registers `on_change` for every state change of `key`.
    ///
    /// Creates the entry if needed. When this is the key's first subscriber
    /// and mount revalidation is enabled in the store config, a fetch starts
    /// (or an in-flight one is joined). Dropping the returned
    /// [`Subscription`] unsubscribes.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, key: &str, on_change: F) -> Subscription<T>
    where
        F: Fn(&CacheEntry<T>) + Send + Sync + 'static,
    {
        self.subscribe_with(
            key,
            self.inner.config.default_policy(),
            RequestOptions::new(),
            Arc::new(on_change),
        )
    }

    pub(crate) fn subscribe_with(
        &self,
        key: &str,
        policy: Policy,
        request: RequestOptions,
        listener: Listener<T>,
    ) -> Subscription<T> {
        let (id, mount_due) = {
            let mut state = self.inner.lock();
            let State {
                entries,
                registry,
                scheduler,
            } = &mut *state;

            let slot = entries.entry(key.to_owned()).or_insert_with(|| {
                debug!(key, "entry created");
                Slot::watched(key)
            });
            slot.idle_since = None;

            let (id, count) = registry.add(key, listener);
            if count == 1 {
                slot.request = request;
            }
            let due = scheduler.attach(key, id, policy, count == 1);
            scheduler.sync_timer(key, |period| self.spawn_refresh(key, period));
            (id, due)
        };

        debug!(key, subscriber = %id, "subscribed");
        if mount_due {
            self.trigger(key, Trigger::Mount);
        }

        Subscription {
            cache: Arc::downgrade(&self.inner),
            key: key.to_owned(),
            id,
        }
    }

    fn unsubscribe(&self, key: &str, id: SubscriberId) {
        let now = Instant::now();
        let idle = {
            let mut state = self.inner.lock();
            let State {
                entries,
                registry,
                scheduler,
            } = &mut *state;

            let Some(remaining) = registry.remove(key, id) else {
                return;
            };
            scheduler.detach(key, id);
            scheduler.sync_timer(key, |period| self.spawn_refresh(key, period));
            if remaining == 0 {
                if let Some(slot) = entries.get_mut(key) {
                    slot.idle_since = Some(now);
                }
            }
            remaining == 0
        };

        debug!(key, subscriber = %id, "unsubscribed");
        if idle {
            self.schedule_eviction(key);
        }
    }

    /// Applies a settled fetch result to `key`.
    ///
    /// The result is applied only if its generation is at least the entry's
    /// current generation; otherwise it belongs to a superseded fetch and is
    /// discarded. Returns `true` if applied, in which case every subscriber
    /// has been notified before this returns.
    pub fn update(&self, key: &str, settled: Settled<T>) -> bool {
        let now = Instant::now();
        let generation = settled.generation;
        let (snapshot, listeners) = {
            let mut state = self.inner.lock();
            let State {
                entries,
                registry,
                scheduler,
            } = &mut *state;

            let Some(slot) = entries.get_mut(key) else {
                debug!(key, generation, "discarding result for evicted key");
                return false;
            };
            if !slot.entry.accepts(generation) {
                log_superseded(key, generation, slot.entry.generation(), &settled);
                return false;
            }

            scheduler.record_outcome(key, &settled.result);
            slot.entry.apply(settled, now);
            (slot.entry.clone(), registry.listeners(key))
        };

        debug!(key, generation, status = ?snapshot.status(), "result applied");
        notify(&listeners, &snapshot);
        true
    }

    /// Removes `key` once it has had no subscribers for the grace period.
    ///
    /// Cancels the key's refresh timer. Returns `true` if the entry was
    /// removed. Runs automatically after the last subscriber leaves; calling
    /// it earlier is a no-op.
    pub fn evict(&self, key: &str) -> bool {
        let now = Instant::now();
        let grace = self.inner.config.eviction_grace();
        let mut state = self.inner.lock();
        let State {
            entries,
            registry,
            scheduler,
        } = &mut *state;

        if registry.count(key) > 0 {
            return false;
        }
        let expired = entries
            .get(key)
            .and_then(|slot| slot.idle_since)
            .is_some_and(|since| now.duration_since(since) >= grace);
        if !expired {
            return false;
        }

        entries.remove(key);
        scheduler.cancel(key);
        debug!(key, "entry evicted");
        true
    }

    /// Starts a new fetch generation for `key`, superseding any in-flight one.
    ///
    /// Lifts a credential suspension. Creates the entry if it does not exist;
    /// such an entry is evicted after the grace period unless someone
    /// subscribes.
    pub fn revalidate(&self, key: &str) -> Flight<T> {
        let request = self.ensure_slot(key);
        self.start(key, FetchMode::Supersede, Trigger::Manual, request)
    }

    /// Fetches `key` without subscribing, joining a fetch already in flight.
    pub fn preload(&self, key: &str) -> Flight<T> {
        let request = self.ensure_slot(key);
        self.start(key, FetchMode::Dedupe, Trigger::Preload, request)
    }

    /// Writes `data` for `key` locally under a fresh generation.
    ///
    /// Any fetch in flight for the key is superseded and its result will be
    /// discarded. Subscribers are notified before this returns.
    pub fn mutate(&self, key: &str, data: T) {
        let generation = self.inner.coordinator.next_generation();
        let now = Instant::now();
        let (snapshot, listeners, created) = {
            let mut state = self.inner.lock();
            let State {
                entries, registry, ..
            } = &mut *state;

            let created = !entries.contains_key(key);
            let slot = entries
                .entry(key.to_owned())
                .or_insert_with(|| Slot::unwatched(key, now));
            slot.entry.apply(
                Settled {
                    generation,
                    result: Ok(data),
                },
                now,
            );
            (slot.entry.clone(), registry.listeners(key), created)
        };

        if created {
            self.schedule_eviction(key);
        }
        debug!(key, generation, "local mutation applied");
        notify(&listeners, &snapshot);
    }

    /// [`mutate`](Self::mutate) followed by [`revalidate`](Self::revalidate).
    pub fn mutate_and_revalidate(&self, key: &str, data: T) -> Flight<T> {
        self.mutate(key, data);
        self.revalidate(key)
    }

    /// Signals that the embedding environment regained focus.
    ///
    /// Revalidates every key whose subscribers asked for it and whose last
    /// fetch is older than the dedup window. Returns the number of keys
    /// revalidated.
    pub fn focus(&self) -> usize {
        let candidates = self.inner.lock().scheduler.focus_candidates(Instant::now());
        candidates
            .iter()
            .filter(|key| self.trigger(key, Trigger::Focus).is_some())
            .count()
    }

    /// Runs an automatic trigger if the scheduler says it is due.
    pub(crate) fn trigger(&self, key: &str, trigger: Trigger) -> Option<Flight<T>> {
        let request = {
            let state = self.inner.lock();
            let slot = state.entries.get(key)?;
            if !state.scheduler.should_fire(key, trigger, Instant::now()) {
                debug!(
                    key,
                    ?trigger,
                    suspended = state.scheduler.is_suspended(key),
                    "revalidation skipped"
                );
                return None;
            }
            slot.request.clone()
        };
        Some(self.start(key, FetchMode::Dedupe, trigger, request))
    }

    fn ensure_slot(&self, key: &str) -> RequestOptions {
        let now = Instant::now();
        let (request, created) = {
            let mut state = self.inner.lock();
            let created = !state.entries.contains_key(key);
            let slot = state
                .entries
                .entry(key.to_owned())
                .or_insert_with(|| Slot::unwatched(key, now));
            (slot.request.clone(), created)
        };
        if created {
            debug!(key, "entry created without subscribers");
            self.schedule_eviction(key);
        }
        request
    }

    fn start(&self, key: &str, mode: FetchMode, trigger: Trigger, request: RequestOptions) -> Flight<T> {
        let cache = self.clone();
        let settle_to = Arc::downgrade(&self.inner);
        let transport = self.inner.transport.clone();
        let fetch_key = key.to_owned();
        let settle_key = key.to_owned();

        let flight = self.inner.coordinator.coordinate(
            key,
            mode,
            move |generation| {
                cache.begin(&fetch_key, generation, trigger);
                async move { transport.fetch_resource::<T>(&fetch_key, &request).await }
            },
            move |settled| {
                if let Some(inner) = settle_to.upgrade() {
                    Cache { inner }.update(&settle_key, settled.clone());
                }
            },
        );
        if !flight.started() {
            self.join(key, &flight);
        }
        flight
    }

    /// Returns the fetch in flight for `key`, if any.
    pub(crate) fn in_flight(&self, key: &str) -> Option<Pending<T>> {
        self.inner.coordinator.in_flight(key)
    }

    /// Catches an entry up with a flight it joined.
    ///
    /// An entry re-created while an earlier flight was still running sits at
    /// an older generation than that flight; it moves to `Loading` under the
    /// flight's generation and takes the settlement if the flight's own
    /// settle ran before the entry existed.
    fn join(&self, key: &str, flight: &Flight<T>) {
        let generation = flight.generation();
        let (snapshot, listeners) = {
            let mut state = self.inner.lock();
            let State {
                entries, registry, ..
            } = &mut *state;

            let Some(slot) = entries.get_mut(key) else {
                return;
            };
            if slot.entry.generation() >= generation {
                return;
            }
            slot.entry.begin(generation);
            (slot.entry.clone(), registry.listeners(key))
        };

        debug!(key, generation, status = ?snapshot.status(), "entry joined an earlier fetch");
        notify(&listeners, &snapshot);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = Arc::downgrade(&self.inner);
        let pending = flight.clone().into_pending();
        let key = key.to_owned();
        runtime.spawn(async move {
            let settled = pending.settled().await;
            if let Some(inner) = cache.upgrade() {
                Cache { inner }.settle_joined(&key, settled);
            }
        });
    }

    fn settle_joined(&self, key: &str, settled: Settled<T>) {
        let waiting = self.inner.lock().entries.get(key).is_some_and(|slot| {
            slot.entry.status().is_fetching() && slot.entry.generation() == settled.generation
        });
        if waiting {
            self.update(key, settled);
        }
    }

    /// Moves `key` into `Loading`/`Revalidating` for a fetch stamped `generation`.
    fn begin(&self, key: &str, generation: Generation, trigger: Trigger) {
        let (snapshot, listeners) = {
            let mut state = self.inner.lock();
            let State {
                entries,
                registry,
                scheduler,
            } = &mut *state;

            let Some(slot) = entries.get_mut(key) else {
                return;
            };
            slot.entry.begin(generation);
            scheduler.record_fetch(key, Instant::now());
            if trigger == Trigger::Manual {
                scheduler.resume(key);
            }
            (slot.entry.clone(), registry.listeners(key))
        };

        debug!(key, generation, ?trigger, status = ?snapshot.status(), "fetch started");
        notify(&listeners, &snapshot);
    }

    fn schedule_eviction(&self, key: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key, "no runtime; eviction deferred to the next explicit evict");
            return;
        };
        let cache = Arc::downgrade(&self.inner);
        let key = key.to_owned();
        let grace = self.inner.config.eviction_grace();
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = cache.upgrade() {
                Cache { inner }.evict(&key);
            }
        });
    }

    fn spawn_refresh(&self, key: &str, period: Duration) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let cache = Arc::downgrade(&self.inner);
        let key = key.to_owned();
        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = cache.upgrade() else {
                    break;
                };
                Cache { inner }.trigger(&key, Trigger::Interval);
            }
        }))
    }
}

impl<I> Cache<Page<I>>
where
    I: Identified + CacheValue,
{
    /// Fetches the page after the entry's cursor and appends it.
    ///
    /// Returns `None` without fetching when the key has no entry, its cursor
    /// is empty, or a fetch of the key itself is in flight: that fetch resets
    /// the cursor, so the next page is only known once it settles.
    /// Concurrent calls for the same cursor share one fetch. The merged page
    /// is applied under the generation invariant, so a refetch started
    /// afterwards wins over it.
    pub fn load_more(&self, key: &str) -> Option<Flight<Page<I>>> {
        if let Some(pending) = self.in_flight(key) {
            debug!(key, generation = pending.generation(), "next page deferred to the fetch in flight");
            return None;
        }
        let (cursor, request) = {
            let state = self.inner.lock();
            let slot = state.entries.get(key)?;
            let cursor = slot.entry.data()?.cursor()?.to_owned();
            (cursor, slot.request.clone())
        };
        let page_key = match next_page_key(key, &self.inner.config.page_cursor_param, &cursor) {
            Ok(page_key) => page_key,
            Err(e) => {
                warn!(key, cursor = %cursor, error = %e, "cannot build next page key");
                return None;
            }
        };
        debug!(key, cursor = %cursor, "loading next page");

        let cache = self.clone();
        let settle_to = Arc::downgrade(&self.inner);
        let transport = self.inner.transport.clone();
        let entry_key = key.to_owned();
        let settle_key = key.to_owned();
        let fetch_key = page_key.clone();

        Some(self.inner.coordinator.coordinate(
            &page_key,
            FetchMode::Dedupe,
            move |generation| {
                cache.begin(&entry_key, generation, Trigger::Manual);
                async move { transport.fetch_resource::<Page<I>>(&fetch_key, &request).await }
            },
            move |settled| {
                if let Some(inner) = settle_to.upgrade() {
                    Cache { inner }.apply_page(&settle_key, settled.clone());
                }
            },
        ))
    }

    fn apply_page(&self, key: &str, settled: Settled<Page<I>>) -> bool {
        let now = Instant::now();
        let generation = settled.generation;
        let (snapshot, listeners) = {
            let mut state = self.inner.lock();
            let State {
                entries,
                registry,
                scheduler,
            } = &mut *state;

            let Some(slot) = entries.get_mut(key) else {
                return false;
            };
            if !slot.entry.accepts(generation) {
                log_superseded(key, generation, slot.entry.generation(), &settled);
                return false;
            }

            let result = settled.result.map(|page| match slot.entry.data() {
                Some(previous) => merge(previous, &page),
                None => page,
            });
            scheduler.record_outcome(key, &result);
            slot.entry.apply(Settled { generation, result }, now);
            (slot.entry.clone(), registry.listeners(key))
        };

        debug!(key, generation, items = snapshot.data().map_or(0, |p| p.items.len()), "page merged");
        notify(&listeners, &snapshot);
        true
    }
}

fn log_superseded<T>(key: &str, generation: Generation, current: Generation, settled: &Settled<T>) {
    match &settled.result {
        Ok(_) => debug!(key, generation, current, "discarding superseded result"),
        Err(e) => warn!(key, generation, current, error = %e, "discarding superseded failure"),
    }
}

/// Keeps a subscriber registered; dropping it unsubscribes.
///
/// When the last subscription for a key is dropped, the entry becomes
/// evictable after the configured grace period.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription<T: CacheValue> {
    cache: Weak<Inner<T>>,
    key: String,
    id: SubscriberId,
}

impl<T: CacheValue> Subscription<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl<T: CacheValue> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            Cache { inner }.unsubscribe(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;
    use tokio::sync::oneshot;

    use super::*;
    use crate::entry::Status;
    use crate::error::FetchError;
    use crate::http::{RawResponse, StatusCode};

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Project {
        id: u32,
        title: String,
    }

    type Log<T> = Arc<Mutex<Vec<CacheEntry<T>>>>;
    type Gates = Arc<Mutex<VecDeque<oneshot::Sender<RawResponse>>>>;

    const KEY: &str = "/projects/42";

    /// Installs a test-writer subscriber once; `RUST_LOG=swrkit=debug` shows the store's events.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn project(title: &str) -> RawResponse {
        RawResponse::new(StatusCode::OK).json(&serde_json::json!({ "id": 42, "title": title }))
    }

    fn status(code: u16) -> RawResponse {
        RawResponse::new(StatusCode::from_u16(code).unwrap())
    }

    /// A fetcher that counts calls, optionally waits, then answers with `respond(url, call_number)`.
    fn counting<R>(delay: Duration, respond: R) -> (TransportAdapter, Arc<AtomicUsize>)
    where
        R: Fn(&str, usize) -> RawResponse + Send + Sync + 'static,
    {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let respond = Arc::new(respond);
        let transport = TransportAdapter::new(move |url: String, _req: RequestOptions| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let respond = Arc::clone(&respond);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, io::Error>(respond(&url, n))
            }
        });
        (transport, calls)
    }

    /// A fetcher whose responses are supplied by the test, in call order.
    fn gated() -> (TransportAdapter, Gates) {
        let gates: Gates = Arc::default();
        let queue = Arc::clone(&gates);
        let transport = TransportAdapter::new(move |_url: String, _req: RequestOptions| {
            let (tx, rx) = oneshot::channel();
            queue.lock().unwrap().push_back(tx);
            async move {
                rx.await
                    .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "gate dropped"))
            }
        });
        (transport, gates)
    }

    async fn next_gate(gates: &Gates) -> oneshot::Sender<RawResponse> {
        loop {
            if let Some(tx) = gates.lock().unwrap().pop_front() {
                return tx;
            }
            tokio::task::yield_now().await;
        }
    }

    fn recorder<T: Clone + Send + 'static>() -> (Log<T>, impl Fn(&CacheEntry<T>) + Send + Sync + 'static) {
        let log: Log<T> = Arc::default();
        let sink = Arc::clone(&log);
        (log, move |entry: &CacheEntry<T>| sink.lock().unwrap().push(entry.clone()))
    }

    fn title(entry: &CacheEntry<Project>) -> Option<&str> {
        entry.data().map(|p| p.title.as_str())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_subscribers_trigger_one_fetch() {
        let (transport, calls) = counting(Duration::from_millis(20), |_, _| project("A"));
        let cache = Cache::<Project>::new(transport, CacheConfig::default());

        let (logs, listeners): (Vec<_>, Vec<_>) = (0..5).map(|_| recorder::<Project>()).unzip();
        let _subs: Vec<_> = listeners
            .into_iter()
            .map(|listener| cache.subscribe(KEY, listener))
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for log in &logs {
            let last = log.lock().unwrap().last().cloned().unwrap();
            assert_eq!(last.status(), Status::Success);
            assert_eq!(title(&last), Some("A"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_joins_the_first_fetch() {
        init_tracing();
        let (transport, calls) = counting(Duration::from_millis(100), |_, _| project("A"));
        let cache = Cache::<Project>::new(transport, CacheConfig::default());
        let start = Instant::now();

        let (first_log, first) = recorder();
        let (second_log, second) = recorder();
        let _a = cache.subscribe(KEY, first);
        assert_eq!(cache.get(KEY).status(), Status::Loading);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _b = cache.subscribe(KEY, second);
        assert_eq!(cache.subscriber_count(KEY), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let first_log = first_log.lock().unwrap();
        let second_log = second_log.lock().unwrap();
        assert_eq!(first_log.len(), 2, "Loading then Success");
        assert_eq!(second_log.len(), 1, "only the Success");
        assert_eq!(first_log.last(), second_log.last());

        let settled = second_log[0].clone();
        assert_eq!(settled.status(), Status::Success);
        assert_eq!(settled.data(), Some(&Project { id: 42, title: "A".into() }));
        assert!(settled.last_updated_at().unwrap() >= start + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn superseded_result_never_overwrites() {
        init_tracing();
        let (transport, gates) = gated();
        let cache = Cache::<Project>::new(transport, CacheConfig::default());

        let older = cache.preload(KEY);
        let newer = cache.revalidate(KEY);
        assert!(newer.generation() > older.generation());

        let older_gate = next_gate(&gates).await;
        let newer_gate = next_gate(&gates).await;

        older_gate.send(project("old")).unwrap();
        let settled = older.settled().await;
        assert!(settled.result.is_ok());
        let entry = cache.get(KEY);
        assert_eq!(entry.status(), Status::Loading);
        assert_eq!(entry.data(), None);

        newer_gate.send(project("new")).unwrap();
        newer.settled().await;
        let entry = cache.get(KEY);
        assert_eq!(title(&entry), Some("new"));
        assert_eq!(entry.generation(), settled.generation + 1);
    }

    #[tokio::test]
    async fn late_stale_result_after_newer_success_is_discarded() {
        let (transport, gates) = gated();
        let cache = Cache::<Project>::new(transport, CacheConfig::default());

        let older = cache.preload(KEY);
        let newer = cache.revalidate(KEY);
        let older_gate = next_gate(&gates).await;
        let newer_gate = next_gate(&gates).await;

        newer_gate.send(project("new")).unwrap();
        newer.settled().await;
        let before = cache.get(KEY);

        older_gate.send(project("old")).unwrap();
        older.settled().await;
        assert_eq!(cache.get(KEY), before);
    }

    #[tokio::test]
    async fn stale_data_is_served_while_revalidating() {
        let (transport, gates) = gated();
        let cache = Cache::<Project>::new(transport, CacheConfig::default());

        let first = cache.preload(KEY);
        next_gate(&gates).await.send(project("D1")).unwrap();
        first.settled().await;

        let refresh = cache.revalidate(KEY);
        let entry = cache.get(KEY);
        assert_eq!(entry.status(), Status::Revalidating);
        assert_eq!(title(&entry), Some("D1"));

        next_gate(&gates).await.send(project("D2")).unwrap();
        refresh.settled().await;
        let entry = cache.get(KEY);
        assert_eq!(entry.status(), Status::Success);
        assert_eq!(title(&entry), Some("D2"));
    }

    #[tokio::test]
    async fn failed_revalidation_keeps_stale_data() {
        let (transport, _) = counting(Duration::ZERO, |_, n| if n == 1 { project("D1") } else { status(500) });
        let cache = Cache::<Project>::new(transport, CacheConfig::default());

        cache.preload(KEY).settled().await;
        cache.revalidate(KEY).settled().await;

        let entry = cache.get(KEY);
        assert_eq!(entry.status(), Status::Error);
        assert_eq!(title(&entry), Some("D1"));
        assert_eq!(entry.error().and_then(FetchError::status), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entry_is_evicted_after_grace_and_refetched() {
        init_tracing();
        let (transport, calls) = counting(Duration::ZERO, |_, _| project("A"));
        let config = CacheConfig::default().with_eviction_grace(Duration::from_secs(5));
        let cache = Cache::<Project>::new(transport, config);

        let sub = cache.subscribe(KEY, |_| {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get(KEY).status(), Status::Success);

        drop(sub);
        assert!(!cache.evict(KEY), "grace period has not elapsed");
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.is_empty());
        assert_eq!(cache.get(KEY).status(), Status::Idle);

        let _sub = cache.subscribe(KEY, |_| {});
        assert_eq!(cache.get(KEY).status(), Status::Loading);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_within_grace_keeps_the_entry() {
        let (transport, _) = counting(Duration::ZERO, |_, _| project("A"));
        let config = CacheConfig::default().with_eviction_grace(Duration::from_secs(5));
        let cache = Cache::<Project>::new(transport, config);

        drop(cache.subscribe(KEY, |_| {}));
        tokio::time::sleep(Duration::from_secs(3)).await;
        let _sub = cache.subscribe(KEY, |_| {});
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(title(&cache.get(KEY)), Some("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn focus_respects_the_dedup_window() {
        let (transport, calls) = counting(Duration::ZERO, |_, _| project("A"));
        let cache = Cache::<Project>::new(transport, CacheConfig::default());
        let _sub = cache.subscribe(KEY, |_| {});
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.focus(), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cache.focus(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_interval_runs_only_while_subscribed() {
        let (transport, calls) = counting(Duration::ZERO, |_, _| project("A"));
        let cache = Cache::<Project>::new(transport, CacheConfig::default());
        let policy = Policy {
            refresh_interval: Some(Duration::from_secs(1)),
            ..Policy::default()
        };

        let sub = cache.subscribe_with(KEY, policy, RequestOptions::new(), Arc::new(|_: &CacheEntry<Project>| {}));
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4, "mount plus three ticks");

        drop(sub);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_suspends_automatic_revalidation() {
        init_tracing();
        let (transport, calls) = counting(Duration::ZERO, |_, n| if n <= 2 { status(401) } else { project("A") });
        let cache = Cache::<Project>::new(transport, CacheConfig::default());
        let policy = Policy {
            refresh_interval: Some(Duration::from_secs(1)),
            ..Policy::default()
        };
        let _sub = cache.subscribe_with(KEY, policy, RequestOptions::new(), Arc::new(|_: &CacheEntry<Project>| {}));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.get(KEY).error().is_some_and(FetchError::is_auth));
        assert_eq!(cache.focus(), 0);

        let settled = cache.revalidate(KEY).settled().await;
        assert!(settled.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let settled = cache.revalidate(KEY).settled().await;
        assert!(settled.result.is_ok());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(calls.load(Ordering::SeqCst) >= 4, "interval resumed after success");
    }

    #[tokio::test]
    async fn mutate_supersedes_in_flight_fetch() {
        let (transport, gates) = gated();
        let cache = Cache::<Project>::new(transport, CacheConfig::default());
        let (log, listener) = recorder();
        let _sub = cache.subscribe(KEY, listener);

        cache.mutate(
            KEY,
            Project {
                id: 42,
                title: "local".into(),
            },
        );
        assert_eq!(title(&cache.get(KEY)), Some("local"));

        next_gate(&gates).await.send(project("server")).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(title(&cache.get(KEY)), Some("local"));
        let statuses: Vec<_> = log.lock().unwrap().iter().map(CacheEntry::status).collect();
        assert_eq!(statuses, vec![Status::Loading, Status::Success]);
    }

    #[tokio::test]
    async fn mutate_and_revalidate_refreshes_from_server() {
        let (transport, _) = counting(Duration::ZERO, |_, _| project("server"));
        let cache = Cache::<Project>::new(transport, CacheConfig::default());

        let flight = cache.mutate_and_revalidate(
            KEY,
            Project {
                id: 42,
                title: "local".into(),
            },
        );
        assert_eq!(cache.get(KEY).status(), Status::Revalidating);
        assert_eq!(title(&cache.get(KEY)), Some("local"));
        flight.settled().await;
        assert_eq!(title(&cache.get(KEY)), Some("server"));
    }

    #[tokio::test]
    async fn preload_is_joined_by_first_subscriber() {
        let (transport, gates) = gated();
        let cache = Cache::<Project>::new(transport, CacheConfig::default());

        let preload = cache.preload(KEY);
        let (log, listener) = recorder();
        let _sub = cache.subscribe(KEY, listener);

        next_gate(&gates).await.send(project("A")).unwrap();
        preload.settled().await;
        assert_eq!(gates.lock().unwrap().len(), 0);
        assert_eq!(log.lock().unwrap().last().map(CacheEntry::status), Some(Status::Success));
    }

    #[tokio::test]
    async fn update_rejects_older_generation() {
        let (transport, _) = counting(Duration::ZERO, |_, _| project("A"));
        let cache = Cache::<Project>::new(transport, CacheConfig::default());
        let flight = cache.preload(KEY);
        let generation = flight.generation();
        flight.settled().await;

        let stale = Settled {
            generation: generation - 1,
            result: Err(FetchError::network("late")),
        };
        assert!(!cache.update(KEY, stale));
        assert_eq!(cache.get(KEY).status(), Status::Success);
        assert!(!cache.update("/never-seen", Settled { generation: 99, result: Err(FetchError::network("x")) }));
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Item {
        id: u32,
    }

    impl Identified for Item {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }
    }

    fn item_ids(entry: &CacheEntry<Page<Item>>) -> Vec<u32> {
        entry.data().map(|p| p.items.iter().map(|i| i.id).collect()).unwrap_or_default()
    }

    #[tokio::test]
    async fn load_more_appends_and_refetch_resets() {
        let (transport, calls) = counting(Duration::ZERO, |url, _| {
            let body = if url.ends_with("cursor=c2") {
                serde_json::json!({ "items": [{ "id": 2 }, { "id": 3 }], "next": null })
            } else {
                serde_json::json!({ "items": [{ "id": 1 }, { "id": 2 }], "next": "c2" })
            };
            RawResponse::new(StatusCode::OK).json(&body)
        });
        let cache = Cache::<Page<Item>>::new(transport, CacheConfig::default());

        cache.preload("/items").settled().await;
        assert_eq!(item_ids(&cache.get("/items")), vec![1, 2]);

        cache.load_more("/items").unwrap().settled().await;
        let entry = cache.get("/items");
        assert_eq!(item_ids(&entry), vec![1, 2, 3]);
        assert!(!entry.data().unwrap().has_more());

        assert!(cache.load_more("/items").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.revalidate("/items").settled().await;
        assert_eq!(item_ids(&cache.get("/items")), vec![1, 2]);
    }

    fn page(ids: &[u32], next: Option<&str>) -> RawResponse {
        let items: Vec<_> = ids.iter().map(|id| serde_json::json!({ "id": id })).collect();
        RawResponse::new(StatusCode::OK).json(&serde_json::json!({ "items": items, "next": next }))
    }

    #[tokio::test]
    async fn load_more_waits_out_a_refetch_of_the_key() {
        init_tracing();
        let (transport, gates) = gated();
        let cache = Cache::<Page<Item>>::new(transport, CacheConfig::default());

        let first = cache.preload("/items");
        next_gate(&gates).await.send(page(&[1], Some("c2"))).unwrap();
        first.settled().await;

        let refetch = cache.revalidate("/items");
        assert!(cache.load_more("/items").is_none());

        next_gate(&gates).await.send(page(&[10], Some("c11"))).unwrap();
        let generation = refetch.generation();
        assert!(refetch.settled().await.result.is_ok());

        let entry = cache.get("/items");
        assert_eq!(item_ids(&entry), vec![10]);
        assert_eq!(entry.generation(), generation);
        assert_eq!(entry.data().and_then(Page::cursor), Some("c11"));

        let more = cache.load_more("/items").unwrap();
        next_gate(&gates).await.send(page(&[11], None)).unwrap();
        more.settled().await;
        assert_eq!(item_ids(&cache.get("/items")), vec![10, 11]);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_recreated_during_an_orphan_fetch_shows_loading() {
        let (transport, calls) = counting(Duration::from_millis(100), |_, _| project("A"));
        let config = CacheConfig::default().with_eviction_grace(Duration::from_millis(50));
        let cache = Cache::<Project>::new(transport, config);

        let orphan = cache.preload(KEY);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty());

        let (log, listener) = recorder();
        let _sub = cache.subscribe(KEY, listener);
        let entry = cache.get(KEY);
        assert_eq!(entry.status(), Status::Loading);
        assert_eq!(entry.generation(), orphan.generation());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get(KEY).status(), Status::Success);
        assert_eq!(title(&cache.get(KEY)), Some("A"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let statuses: Vec<_> = log.lock().unwrap().iter().map(CacheEntry::status).collect();
        assert_eq!(statuses, vec![Status::Loading, Status::Success]);
    }
}
