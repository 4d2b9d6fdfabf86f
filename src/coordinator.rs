//! Request coordination — single-flight deduplication and generation stamping.
//!
//! At most one operation per key is in flight at any instant. Callers asking
//! for a key that already has an operation attach to it and receive the same
//! settlement; callers that start a new operation stamp it with the next
//! generation from a counter shared by every key, so generations stay
//! monotonic across eviction and re-creation of an entry.
//!
//! Operations run on spawned Tokio tasks and are never cancelled: a
//! superseded operation runs to completion and the store discards its result
//! by generation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::entry::{Generation, Settled};
use crate::error::FetchError;

/// How a new request interacts with one already in flight for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Attach to the in-flight operation if there is one.
    Dedupe,
    /// Always start a new generation, superseding whatever is in flight.
    Supersede,
}

type Slot<T> = Option<Settled<T>>;

struct InFlight<T> {
    generation: Generation,
    rx: watch::Receiver<Slot<T>>,
}

/// A handle on a coordinated operation that resolves to its settlement.
#[derive(Clone)]
pub struct Pending<T> {
    generation: Generation,
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone> Pending<T> {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Waits for the operation to settle.
    ///
    /// If the operation's task is torn down before settling (runtime
    /// shutdown), the settlement is a [`FetchError::Network`].
    pub async fn settled(mut self) -> Settled<T> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(settled) = current {
                return settled;
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return last.unwrap_or_else(|| Settled {
                    generation: self.generation,
                    result: Err(FetchError::network("operation abandoned before settling")),
                });
            }
        }
    }
}

/// The result of [`RequestCoordinator::coordinate`].
#[derive(Clone)]
pub struct Flight<T> {
    started: bool,
    pending: Pending<T>,
}

impl<T: Clone> Flight<T> {
    /// The generation of the operation this caller is attached to.
    pub fn generation(&self) -> Generation {
        self.pending.generation
    }

    /// `true` if this call started the operation, `false` if it joined one.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Waits for the operation to settle.
    pub async fn settled(self) -> Settled<T> {
        self.pending.settled().await
    }

    pub fn into_pending(self) -> Pending<T> {
        self.pending
    }
}

/// Deduplicates concurrent requests per key and stamps new ones with generations.
pub struct RequestCoordinator<T> {
    in_flight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
    generations: AtomicU64,
}

impl<T> Default for RequestCoordinator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestCoordinator<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Draws the next generation. Never returns `0`, which idle entries carry.
    pub fn next_generation(&self) -> Generation {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns a handle on the operation currently in flight for `key`, if any.
    pub fn in_flight(&self, key: &str) -> Option<Pending<T>> {
        lock(&self.in_flight).get(key).map(|f| Pending {
            generation: f.generation,
            rx: f.rx.clone(),
        })
    }
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Joins the in-flight operation for `key` or starts a new one.
    ///
    /// When a new operation starts, `operation` is called synchronously with
    /// the freshly stamped generation and the future it returns is spawned.
    /// When that future completes, `on_settle` runs before any waiter is
    /// woken, so waiters observe a store that already reflects the result.
    /// If the call joins an existing operation, neither closure is called.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime when a new operation starts.
    pub fn coordinate<Op, Fut, S>(
        &self,
        key: &str,
        mode: FetchMode,
        operation: Op,
        on_settle: S,
    ) -> Flight<T>
    where
        Op: FnOnce(Generation) -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
        S: FnOnce(&Settled<T>) + Send + 'static,
    {
        let (generation, tx, rx) = {
            let mut in_flight = lock(&self.in_flight);
            if mode == FetchMode::Dedupe {
                if let Some(existing) = in_flight.get(key) {
                    debug!(key, generation = existing.generation, "joined in-flight request");
                    return Flight {
                        started: false,
                        pending: Pending {
                            generation: existing.generation,
                            rx: existing.rx.clone(),
                        },
                    };
                }
            }

            let generation = self.next_generation();
            let (tx, rx) = watch::channel(None);
            let superseded = in_flight.insert(
                key.to_owned(),
                InFlight {
                    generation,
                    rx: rx.clone(),
                },
            );
            if let Some(old) = superseded {
                debug!(key, old = old.generation, new = generation, "superseding in-flight request");
            }
            (generation, tx, rx)
        };

        debug!(key, generation, "starting request");
        let future = operation(generation);
        let in_flight = Arc::clone(&self.in_flight);
        let key = key.to_owned();

        tokio::spawn(async move {
            let result = future.await;
            let settled = Settled { generation, result };
            on_settle(&settled);
            {
                let mut in_flight = lock(&in_flight);
                if in_flight.get(&key).is_some_and(|f| f.generation == generation) {
                    in_flight.remove(&key);
                }
            }
            tx.send_replace(Some(settled));
        });

        Flight {
            started: true,
            pending: Pending { generation, rx },
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
