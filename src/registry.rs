//! Subscription registry — fan-out of entry changes to every bound consumer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::entry::CacheEntry;

/// Callback invoked with the entry snapshot after every state change.
pub type Listener<T> = Arc<dyn Fn(&CacheEntry<T>) + Send + Sync>;

/// Identifies one subscription across all keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Listeners per key, kept in subscription order.
pub struct SubscriptionRegistry<T> {
    next_id: u64,
    by_key: HashMap<String, Vec<(SubscriberId, Listener<T>)>>,
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            by_key: HashMap::new(),
        }
    }
}

impl<T> SubscriptionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `key`.
    ///
    /// Returns the new subscriber's id and the key's subscriber count
    /// including it.
    pub fn add(&mut self, key: &str, listener: Listener<T>) -> (SubscriberId, usize) {
        self.next_id += 1;
        let id = SubscriberId(self.next_id);
        let listeners = self.by_key.entry(key.to_owned()).or_default();
        listeners.push((id, listener));
        (id, listeners.len())
    }

    /// Removes subscriber `id` from `key`.
    ///
    /// Returns the remaining subscriber count, or `None` if `id` was not
    /// subscribed to `key`.
    pub fn remove(&mut self, key: &str, id: SubscriberId) -> Option<usize> {
        let listeners = self.by_key.get_mut(key)?;
        let position = listeners.iter().position(|(sid, _)| *sid == id)?;
        listeners.remove(position);
        let remaining = listeners.len();
        if remaining == 0 {
            self.by_key.remove(key);
        }
        Some(remaining)
    }

    pub fn count(&self, key: &str) -> usize {
        self.by_key.get(key).map_or(0, Vec::len)
    }

    /// Snapshot of the listeners for `key`, in subscription order.
    ///
    /// The store calls this under its lock and invokes the listeners after
    /// releasing it, so callbacks may read the cache freely.
    pub fn listeners(&self, key: &str) -> Vec<Listener<T>> {
        self.by_key
            .get(key)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }
}

/// Delivers `entry` to each listener in order.
pub(crate) fn notify<T>(listeners: &[Listener<T>], entry: &CacheEntry<T>) {
    for listener in listeners {
        listener(entry);
    }
}
