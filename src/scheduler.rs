//! Revalidation scheduling — deciding *when* a key is fetched.
//!
//! The scheduler never performs network work. It keeps per-key bookkeeping
//! (subscriber policies, last fetch time, credential suspension, the refresh
//! timer handle) and answers one question for the store: should this trigger
//! fetch this key now?
//!
//! | Trigger    | Fires when                                                        |
//! |------------|-------------------------------------------------------------------|
//! | `Mount`    | subscriber count goes 0 → 1 and the subscriber wants it           |
//! | `Interval` | a refresh timer ticks while ≥ 1 subscriber remains                |
//! | `Focus`    | a subscriber wants focus revalidation and the last fetch is older than the dedup window |
//! | `Manual`   | always; also lifts a credential suspension                        |
//! | `Preload`  | always                                                            |
//!
//! Automatic triggers (`Mount`, `Interval`, `Focus`) are suppressed after an
//! authentication failure until a `Manual` trigger succeeds in starting a
//! fetch.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::registry::SubscriberId;

/// What caused a fetch to be considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Mount,
    Interval,
    Focus,
    Manual,
    Preload,
}

impl Trigger {
    /// Automatic triggers are the ones no caller explicitly asked for.
    pub fn is_automatic(self) -> bool {
        matches!(self, Self::Mount | Self::Interval | Self::Focus)
    }
}

/// One subscriber's revalidation preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub revalidate_on_mount: bool,
    pub revalidate_on_focus: bool,
    /// `None` disables periodic refresh for this subscriber.
    pub refresh_interval: Option<Duration>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            revalidate_on_mount: true,
            revalidate_on_focus: true,
            refresh_interval: None,
        }
    }
}

#[derive(Default)]
struct KeySchedule {
    policies: Vec<(SubscriberId, Policy)>,
    last_fetch_at: Option<Instant>,
    auth_suspended: bool,
    timer: Option<JoinHandle<()>>,
    timer_period: Option<Duration>,
}

impl KeySchedule {
    fn refresh_interval(&self) -> Option<Duration> {
        self.policies
            .iter()
            .filter_map(|(_, p)| p.refresh_interval)
            .filter(|d| !d.is_zero())
            .min()
    }

    fn wants_focus(&self) -> bool {
        self.policies.iter().any(|(_, p)| p.revalidate_on_focus)
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_period = None;
    }
}

/// Per-key revalidation bookkeeping.
pub struct RevalidationScheduler {
    dedup_interval: Duration,
    keys: HashMap<String, KeySchedule>,
}

impl RevalidationScheduler {
    pub fn new(dedup_interval: Duration) -> Self {
        Self {
            dedup_interval,
            keys: HashMap::new(),
        }
    }

    /// Records a subscriber's policy for `key`.
    ///
    /// Returns `true` when a `Mount` fetch is due: this is the key's first
    /// subscriber, it asked for mount revalidation, and the key is not
    /// suspended after a credential failure.
    pub fn attach(&mut self, key: &str, id: SubscriberId, policy: Policy, first: bool) -> bool {
        let schedule = self.keys.entry(key.to_owned()).or_default();
        schedule.policies.push((id, policy));
        first && policy.revalidate_on_mount && !schedule.auth_suspended
    }

    pub fn detach(&mut self, key: &str, id: SubscriberId) {
        if let Some(schedule) = self.keys.get_mut(key) {
            schedule.policies.retain(|(sid, _)| *sid != id);
        }
    }

    /// The refresh period currently required for `key`: the smallest
    /// non-zero interval among its subscribers.
    pub fn refresh_interval(&self, key: &str) -> Option<Duration> {
        self.keys.get(key).and_then(KeySchedule::refresh_interval)
    }

    /// Starts, restarts or stops the refresh timer for `key` so that it
    /// matches [`refresh_interval`](Self::refresh_interval).
    ///
    /// `spawn` is called with the new period only when the period changes;
    /// it may return `None` when no runtime is available.
    pub fn sync_timer<F>(&mut self, key: &str, spawn: F)
    where
        F: FnOnce(Duration) -> Option<JoinHandle<()>>,
    {
        let Some(schedule) = self.keys.get_mut(key) else {
            return;
        };
        let wanted = schedule.refresh_interval();
        if wanted == schedule.timer_period && (wanted.is_none() || schedule.timer.is_some()) {
            return;
        }
        schedule.stop_timer();
        if let Some(period) = wanted {
            debug!(key, ?period, "refresh timer armed");
            schedule.timer = spawn(period);
            schedule.timer_period = Some(period);
        } else {
            debug!(key, "refresh timer stopped");
        }
    }

    /// Decides whether `trigger` should fetch `key` at `now`.
    pub fn should_fire(&self, key: &str, trigger: Trigger, now: Instant) -> bool {
        if !trigger.is_automatic() {
            return true;
        }
        if self.is_suspended(key) {
            return false;
        }
        let schedule = self.keys.get(key);
        match trigger {
            Trigger::Interval => schedule.is_some_and(|s| !s.policies.is_empty()),
            Trigger::Focus => schedule.is_some_and(|s| {
                s.wants_focus()
                    && s.last_fetch_at
                        .is_none_or(|at| now.duration_since(at) >= self.dedup_interval)
            }),
            Trigger::Mount | Trigger::Manual | Trigger::Preload => true,
        }
    }

    /// Keys that would revalidate if the environment regained focus at `now`.
    pub fn focus_candidates(&self, now: Instant) -> Vec<String> {
        self.keys
            .keys()
            .filter(|key| self.should_fire(key, Trigger::Focus, now))
            .cloned()
            .collect()
    }

    pub fn record_fetch(&mut self, key: &str, now: Instant) {
        self.keys.entry(key.to_owned()).or_default().last_fetch_at = Some(now);
    }

    /// Lifts a credential suspension; called when a caller explicitly fetches.
    pub fn resume(&mut self, key: &str) {
        if let Some(schedule) = self.keys.get_mut(key) {
            if schedule.auth_suspended {
                debug!(key, "automatic revalidation resumed");
            }
            schedule.auth_suspended = false;
        }
    }

    /// Updates suspension state from an applied settlement.
    pub fn record_outcome<T>(&mut self, key: &str, result: &Result<T, FetchError>) {
        let schedule = self.keys.entry(key.to_owned()).or_default();
        match result {
            Err(err) if err.is_auth() => {
                if !schedule.auth_suspended {
                    warn!(key, error = %err, "credentials rejected; automatic revalidation suspended");
                }
                schedule.auth_suspended = true;
            }
            Ok(_) => schedule.auth_suspended = false,
            Err(_) => {}
        }
    }

    pub fn is_suspended(&self, key: &str) -> bool {
        self.keys.get(key).is_some_and(|s| s.auth_suspended)
    }

    /// Drops all bookkeeping for `key` and stops its timer.
    pub fn cancel(&mut self, key: &str) {
        if let Some(mut schedule) = self.keys.remove(key) {
            schedule.stop_timer();
        }
    }
}

impl Drop for RevalidationScheduler {
    fn drop(&mut self) {
        for schedule in self.keys.values_mut() {
            schedule.stop_timer();
        }
    }
}
