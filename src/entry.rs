//! Cache entries and the per-key status state machine.
//!
//! ```text
//! Idle ──fetch──▶ Loading ──settle──▶ Success | Error
//!                                        │
//!                 Revalidating ◀──fetch──┘
//!                      │
//!                      └──settle──▶ Success | Error
//! ```
//!
//! Data from a prior success survives `Revalidating` and `Error`; it is only
//! replaced by a settlement whose generation is at least the entry's.

use tokio::time::Instant;

use crate::error::FetchError;

/// Monotonic per-key fetch counter used to discard superseded results.
pub type Generation = u64;

/// Lifecycle state of a [`CacheEntry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    /// Never fetched.
    #[default]
    Idle,
    /// First fetch in flight, no prior result.
    Loading,
    /// Refresh in flight; prior data or error retained.
    Revalidating,
    Success,
    Error,
}

impl Status {
    /// Returns `true` while a fetch is in flight.
    pub fn is_fetching(self) -> bool {
        matches!(self, Self::Loading | Self::Revalidating)
    }
}

/// The outcome of one coordinated fetch, tagged with its generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled<T> {
    pub generation: Generation,
    pub result: Result<T, FetchError>,
}

/// The cached state of one resource key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    key: String,
    data: Option<T>,
    error: Option<FetchError>,
    status: Status,
    generation: Generation,
    last_updated_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    /// An entry that has never been fetched.
    pub fn idle(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data: None,
            error: None,
            status: Status::Idle,
            generation: 0,
            last_updated_at: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The most recent successful data, retained across refreshes and failures.
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// The error from the most recent settlement, cleared by the next success.
    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// When the last settlement was applied, if ever.
    pub fn last_updated_at(&self) -> Option<Instant> {
        self.last_updated_at
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// Returns `true` if a settlement stamped with `generation` may be applied.
    pub(crate) fn accepts(&self, generation: Generation) -> bool {
        generation >= self.generation
    }

    /// Marks a fetch stamped with `generation` as started.
    pub(crate) fn begin(&mut self, generation: Generation) {
        self.generation = self.generation.max(generation);
        self.status = match self.status {
            Status::Idle => Status::Loading,
            Status::Success | Status::Error => Status::Revalidating,
            fetching @ (Status::Loading | Status::Revalidating) => fetching,
        };
    }

    /// Applies a settlement under the generation-ordering invariant.
    ///
    /// Returns `false`, leaving the entry untouched, when `settled` belongs to
    /// a superseded generation.
    pub(crate) fn apply(&mut self, settled: Settled<T>, now: Instant) -> bool {
        if !self.accepts(settled.generation) {
            return false;
        }
        match settled.result {
            Ok(data) => {
                self.data = Some(data);
                self.error = None;
                self.status = Status::Success;
            }
            Err(error) => {
                self.error = Some(error);
                self.status = Status::Error;
            }
        }
        self.generation = settled.generation;
        self.last_updated_at = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn ok(generation: Generation, data: &str) -> Settled<String> {
        Settled {
            generation,
            result: Ok(data.to_string()),
        }
    }

    fn failed(generation: Generation) -> Settled<String> {
        Settled {
            generation,
            result: Err(FetchError::Http {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                payload: None,
            }),
        }
    }

    #[test]
    fn first_fetch_goes_through_loading() {
        let mut entry = CacheEntry::<String>::idle("/a");
        entry.begin(1);
        assert_eq!(entry.status(), Status::Loading);
        assert!(entry.apply(ok(1, "A"), Instant::now()));
        assert_eq!(entry.status(), Status::Success);
        assert_eq!(entry.data().map(String::as_str), Some("A"));
    }

    #[test]
    fn refresh_retains_data_until_settled() {
        let mut entry = CacheEntry::<String>::idle("/a");
        entry.begin(1);
        entry.apply(ok(1, "A"), Instant::now());

        entry.begin(2);
        assert_eq!(entry.status(), Status::Revalidating);
        assert_eq!(entry.data().map(String::as_str), Some("A"));

        assert!(entry.apply(failed(2), Instant::now()));
        assert_eq!(entry.status(), Status::Error);
        assert_eq!(entry.data().map(String::as_str), Some("A"));
        assert!(entry.error().is_some());

        entry.begin(3);
        assert_eq!(entry.status(), Status::Revalidating);
        assert!(entry.apply(ok(3, "B"), Instant::now()));
        assert!(entry.error().is_none());
    }

    #[test]
    fn superseded_generation_is_rejected() {
        let mut entry = CacheEntry::<String>::idle("/a");
        entry.begin(1);
        entry.begin(2);
        assert!(entry.apply(ok(2, "new"), Instant::now()));
        let before = entry.clone();
        assert!(!entry.apply(ok(1, "old"), Instant::now()));
        assert_eq!(entry, before);
    }

    #[test]
    fn begin_never_lowers_generation() {
        let mut entry = CacheEntry::<String>::idle("/a");
        entry.begin(5);
        entry.begin(3);
        assert_eq!(entry.generation(), 5);
    }
}
