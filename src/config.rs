//! Store-wide configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::Policy;

/// Settings shared by every key in a [`Cache`](crate::Cache).
///
/// Deserializes from JSON with every field optional; missing fields take the
/// defaults below.
///
/// | Field                 | Default    |
/// |-----------------------|------------|
/// | `dedup_interval_ms`   | `2000`     |
/// | `eviction_grace_ms`   | `30000`    |
/// | `request_timeout_ms`  | `10000`    |
/// | `revalidate_on_focus` | `true`     |
/// | `revalidate_on_mount` | `true`     |
/// | `refresh_interval_ms` | `0` (off)  |
/// | `page_cursor_param`   | `"cursor"` |
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use swrkit::CacheConfig;
///
/// let config = CacheConfig::from_json(r#"{ "eviction_grace_ms": 5000 }"#).unwrap();
/// assert_eq!(config.eviction_grace(), Duration::from_secs(5));
/// assert_eq!(config.dedup_interval(), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Minimum age of the last fetch before a focus trigger revalidates.
    pub dedup_interval_ms: u64,
    /// How long an entry without subscribers survives before eviction.
    pub eviction_grace_ms: u64,
    pub request_timeout_ms: u64,
    pub revalidate_on_focus: bool,
    pub revalidate_on_mount: bool,
    /// Default refresh period for subscribers that do not set one; `0` disables.
    pub refresh_interval_ms: u64,
    /// Query parameter carrying the cursor when loading the next page.
    pub page_cursor_param: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dedup_interval_ms: 2_000,
            eviction_grace_ms: 30_000,
            request_timeout_ms: 10_000,
            revalidate_on_focus: true,
            revalidate_on_mount: true,
            refresh_interval_ms: 0,
            page_cursor_param: "cursor".to_owned(),
        }
    }
}

impl CacheConfig {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json::Error`] for malformed JSON or mistyped fields.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn with_dedup_interval(mut self, interval: Duration) -> Self {
        self.dedup_interval_ms = millis(interval);
        self
    }

    #[must_use]
    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace_ms = millis(grace);
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = millis(timeout);
        self
    }

    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = millis(interval);
        self
    }

    pub fn dedup_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_interval_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_ms > 0).then(|| Duration::from_millis(self.refresh_interval_ms))
    }

    /// The policy a subscriber gets when it overrides nothing.
    pub fn default_policy(&self) -> Policy {
        Policy {
            revalidate_on_mount: self.revalidate_on_mount,
            revalidate_on_focus: self.revalidate_on_focus,
            refresh_interval: self.refresh_interval(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        assert_eq!(CacheConfig::from_json("{}").unwrap(), CacheConfig::default());
    }

    #[test]
    fn mistyped_field_is_rejected() {
        assert!(CacheConfig::from_json(r#"{ "dedup_interval_ms": "soon" }"#).is_err());
    }

    #[test]
    fn zero_refresh_interval_is_disabled() {
        let config = CacheConfig::default();
        assert_eq!(config.refresh_interval(), None);
        assert_eq!(config.default_policy().refresh_interval, None);

        let config = config.with_refresh_interval(Duration::from_secs(5));
        assert_eq!(config.default_policy().refresh_interval, Some(Duration::from_secs(5)));
    }
}
