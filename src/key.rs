//! Resource keys and their lazy resolution.

use std::fmt;
use std::sync::Arc;

use crate::error::ConfigurationError;

type KeyFn = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Identifies the resource a consumer wants.
///
/// A key is either a fixed string, a function evaluated each time the
/// consumer binds (returning `None` while the key is not yet available), or
/// absent. Absent and unavailable keys disable fetching.
///
/// # Examples
///
/// ```
/// use swrkit::ResourceKey;
///
/// let fixed = ResourceKey::from("/projects/42");
/// assert_eq!(fixed.resolve().unwrap().as_deref(), Some("/projects/42"));
///
/// let pending = ResourceKey::lazy(|| None);
/// assert_eq!(pending.resolve().unwrap(), None);
///
/// assert!(ResourceKey::from("").resolve().is_err());
/// ```
#[derive(Clone, Default)]
pub enum ResourceKey {
    #[default]
    Absent,
    Static(String),
    Lazy(KeyFn),
}

impl ResourceKey {
    /// Wraps a key-producing function.
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self::Lazy(Arc::new(f))
    }

    /// Resolves the key to a concrete string.
    ///
    /// Returns `Ok(None)` when the key is absent or not yet available.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] when the key resolves to an empty string
    /// or to a string containing control characters.
    pub fn resolve(&self) -> Result<Option<String>, ConfigurationError> {
        let resolved = match self {
            Self::Absent => None,
            Self::Static(key) => Some(key.clone()),
            Self::Lazy(f) => f(),
        };
        match resolved {
            Some(key) => validate(&key).map(|()| Some(key)),
            None => Ok(None),
        }
    }
}

fn validate(key: &str) -> Result<(), ConfigurationError> {
    if key.trim().is_empty() {
        return Err(ConfigurationError::EmptyKey);
    }
    if key.chars().any(char::is_control) {
        return Err(ConfigurationError::InvalidKey {
            key: key.to_owned(),
        });
    }
    Ok(())
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("Absent"),
            Self::Static(key) => f.debug_tuple("Static").field(key).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::Static(key.to_owned())
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self::Static(key)
    }
}

impl<K: Into<ResourceKey>> From<Option<K>> for ResourceKey {
    fn from(key: Option<K>) -> Self {
        key.map_or(Self::Absent, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn absent_and_none_resolve_to_nothing() {
        assert_eq!(ResourceKey::Absent.resolve(), Ok(None));
        assert_eq!(ResourceKey::from(None::<&str>).resolve(), Ok(None));
    }

    #[test]
    fn lazy_key_is_evaluated_on_every_resolve() {
        let ready = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ready);
        let key = ResourceKey::lazy(move || {
            flag.load(Ordering::SeqCst)
                .then(|| "/projects/42".to_string())
        });

        assert_eq!(key.resolve(), Ok(None));
        ready.store(true, Ordering::SeqCst);
        assert_eq!(key.resolve(), Ok(Some("/projects/42".to_string())));
    }

    #[test]
    fn invalid_keys_are_configuration_errors() {
        assert_eq!(
            ResourceKey::from("   ").resolve(),
            Err(ConfigurationError::EmptyKey)
        );
        assert!(matches!(
            ResourceKey::from("/a\nb").resolve(),
            Err(ConfigurationError::InvalidKey { .. })
        ));
    }
}
