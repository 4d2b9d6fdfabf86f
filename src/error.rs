//! Error types shared by the transport, the coordinator and the store.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::http::StatusCode;

/// A failed fetch, as stored on a cache entry and delivered to subscribers.
///
/// Every failure the transport can produce is folded into one of these
/// variants; nothing is thrown past the cache boundary. The type is `Clone`
/// because one settlement is handed to every caller that joined the request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// The request never produced a response (connect failure, reset, timeout).
    #[error("network error: {message}")]
    Network { message: String },

    /// The server answered with a non-2xx status.
    #[error("request failed with HTTP {status}")]
    Http {
        status: StatusCode,
        payload: Option<Value>,
    },

    /// The server rejected the caller's credentials.
    #[error("authentication failed with HTTP {status}")]
    Auth {
        status: StatusCode,
        payload: Option<Value>,
    },

    /// The response body could not be decoded into the expected type.
    #[error("malformed response payload: {message}")]
    Parse { message: String },
}

impl FetchError {
    pub(crate) fn network(err: impl fmt::Display) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }

    pub(crate) fn parse(err: impl fmt::Display) -> Self {
        Self::Parse {
            message: err.to_string(),
        }
    }

    /// Returns the HTTP status for `Http` and `Auth` failures.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http { status, .. } | Self::Auth { status, .. } => Some(*status),
            Self::Network { .. } | Self::Parse { .. } => None,
        }
    }

    /// Returns the parsed error payload the server sent, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Http { payload, .. } | Self::Auth { payload, .. } => payload.as_ref(),
            Self::Network { .. } | Self::Parse { .. } => None,
        }
    }

    /// Returns `true` for credential failures, which suspend automatic revalidation.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// A programmer error detected while resolving a resource key.
///
/// Returned synchronously from the consumer API; never stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("resource key resolved to an empty string")]
    EmptyKey,

    #[error("resource key {key:?} contains control characters")]
    InvalidKey { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_by_variant() {
        let http = FetchError::Http {
            status: StatusCode::NOT_FOUND,
            payload: Some(serde_json::json!({ "error": "missing" })),
        };
        assert_eq!(http.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(http.payload().unwrap()["error"], "missing");
        assert!(!http.is_auth());

        let net = FetchError::network("connection refused");
        assert_eq!(net.status(), None);
        assert_eq!(net.to_string(), "network error: connection refused");
    }

    #[test]
    fn auth_display() {
        let err = FetchError::Auth {
            status: StatusCode::UNAUTHORIZED,
            payload: None,
        };
        assert!(err.is_auth());
        assert_eq!(
            err.to_string(),
            "authentication failed with HTTP 401 Unauthorized"
        );
    }
}
