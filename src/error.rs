//! Error types for stores, configuration and the middleware.
use crate::engine::Decision;
use std::fmt;
use std::time::Duration;

/// Failure talking to a window or violation backend.
///
/// Request-time paths never surface these: every variant is handled by failing open. Only
/// administrative calls such as [`RateLimitEngine::reset`](crate::RateLimitEngine::reset)
/// return them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer within the configured deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered with data that could not be interpreted.
    #[error("store returned malformed data: {0}")]
    Corrupt(String),
    /// Concurrent writers kept replacing the document; the update was abandoned.
    #[error("conflicting writes to {0}")]
    Conflict(String),
}

/// Startup configuration errors. These are fatal: a process must not serve traffic with an
/// incomplete or nonsensical limit table.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The policy table has no entry for a `(class, role)` pair.
    #[error("no limit policy for {class}/{role}")]
    MissingPolicy { class: String, role: String },
    /// A policy entry exists but cannot be enforced.
    #[error("invalid limit policy for {class}/{role}: {reason}")]
    InvalidPolicy { class: String, role: String, reason: String },
    /// A scalar setting is out of range or unparsable.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    /// An endpoint class or role name is not recognised.
    #[error("unknown name: {0}")]
    UnknownName(String),
    /// The configuration document is not valid JSON for the expected shape.
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error returned by [`RateLimitService`](crate::middleware::RateLimitService).
#[derive(Debug, Clone)]
pub enum GuardError<E> {
    /// The request was rejected; the decision carries the headers to render.
    RateLimited(Decision),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited(decision) => match decision.blocked_until {
                Some(until) => write!(
                    f,
                    "rate limited: blocked until {} ({} violations)",
                    until, decision.violations
                ),
                None => write!(
                    f,
                    "rate limited: limit {} exceeded, resets at {}",
                    decision.limit, decision.reset_at
                ),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited(_) => None,
        }
    }
}

impl<E> GuardError<E> {
    /// Check if this error is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
    /// Borrow the rejecting decision if present.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::RateLimited(d) => Some(d),
            Self::Inner(_) => None,
        }
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    fn denied(blocked_until: Option<u64>) -> Decision {
        Decision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: 70_000,
            violations: 5,
            backoff_multiplier: 16,
            blocked_until,
        }
    }

    #[test]
    fn rate_limited_display_mentions_reset() {
        let err: GuardError<io::Error> = GuardError::RateLimited(denied(None));
        let msg = err.to_string();
        assert!(msg.contains("limit 5"));
        assert!(msg.contains("70000"));
        assert!(err.source().is_none());
    }

    #[test]
    fn blocked_display_mentions_until() {
        let err: GuardError<io::Error> = GuardError::RateLimited(denied(Some(123)));
        assert!(err.to_string().contains("blocked until 123"));
        assert_eq!(err.decision().and_then(|d| d.blocked_until), Some(123));
    }

    #[test]
    fn inner_is_exposed_as_source() {
        let err = GuardError::Inner(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!err.is_rate_limited());
        assert_eq!(err.source().map(|e| e.to_string()), Some("boom".to_string()));
        assert_eq!(err.into_inner().map(|e| e.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn store_error_display() {
        let err = StoreError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
