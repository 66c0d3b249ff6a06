// 🚨 Error Taxonomy - Fatal vs Transient vs "not really an error"
//
// Fatal      → billing credentials rejected; halts the whole process
// Transient  → network / HTTP / platform hiccups; logged, retried next cycle
// NotFound   → NOT an error: modeled as `Ok(None)` by the billing client

use thiserror::Error;

/// Result alias used by every fallible library function.
pub type Result<T> = std::result::Result<T, SyncError>;

#[must_use = "errors should be handled, propagated, or explicitly logged"]
#[derive(Debug, Error)]
pub enum SyncError {
    /// Billing provider rejected our session. Continuing would silently deny
    /// everyone, so this one stops the process.
    #[error("billing provider rejected credentials (401/403): {0}")]
    AuthExpired(String),

    /// Unexpected status or malformed payload from the billing provider.
    #[error("transient billing error: {0}")]
    Transient(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Chat platform failure (member lookup, role mutation, message delivery).
    #[error("chat platform error: {0}")]
    Platform(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("database lock poisoned")]
    LockPoisoned,
}

impl SyncError {
    /// Only credential rejection escapes the scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::AuthExpired(_))
    }

    /// Errors worth retrying with backoff before giving up on the current cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient(_)
                | SyncError::Http(_)
                | SyncError::Platform(_)
                | SyncError::Timeout(_)
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_only_auth_is_fatal() {
        assert!(SyncError::AuthExpired("cookie".into()).is_fatal());
        assert!(!SyncError::Transient("503".into()).is_fatal());
        assert!(!SyncError::Platform("gateway".into()).is_fatal());
        assert!(!SyncError::Timeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(SyncError::Transient("502".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(3)).is_retryable());
        assert!(!SyncError::AuthExpired("x".into()).is_retryable());
        assert!(!SyncError::Config("bad".into()).is_retryable());
        assert!(!SyncError::LockPoisoned.is_retryable());
    }

    #[test]
    fn test_messages_are_actionable() {
        let err = SyncError::AuthExpired("session cookie invalidated".into());
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("session cookie"));
    }
}
