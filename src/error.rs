//! Error taxonomy for the catalog core
//!
//! Errors fall into four classes: transient (provider network failures, store
//! contention), permanent per item (unknown media type, unhashable file),
//! configuration (missing key, unwatchable root) and caller cancellation.
//! Callers branch on [CatalogError::is_cancelled] and [CatalogError::is_retryable]
//! rather than matching strings.

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Error, Debug)]
pub enum CatalogError {
    /// The caller's cancellation token fired before the work finished
    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {what}")]
    NotFound { what: String },

    /// Provider is registered but has no credentials
    #[error("provider {provider} is disabled")]
    Disabled { provider: String },

    /// Analysis cannot route to providers without a classified type
    #[error("media type not available")]
    MediaTypeUnavailable,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    /// A worker queue was closed (component stopped)
    #[error("queue closed")]
    QueueClosed,
}

impl CatalogError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn provider(provider: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: err.to_string(),
        }
    }

    /// True when the caller asked for this. Never retried automatically.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Transient failures: skip the unit of work, a later pass may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { .. } => true,
            Self::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY / SQLITE_LOCKED
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Configuration errors prevent a component from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Encryption(_) | Self::Watch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_cancelled_is_distinct() {
        let err = CatalogError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_provider_errors_are_retryable() {
        let err = CatalogError::provider("tmdb", "connection reset");
        assert!(err.is_retryable());
        assert_matches!(err, CatalogError::Provider { ref provider, .. } if provider == "tmdb");
        assert_eq!(err.to_string(), "provider tmdb failed: connection reset");
    }

    #[test]
    fn test_config_is_fatal() {
        assert!(CatalogError::Config("missing key".into()).is_fatal());
        assert!(!CatalogError::MediaTypeUnavailable.is_fatal());
    }
}
