//! Error types for content-sync
//!
//! This module provides the error taxonomy for the library:
//! - [`DownloadError`] - transport failures (retryable or not)
//! - [`ValidationError`] - size and digest mismatches, never retried
//! - [`DatabaseError`] - persistence failures, including the recoverable [`DatabaseError::Conflict`]
//! - [`Error`] - the top-level error every public operation returns
//!
//! Per-item failures while applying a change set are wrapped in
//! [`ChangeFailed`](crate::changeset::ChangeFailed) and reported, never returned.

use crate::validation::Algorithm;
use thiserror::Error;

/// Result type alias for content-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for content-sync
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "concurrency")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Download (transport) error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Downloaded bytes failed validation
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error on a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Returns true when this error is a recoverable uniqueness conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Database(DatabaseError::Conflict(_)))
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Uniqueness constraint violated (the row already exists)
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DatabaseError {
    /// Classify a failed write: unique violations become [`DatabaseError::Conflict`],
    /// everything else a [`DatabaseError::QueryFailed`] with `context` prepended.
    pub fn from_write(context: &str, error: sqlx::Error) -> Self {
        let unique = error
            .as_database_error()
            .map(|e| e.is_unique_violation())
            .unwrap_or(false);
        if unique {
            DatabaseError::Conflict(format!("{}: {}", context, error))
        } else {
            DatabaseError::QueryFailed(format!("{}: {}", context, error))
        }
    }
}

/// Transport failures surfaced by a [`Transport`](crate::download::Transport)
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Generic transport failure (connection reset, timeout, 5xx); retryable
    #[error("download of {url} failed: {reason}")]
    Failed {
        /// The URL being fetched
        url: String,
        /// What went wrong
        reason: String,
    },

    /// The remote reported the resource does not exist
    #[error("{url} not found")]
    NotFound {
        /// The URL being fetched
        url: String,
    },

    /// The remote refused the request (401/403, permission denied)
    #[error("not authorized to fetch {url}")]
    NotAuthorized {
        /// The URL being fetched
        url: String,
    },

    /// The URL cannot be fetched by any configured transport
    #[error("cannot fetch {url}: {reason}")]
    Unsupported {
        /// The URL being fetched
        url: String,
        /// Why it is unusable
        reason: String,
    },
}

impl DownloadError {
    /// Generic failure for `url` with a displayable reason
    pub fn failed(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        DownloadError::Failed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Unusable URL: unparsable, unknown scheme or not a local path
    pub fn unsupported(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        DownloadError::Unsupported {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// The URL the failure refers to
    pub fn url(&self) -> &str {
        match self {
            DownloadError::Failed { url, .. }
            | DownloadError::Unsupported { url, .. }
            | DownloadError::NotFound { url }
            | DownloadError::NotAuthorized { url } => url,
        }
    }
}

/// Validation failures detected after the full body was received
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Received byte count differs from the expected size
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Expected number of bytes
        expected: u64,
        /// Number of bytes actually received
        actual: u64,
    },

    /// Computed digest differs from the expected digest
    #[error("{algorithm} digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest algorithm
        algorithm: Algorithm,
        /// Expected hex digest
        expected: String,
        /// Computed hex digest
        actual: String,
    },

    /// The named digest algorithm is not supported
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl ValidationError {
    /// Expected value of a mismatch, rendered as a string
    pub fn expected(&self) -> Option<String> {
        match self {
            ValidationError::SizeMismatch { expected, .. } => Some(expected.to_string()),
            ValidationError::DigestMismatch { expected, .. } => Some(expected.clone()),
            ValidationError::UnsupportedAlgorithm(_) => None,
        }
    }

    /// Actual value of a mismatch, rendered as a string
    pub fn actual(&self) -> Option<String> {
        match self {
            ValidationError::SizeMismatch { actual, .. } => Some(actual.to_string()),
            ValidationError::DigestMismatch { actual, .. } => Some(actual.clone()),
            ValidationError::UnsupportedAlgorithm(_) => None,
        }
    }

    /// Returns true for the expected/actual mismatch variants
    pub fn is_mismatch(&self) -> bool {
        !matches!(self, ValidationError::UnsupportedAlgorithm(_))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_mismatch_exposes_expected_and_actual() {
        let err = ValidationError::SizeMismatch {
            expected: 100,
            actual: 99,
        };
        assert_eq!(err.expected().as_deref(), Some("100"));
        assert_eq!(err.actual().as_deref(), Some("99"));
        assert!(err.is_mismatch());
        assert_eq!(
            err.to_string(),
            "size mismatch: expected 100 bytes, got 99"
        );
    }

    #[test]
    fn digest_mismatch_display_names_the_algorithm() {
        let err = ValidationError::DigestMismatch {
            algorithm: Algorithm::Sha256,
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(
            err.to_string(),
            "sha256 digest mismatch: expected aa, got bb"
        );
    }

    #[test]
    fn unsupported_algorithm_is_not_a_mismatch() {
        let err = ValidationError::UnsupportedAlgorithm("crc32".into());
        assert!(!err.is_mismatch());
        assert!(err.expected().is_none());
        assert!(err.actual().is_none());
    }

    #[test]
    fn download_error_reports_its_url() {
        let errors = [
            DownloadError::failed("http://a/x", "reset"),
            DownloadError::NotFound {
                url: "http://a/x".into(),
            },
            DownloadError::NotAuthorized {
                url: "http://a/x".into(),
            },
        ];
        for err in errors {
            assert_eq!(err.url(), "http://a/x");
        }
    }

    #[test]
    fn conflict_is_detected_through_the_top_level_error() {
        let err = Error::from(DatabaseError::Conflict("content".into()));
        assert!(err.is_conflict());
        assert!(!Error::Other("x".into()).is_conflict());
    }

    #[test]
    fn config_helper_records_the_key() {
        match Error::config("backlog", "too small") {
            Error::Config { message, key } => {
                assert_eq!(message, "too small");
                assert_eq!(key.as_deref(), Some("backlog"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
