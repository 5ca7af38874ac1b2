// src/error.rs

use std::time::Duration;
use thiserror::Error;

/// Core error types for Entropy
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O errors with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Entity already exists or two selections clash
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Malformed atom, version, dependency or timestamp
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Remote fetch failed (non-timeout)
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Remote fetch exceeded its time bound; callers may retry
    #[error("Fetch of {url} timed out after {timeout:?}")]
    FetchTimeout { url: String, timeout: Duration },

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Local or fetched repository data cannot be trusted
    #[error("Corrupt repository {repository}: {reason}")]
    CorruptRepository { repository: String, reason: String },

    /// No package satisfies a dependency of `atom`
    #[error("Unsatisfied dependency: {atom} requires {missing}")]
    UnsatisfiedDependency { atom: String, missing: String },

    /// The dependency graph contains a cycle through these atoms
    #[error("Cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// Another holder owns the repository lock
    #[error("Repository {repository} is locked by another operation")]
    LockContention { repository: String },

    /// Soname required but not resolvable to exactly one provider
    #[error("Broken linkage: {atom} needs {soname} ({reason})")]
    BrokenLinkage {
        atom: String,
        soname: String,
        reason: String,
    },

    /// Branch name is not acceptable
    #[error("Invalid branch: {0}")]
    InvalidBranch(String),

    /// Operation aborted through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::FetchTimeout { .. } | Error::LockContention { .. } | Error::DownloadError(_)
        )
    }
}

/// Result type alias using Entropy's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_dependency_message() {
        let err = Error::CyclicDependency(vec!["app-misc/a".to_string(), "app-misc/b".to_string()]);
        assert_eq!(err.to_string(), "Cyclic dependency: app-misc/a -> app-misc/b");
    }

    #[test]
    fn test_retryable_errors() {
        let timeout = Error::FetchTimeout {
            url: "http://mirror/x".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(timeout.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::CyclicDependency(vec![]).is_retryable());
    }
}
