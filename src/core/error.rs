//! Error types for Tidepool operations.
//!
//! This module defines the canonical error type used throughout Tidepool.
//! All subsystems return `Result<T, TidepoolError>` and raise one of the
//! stable [`ErrorKind`]s; the API surface maps kinds to HTTP status codes.

use std::io;
use thiserror::Error;

/// Canonical error type for all Tidepool operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Several variants auto-convert from library errors via `#[from]`.
#[derive(Error, Debug)]
pub enum TidepoolError {
    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Request shape or values wrong
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Referenced entity missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation illegal in the entity's current state
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Sacred approval factor mismatch
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Attempt to modify an approved plan
    #[error("immutable: {0}")]
    Immutable(String),

    /// Entity with identical content already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Stored data fails its own invariants (hash or dimension mismatch)
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Embedding or generation service unreachable
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Upstream or self-imposed rate limit exhausted retries
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Task cancelled by request
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Catch-all for unexpected failures
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error taxonomy exposed to API clients in the `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    StateConflict,
    VerificationFailed,
    Immutable,
    AlreadyExists,
    IntegrityError,
    DependencyUnavailable,
    RateLimited,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::StateConflict => "StateConflict",
            ErrorKind::VerificationFailed => "VerificationFailed",
            ErrorKind::Immutable => "Immutable",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::IntegrityError => "IntegrityError",
            ErrorKind::DependencyUnavailable => "DependencyUnavailable",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl TidepoolError {
    /// Classify this error into the stable taxonomy.
    ///
    /// Library errors (SQLite, I/O, serde) surface as `Internal`; owners
    /// that can say something more precise wrap them before they escape.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TidepoolError::InvalidInput(_) => ErrorKind::InvalidInput,
            TidepoolError::NotFound(_) => ErrorKind::NotFound,
            TidepoolError::StateConflict(_) => ErrorKind::StateConflict,
            TidepoolError::VerificationFailed(_) => ErrorKind::VerificationFailed,
            TidepoolError::Immutable(_) => ErrorKind::Immutable,
            TidepoolError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            TidepoolError::Integrity(_) => ErrorKind::IntegrityError,
            TidepoolError::DependencyUnavailable(_) => ErrorKind::DependencyUnavailable,
            TidepoolError::RateLimited(_) => ErrorKind::RateLimited,
            TidepoolError::Cancelled(_) => ErrorKind::Cancelled,
            TidepoolError::Sqlite(_)
            | TidepoolError::Io(_)
            | TidepoolError::Serde(_)
            | TidepoolError::Internal(_) => ErrorKind::Internal,
        }
    }
}
