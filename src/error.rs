//! Crate-wide error type and the caller-visible error taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Caller-visible error kinds.
///
/// Handlers map these onto transport status codes; the engine itself only
/// reasons about kinds when deciding whether an operation is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Gone,
    Conflict,
    PreconditionFailed,
    MethodNotAllowed,
    RequestNotValid,
    Unauthorized,
    RateLimited,
    Unavailable,
    Canceled,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Resource {resource_type}/{id} not found")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Version {version_id} of {resource_type}/{id} not found")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: i32,
    },

    /// The current version of the resource is a delete tombstone.
    #[error("Resource {resource_type}/{id} has been deleted")]
    ResourceDeleted {
        resource_type: String,
        id: String,
        version_id: Option<i32>,
    },

    /// Optimistic concurrency check failed (If-Match or job etag).
    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i32, actual: i32 },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request not valid: {0}")]
    RequestNotValid(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Backend asked us to slow down.
    #[error("Rate limited by storage backend: {0}")]
    RateLimited(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceNotFound { .. } | Error::VersionNotFound { .. } => ErrorKind::NotFound,
            Error::ResourceDeleted { .. } => ErrorKind::Gone,
            Error::VersionConflict { .. } | Error::PreconditionFailed(_) => {
                ErrorKind::PreconditionFailed
            }
            Error::MethodNotAllowed(_) => ErrorKind::MethodNotAllowed,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::RequestNotValid(_) => ErrorKind::RequestNotValid,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Canceled => ErrorKind::Canceled,
            Error::Database(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the store layer may transparently retry the underlying I/O.
    ///
    /// `PreconditionFailed` is deliberately excluded: it is a caller contract
    /// violation and must surface unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::RateLimited | ErrorKind::Unavailable)
    }
}
