// Error types for the request pipeline

use thiserror::Error;

/// Errors raised by handlers and middleware in the request pipeline.
///
/// The audit middleware never creates these for its own bookkeeping; it only
/// observes them on the way out and re-raises them unchanged.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary error raised by downstream code.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Other(Box::new(err))
    }

    /// Short, stable name of the error variant.
    ///
    /// Used as the `kind` of the exception info recorded in audit actions.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "BadRequest",
            Error::Unauthorized(_) => "Unauthorized",
            Error::Forbidden(_) => "Forbidden",
            Error::NotFound(_) => "NotFound",
            Error::Internal(_) => "Internal",
            Error::Cancelled(_) => "Cancelled",
            Error::Io(_) => "Io",
            Error::Other(_) => "Other",
        }
    }
}
