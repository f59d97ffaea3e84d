use std::{error::Error as StdError, time::Duration};

use thiserror::Error;

/// Error kinds surfaced by the control plane core.
///
/// Handlers map these to HTTP status codes at the gateway boundary via
/// [`CoreError::http_status`]; inside the core they are matched on kind,
/// never on message text.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("{0}")]
    Timeout(String),

    /// Per-user concurrency queue overflowed its bounded wait.
    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    Engine(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error")]
    Other {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl CoreError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    #[must_use]
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    #[must_use]
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }

    #[must_use]
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    pub fn other(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Other {
            source: Box::new(source),
        }
    }

    /// The HTTP status this error maps to at the gateway boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::RateLimited { .. } => 429,
            Self::Timeout(_) => 408,
            Self::Busy(_) => 503,
            Self::Engine(_) | Self::Io(_) | Self::Other { .. } => 500,
        }
    }

    /// The `Retry-After` duration for rate-limited errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the error message is safe to echo to clients verbatim.
    ///
    /// Engine and internal errors leak browser internals; in production the
    /// gateway replaces them with a generic message.
    pub fn is_client_safe(&self) -> bool {
        !matches!(self, Self::Engine(_) | Self::Io(_) | Self::Other { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
