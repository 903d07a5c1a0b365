//! Domain error type shared by every core operation.
//!
//! Operations never return transport status codes. Each [`Error`] carries a
//! semantic [`ErrorKind`], a human-readable message and, where one exists, the
//! offending identifier (the denied secret, the unknown execution id, ...). The
//! boundary layer maps the kind to its own protocol.

use std::error::Error as StdError;

/// Semantic error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The referenced resource does not exist.
    NotFound,
    /// The request is malformed or violates an input constraint.
    InvalidRequest,
    /// The caller is authenticated but not permitted to perform the action.
    Forbidden,
    /// The caller could not be authenticated.
    Unauthorized,
    /// The request conflicts with existing state.
    Conflict,
    /// A repository or provider failed; the caller may retry later.
    Unavailable,
    /// An invariant inside the process was violated.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name, suitable for structured logs and response bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidRequest => "invalid_request",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }

    /// Returns `true` when retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by runvoy core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A resource lookup found nothing.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Resource type (`execution`, `image`, `secret`, `user`, ...).
        resource: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Input validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The policy denied the action.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Human-readable reason.
        message: String,
        /// The resource that was denied, when a single one is responsible.
        resource: Option<String>,
    },

    /// Authentication failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A downstream dependency failed.
    #[error("{context}: {source}")]
    Unavailable {
        /// What the core was doing when the dependency failed.
        context: String,
        /// The underlying failure.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Semantic category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The offending identifier, if the error names one.
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Self::NotFound { id, .. } => Some(id),
            Self::Forbidden { resource, .. } => resource.as_deref(),
            _ => None,
        }
    }

    /// Build a [`Error::NotFound`].
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Build a [`Error::Forbidden`] that names the denied resource.
    pub fn forbidden_resource(message: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
            resource: Some(resource.into()),
        }
    }

    /// Build a [`Error::Forbidden`] without a specific resource.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
            resource: None,
        }
    }

    /// Wrap a dependency failure as [`Error::Unavailable`].
    pub fn unavailable(
        context: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::Unavailable {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
