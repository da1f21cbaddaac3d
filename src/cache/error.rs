use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::domain::entities::{EntityKey, EntityKind};

/// Failure of a single backend round-trip.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("cache backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("cache backend returned an invalid value for `{key}`: {message}")]
    InvalidValue { key: String, message: String },
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Failures that escape the write path.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("`{op}` for `{entity}` still failing after {attempts} attempts")]
    RetriesExhausted {
        op: &'static str,
        entity: EntityKey,
        attempts: u32,
        #[source]
        source: BackendError,
    },
}

/// A dependency edge could not compute the dependents of an entity.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("entity `{entity}` not found in the store")]
    NotFound { entity: EntityKey },
    #[error("entity store failure: {message}")]
    Store { message: String },
}

impl ResolveError {
    pub fn not_found(entity: EntityKey) -> Self {
        Self::NotFound { entity }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}

/// Rejected dependency graph declaration.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("edge `{label}` ({from} -> {to}) must declare max_hops of at least 1")]
    UnboundedEdge {
        label: &'static str,
        from: EntityKind,
        to: EntityKind,
    },
    #[error("edge label `{label}` is declared twice")]
    DuplicateEdge { label: &'static str },
}

/// Outcome of a failed `get_or_render`.
///
/// `Render` carries the render function's own error unchanged.
#[derive(Debug)]
pub enum RenderError<E> {
    /// The entity was deleted; nothing is rendered for it any more.
    Gone(EntityKey),
    Render(E),
}

impl<E> RenderError<E> {
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }

    /// Returns the render function's error, if that is what failed.
    pub fn into_render(self) -> Option<E> {
        match self {
            Self::Render(error) => Some(error),
            Self::Gone(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RenderError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gone(entity) => write!(f, "entity `{entity}` no longer exists"),
            Self::Render(error) => write!(f, "render failed: {error}"),
        }
    }
}

impl<E> StdError for RenderError<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Gone(_) => None,
            Self::Render(error) => Some(error),
        }
    }
}
