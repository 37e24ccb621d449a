//! Error types and result alias shared across MiniCloud components.
//!
//! The taxonomy mirrors how errors are handled, not where they originate:
//! validation failures surface to the user, conflicts signal "reload and
//! retry", backend failures are terminal for the current operation.

use crate::id::EntityKind;
use crate::state::State;

/// The result type used throughout MiniCloud.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in MiniCloud operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A field failed validation; deterministic, never retried.
    #[error("{entity}.{field} invalid: {message}")]
    Field {
        /// The entity kind the field belongs to.
        entity: EntityKind,
        /// The field name as it appears in the record JSON.
        field: &'static str,
        /// Human-readable description of the violation.
        message: String,
    },

    /// The requested entity does not exist.
    #[error("{entity} with id {id} not found")]
    NotFound {
        /// The entity kind that was looked up.
        entity: EntityKind,
        /// The identifier that was looked up.
        id: String,
    },

    /// A transaction guard failed; the caller should reload and retry.
    #[error("conflict committing transaction {xid}")]
    Conflict {
        /// The transaction ID that failed to commit.
        xid: String,
    },

    /// A state is not part of the machine, or not valid here.
    #[error("invalid state {state}")]
    InvalidState {
        /// The offending state.
        state: State,
    },

    /// A transition is not an edge of the machine for this initiator.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        /// The state the entity was in.
        from: State,
        /// The state the caller asked for.
        to: State,
    },

    /// A coordination-backend operation failed.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A record could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An external subsystem (storage cluster, hypervisor) failed.
    #[error("external error: {message}")]
    External {
        /// Description of the external failure.
        message: String,
    },

    /// The operation was cancelled before completion.
    #[error("operation interrupted")]
    Interrupted,
}

impl Error {
    /// Creates a field-validation error.
    #[must_use]
    pub fn field(entity: EntityKind, field: &'static str, message: impl Into<String>) -> Self {
        Self::Field {
            entity,
            field,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a backend error with a source cause.
    #[must_use]
    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an external-subsystem error.
    #[must_use]
    pub fn external(message: impl Into<String>) -> Self {
        Self::External {
            message: message.into(),
        }
    }

    /// Returns whether this error is an optimistic-concurrency conflict.
    ///
    /// Conflicts are the only errors the retry helper will retry.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
