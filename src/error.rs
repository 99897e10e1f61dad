//! Error types for topology reconciliation
//!
//! Errors fall into a small taxonomy that drives requeue behavior: validation
//! failures are terminal until someone fixes the object or class, conflicts
//! mean the pass must re-read fresh state, and store/transport failures are
//! retried with backoff.

use thiserror::Error;

/// Main error type for topology reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error not mapped to a more specific variant
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object expected to exist was not found in the store
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespace of the missing object
        namespace: String,
        /// Name of the missing object
        name: String,
    },

    /// Create collided with an existing object
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Kind of the object
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// Optimistic-concurrency mismatch on a conditional write
    #[error("conflict writing {kind} {namespace}/{name}: expected version {expected:?}")]
    Conflict {
        /// Kind of the object
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// Version token the write was conditioned on
        expected: String,
    },

    /// Document failed shape validation (missing kind/apiVersion/spec/status, kind mismatch)
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Blueprint or configuration failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Object store unavailable or returned an unexpected failure
    #[error("store error: {0}")]
    Store(String),

    /// The reconcile pass was cancelled by its caller
    #[error("reconcile cancelled")]
    Cancelled,

    /// Errors collected from independent units of one reconcile pass
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    match errors {
        [single] => single.to_string(),
        many => {
            let joined = many
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("[{}]", joined)
        }
    }
}

impl Error {
    /// Create a not-found error for the given object coordinates
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for the given object coordinates
    pub fn already_exists(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for a write conditioned on `expected`
    pub fn conflict(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            expected: expected.into(),
        }
    }

    /// Create an invalid-object error with the given message
    pub fn invalid_object(msg: impl Into<String>) -> Self {
        Self::InvalidObject(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// True if the object was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if this is an optimistic-concurrency conflict.
    ///
    /// An aggregate is a conflict only if every member is.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Aggregate(errors) => !errors.is_empty() && errors.iter().all(Error::is_conflict),
            _ => false,
        }
    }

    /// True if the error needs an external correction before a retry can succeed.
    ///
    /// An aggregate is terminal only if every member is.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Validation(_) | Self::InvalidObject(_) => true,
            Self::Aggregate(errors) => !errors.is_empty() && errors.iter().all(Error::is_terminal),
            _ => false,
        }
    }

    /// True if a later pass may succeed without external correction
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. }
            | Self::AlreadyExists { .. }
            | Self::Store(_)
            | Self::Kube(_)
            | Self::Cancelled
            | Self::NotFound { .. } => true,
            Self::Aggregate(errors) => errors.iter().any(Error::is_retryable),
            Self::Validation(_) | Self::InvalidObject(_) | Self::Serialization(_) => false,
        }
    }

    /// True if any member of the error (or the error itself) is terminal
    pub fn has_terminal(&self) -> bool {
        match self {
            Self::Aggregate(errors) => errors.iter().any(Error::has_terminal),
            other => other.is_terminal(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
