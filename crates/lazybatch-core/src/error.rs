//! Loader error types.

use std::fmt;

use thiserror::Error;

use crate::entity::EntityId;

/// Accepted argument count of a derivation.
///
/// Displays as `min..max` when optional arguments exist, otherwise as the
/// exact count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: usize,
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}..{}", self.min, self.max)
        }
    }
}

/// Errors raised while declaring, binding or computing derived attributes.
///
/// Errors are `Clone` so a failed batch unit can hand the same error to
/// every later reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    /// The derivation has no batch body.
    #[error("derivation '{derivation}' does not implement a batch body")]
    NotImplemented { derivation: String },

    /// The batch body ran over a non-empty element set but recorded nothing.
    #[error(
        "nothing was produced by '{derivation}'; the derivation must record a result for each element"
    )]
    NotFilled { derivation: String },

    /// No result was recorded for the requested entity.
    #[error("no result was recorded for entity {entity} by '{derivation}'")]
    NotLoaded { derivation: String, entity: EntityId },

    /// A required argument was omitted.
    #[error(
        "'{derivation}' expects {arity} arguments but {given} were given; missing [{}]",
        .missing.join(", ")
    )]
    MissingArgument {
        derivation: String,
        arity: Arity,
        given: usize,
        missing: Vec<String>,
    },

    /// A supplied argument is not declared by the derivation.
    #[error("'{derivation}' does not define argument '{argument}'")]
    InvalidArgument {
        derivation: String,
        argument: String,
    },

    /// The entity's type declares no derivation under this name.
    #[error("derived attribute '{attribute}' is not defined for this entity")]
    UnknownAttribute { attribute: String },

    /// A result was read back as a different type than the derivation produces.
    #[error("'{derivation}' produces {actual}, not {expected}")]
    TypeMismatch {
        derivation: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The derivation body returned an error.
    #[error("derivation '{derivation}' failed: {message}")]
    DerivationFailed { derivation: String, message: String },

    /// The derivation body panicked during an earlier computation.
    #[error("derivation '{derivation}' was interrupted during an earlier computation")]
    Interrupted { derivation: String },
}

impl LoaderError {
    /// Wraps a host error raised inside a derivation body.
    pub fn failed(derivation: impl Into<String>, err: impl fmt::Display) -> Self {
        LoaderError::DerivationFailed {
            derivation: derivation.into(),
            message: err.to_string(),
        }
    }

    /// Returns true for errors caused by the arguments rather than the body.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            LoaderError::MissingArgument { .. } | LoaderError::InvalidArgument { .. }
        )
    }
}

/// Result type for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
