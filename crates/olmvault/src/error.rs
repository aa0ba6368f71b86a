//! Key store error types.
//!
//! Every store operation returns [`StoreError`]. The variants are the
//! taxonomy the degradation controller routes on:
//! - `Unavailable`: the backend cannot be reached right now (retryable)
//! - `Conflict`: a constraint rejected the write
//! - `Malformed`: a stored value cannot be decoded
//! - `Schema`: the table layout is incompatible (fatal at startup)
//! - `Backend`: any other driver failure

use thiserror::Error;

use crate::schema::SchemaError;

/// Errors that can occur during key store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable, pool exhausted, or connection lost
    #[error("key store unavailable: {0}")]
    Unavailable(String),

    /// Constraint violation surfaced by the backend
    #[error("constraint conflict: {0}")]
    Conflict(String),

    /// Stored value could not be decoded back into a record
    #[error("malformed {entity}: {reason}")]
    Malformed {
        /// Entity whose row failed to decode
        entity: &'static str,
        /// Decoder message
        reason: String,
    },

    /// Schema is missing pieces that cannot be added, or has the wrong shape
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the error means "backend unreachable" rather than "request
    /// rejected".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub(crate) fn malformed(entity: &'static str, reason: impl ToString) -> Self {
        Self::Malformed { entity, reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_unavailable() {
        assert!(StoreError::Unavailable("down".into()).is_unavailable());
        assert!(!StoreError::Conflict("dup".into()).is_unavailable());
        assert!(!StoreError::malformed("account", "bad").is_unavailable());
        assert!(!StoreError::Backend("syntax".into()).is_unavailable());
    }

    #[test]
    fn test_schema_error_converts() {
        let err: StoreError =
            SchemaError::UnsupportedVersion { found: 9, supported: 1 }.into();
        assert!(matches!(err, StoreError::Schema(_)));
        assert!(err.to_string().contains("version 9"));
    }
}
