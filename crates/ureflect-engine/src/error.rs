//! Error types for the reflection runtime

/// Result type for reflection operations
pub type ReflectResult<T> = Result<T, ReflectError>;

/// Reflection error taxonomy
///
/// Everything except [`ReflectError::Protocol`] is recoverable at the call
/// site. A protocol error means the running host no longer matches the
/// selected layout profile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReflectError {
    /// A pattern, table base, or bootstrap type could not be resolved
    #[error("Could not resolve {what}: {reason}")]
    Resolution {
        /// What was being resolved
        what: String,
        /// Why resolution failed
        reason: String,
    },

    /// Index outside a table or array
    #[error("Index {index} out of bounds (size {size})")]
    OutOfBounds {
        /// Requested index
        index: usize,
        /// Size at the time of the request
        size: usize,
    },

    /// A slot inside the declared extent of a table is unusable
    #[error("Invalid entry at index {index}: {reason}")]
    InvalidEntry {
        /// Slot index
        index: usize,
        /// What is wrong with the slot
        reason: String,
    },

    /// Named type, field, or function does not exist
    #[error("{what} '{name}' not found")]
    NotFound {
        /// Kind of thing looked up ("type", "field", ...)
        what: &'static str,
        /// Name used for the lookup
        name: String,
    },

    /// Declared kind or type identity differs from the expected one
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type name
        expected: String,
        /// Actual type name
        actual: String,
    },

    /// Numeric value does not fit the field's width
    #[error("Value {value} out of range for {kind}")]
    OutOfRange {
        /// Property kind name
        kind: &'static str,
        /// Rendered value
        value: String,
    },

    /// Requested length exceeds what the host's 32-bit count can represent
    #[error("Length {requested} exceeds maximum of {max}")]
    Length {
        /// Requested element count
        requested: usize,
        /// Largest representable count
        max: usize,
    },

    /// Host allocator returned null
    #[error("Host allocation of {size} bytes failed")]
    Allocation {
        /// Requested size in bytes
        size: usize,
    },

    /// Wrong number or shape of call arguments
    #[error("Argument error: {0}")]
    Argument(String),

    /// Host state machine did not produce an expected marker (fatal)
    #[error("Host protocol error: {0}")]
    Protocol(String),
}

impl ReflectError {
    /// Build a type mismatch from two displayable type names
    pub fn mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        ReflectError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Build a resolution failure
    pub fn resolution(what: impl Into<String>, reason: impl Into<String>) -> Self {
        ReflectError::Resolution {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error invalidates further reflective calls
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReflectError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_names_both_types() {
        let err = ReflectError::mismatch("Actor", "Pawn");
        assert_eq!(err.to_string(), "Type mismatch: expected Actor, got Pawn");
    }

    #[test]
    fn test_only_protocol_errors_are_fatal() {
        assert!(ReflectError::Protocol("missing marker".into()).is_fatal());
        assert!(!ReflectError::OutOfBounds { index: 3, size: 3 }.is_fatal());
        assert!(!ReflectError::Allocation { size: 16 }.is_fatal());
    }
}
