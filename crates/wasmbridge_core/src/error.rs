//! Core error types for wasmbridge.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid handle format
    InvalidId {
        /// What was wrong
        reason: String,
    },

    /// Invalid hash format
    InvalidHash {
        /// What was wrong
        reason: String,
    },

    /// Unknown value type name
    UnknownValType {
        /// Unrecognised name
        name: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::InvalidHash { reason } => write!(f, "Invalid hash: {}", reason),
            Self::UnknownValType { name } => write!(f, "Unknown value type: {}", name),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<crate::hash::HashError> for CoreError {
    fn from(err: crate::hash::HashError) -> Self {
        Self::InvalidHash {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidId {
            reason: "missing prefix".to_string(),
        };
        assert_eq!(format!("{}", err), "Invalid ID: missing prefix");

        let err = CoreError::UnknownValType {
            name: "v128".to_string(),
        };
        assert_eq!(format!("{}", err), "Unknown value type: v128");
    }

    #[test]
    fn test_from_hash_error() {
        let err: CoreError = crate::hash::HashError::InvalidLength { found: 3 }.into();
        assert!(err.to_string().contains("expected 32"));
    }
}
