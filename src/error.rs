//! Error types for segann.

use thiserror::Error;

/// Errors that can occur while building, persisting, merging or searching an index.
///
/// Variants fall into four groups: configuration errors fail fast at the call
/// that triggered them, integrity errors abort the whole build/merge/write,
/// capacity errors are handled inside the merge coordinator, and I/O or format
/// errors are surfaced as-is.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Vector dimension does not match the field dimension
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Operation or encoding not supported
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Bookkeeping violated (ordinal out of bounds, neighbor count mismatch, ...)
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Operation not allowed in the current state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A delayed-init component was used before initialization
    #[error("{0} was not initialized (call initialize() before use)")]
    NotInitialized(&'static str),

    /// Ordinal space would exceed the format limit
    #[error("capacity exceeded: {required} ordinals required, limit is {limit}")]
    Capacity { required: u64, limit: u64 },

    /// Format error (bad magic, unknown version, truncated region)
    #[error("format error: {0}")]
    Format(String),

    /// Checksum mismatch (data corruption detected)
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    pub(crate) fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity(reason.into())
    }

    pub(crate) fn format(reason: impl Into<String>) -> Self {
        Self::Format(reason.into())
    }

    pub(crate) fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState(reason.into())
    }

    /// Configuration errors are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::DimensionMismatch { .. } | Self::Unsupported(_)
        )
    }

    /// Integrity errors mean any partial state must be discarded.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::Integrity(_) | Self::IllegalState(_) | Self::NotInitialized(_)
        )
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }
}

/// Result type for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(IndexError::DimensionMismatch {
            expected: 4,
            actual: 3
        }
        .is_configuration());
        assert!(IndexError::integrity("ordinal 9 out of bounds").is_integrity());
        assert!(IndexError::NotInitialized("diversity policy").is_integrity());
        assert!(IndexError::Capacity {
            required: 10,
            limit: 5
        }
        .is_capacity());
        assert!(!IndexError::format("bad magic").is_integrity());
    }

    #[test]
    fn test_error_display() {
        let err = IndexError::NotInitialized("DiversityPolicy");
        assert_eq!(
            err.to_string(),
            "DiversityPolicy was not initialized (call initialize() before use)"
        );
    }
}
