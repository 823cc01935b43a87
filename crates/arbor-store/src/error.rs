//! Store error types

/// Errors raised by store backends and the typed record layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend failed to serve the request
    #[error("store backend error: {0}")]
    Backend(String),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Optimistic update lost the race too many times
    #[error("write conflict on {key} after {attempts} attempts")]
    Conflict {
        /// Contended key
        key: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Snapshot file could not be read or written
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Check if the operation may succeed when retried
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Backend(_))
    }
}
