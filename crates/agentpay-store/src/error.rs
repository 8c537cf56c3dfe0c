//! Error types for the `agentpay-store` crate.

/// Errors that can occur when talking to a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or the connection dropped mid-call.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed the operation.
    #[error("storage operation failed: {0}")]
    Backend(String),

    /// A stored value did not have the shape the caller expected.
    #[error("malformed value under {key}: {reason}")]
    Corrupt {
        /// Key holding the malformed value.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl StoreError {
    /// Helper for the common "counter key held a non-integer" case.
    pub(crate) fn non_integer(key: &str) -> Self {
        Self::Corrupt { key: key.to_owned(), reason: "expected integer counter".to_owned() }
    }
}
