//! Storage error types.

/// Errors raised by a [`StorageBackend`](crate::StorageBackend).
///
/// Variants name the key or prefix involved so a failure can be traced
/// without a debugger. Values are never included.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The medium could not be opened or created.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    #[error("failed to list keys with prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// A transaction could not begin or commit.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// A stored key was not valid UTF-8.
    #[error("invalid key encoding: {reason}")]
    InvalidKey { reason: String },
}

impl StorageError {
    /// Whether retrying the same call could plausibly succeed.
    ///
    /// Open failures and malformed keys are configuration or data problems;
    /// everything else is treated as a transient medium failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Open { .. } | Self::InvalidKey { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_invalid_key_are_not_transient() {
        let open = StorageError::Open {
            path: "/nope".to_owned(),
            reason: "denied".to_owned(),
        };
        let bad_key = StorageError::InvalidKey {
            reason: "utf-8".to_owned(),
        };
        assert!(!open.is_transient());
        assert!(!bad_key.is_transient());
    }

    #[test]
    fn io_failures_are_transient() {
        let write = StorageError::Write {
            key: "slices/ab".to_owned(),
            reason: "disk full".to_owned(),
        };
        assert!(write.is_transient());
        assert!(write.to_string().contains("slices/ab"));
    }
}
