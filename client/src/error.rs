//! Unified error handling for the client.

use std::time::Duration;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("engine error: {0}")]
    Engine(#[from] tandem_engine::Error),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("sync cycle cancelled")]
    Cancelled,

    #[error("sync cycle failed: {0}")]
    CycleFailed(String),

    #[error("entity not found: {entity_type}/{entity_id}")]
    EntityNotFound {
        entity_type: String,
        entity_id: String,
    },

    #[error("conflict record not found: {0}")]
    ConflictNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Transient errors are retried under the backoff policy; everything
    /// else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Transport("connection reset".into()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(10)).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Crypto("bad key".into()).is_transient());
    }
}
