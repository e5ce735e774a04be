//! Error types for the transfer engine.

use std::time::Duration;

use moldata_storage::StorageError;

/// Failure of one attempt (or of all attempts) to move a unit.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<UnitError>,
    },

    #[error("worker failed: {0}")]
    Worker(String),
}

impl UnitError {
    /// Transient I/O faults and timeouts may succeed on a later attempt;
    /// auth, not-found, malformed locators and exhausted retries never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            UnitError::Storage(e) => e.is_retryable(),
            UnitError::Timeout(_) => true,
            UnitError::RetriesExhausted { .. } | UnitError::Worker(_) => false,
        }
    }
}

/// Errors reading or durably writing the checkpoint file.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint at {path} is not valid JSON: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors building a shard archive.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("shard I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shard builder task failed: {0}")]
    Join(String),

    #[error("shard upload failed: {0}")]
    Upload(String),
}

/// Run-level failures. Only checkpoint persistence halts a run; unit
/// failures are reported in the summary instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_kind() {
        assert!(UnitError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(UnitError::from(StorageError::Transient {
            locator: "k".into(),
            detail: "reset".into()
        })
        .is_retryable());
        assert!(!UnitError::from(StorageError::Auth("k".into())).is_retryable());
        assert!(!UnitError::from(StorageError::NotFound("k".into())).is_retryable());
        assert!(!UnitError::Worker("panic".into()).is_retryable());
    }

    #[test]
    fn exhausted_message_includes_cause() {
        let err = UnitError::RetriesExhausted {
            attempts: 4,
            last: Box::new(UnitError::Timeout(Duration::from_secs(30))),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("timed out"));
        assert!(!err.is_retryable());
    }
}
