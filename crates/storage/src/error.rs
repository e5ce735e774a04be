//! Storage error taxonomy.

use std::io;

/// Errors produced by a single storage operation.
///
/// The variant is the classification: callers decide whether to retry with
/// [`is_retryable`](StorageError::is_retryable), never by inspecting the
/// message.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Network or disk blip; the same operation may succeed later.
    #[error("transient I/O error on {locator}: {detail}")]
    Transient { locator: String, detail: String },

    /// Credentials rejected or permission denied.
    #[error("access denied for {0}")]
    Auth(String),

    /// The source object or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The locator cannot be resolved to a valid path or URL.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    /// The remote refused the request for a reason that will not change on retry.
    #[error("request for {locator} rejected with status {status}")]
    Rejected { locator: String, status: u16 },
}

impl StorageError {
    /// Whether the failure is transient (worth another attempt).
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }

    pub(crate) fn transient(locator: &str, detail: impl std::fmt::Display) -> Self {
        StorageError::Transient {
            locator: locator.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Classifies a non-success HTTP status for `locator`.
    pub(crate) fn from_status(status: u16, locator: &str) -> Self {
        match status {
            401 | 403 => StorageError::Auth(locator.to_string()),
            404 => StorageError::NotFound(locator.to_string()),
            408 | 429 | 500..=599 => StorageError::transient(locator, format!("status {status}")),
            status => StorageError::Rejected {
                locator: locator.to_string(),
                status,
            },
        }
    }

    /// Classifies a filesystem error for `locator`.
    pub(crate) fn from_io(err: io::Error, locator: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(locator.to_string()),
            io::ErrorKind::PermissionDenied => StorageError::Auth(locator.to_string()),
            io::ErrorKind::InvalidInput => {
                StorageError::InvalidLocator(format!("{locator}: {err}"))
            }
            _ => StorageError::transient(locator, err),
        }
    }
}
