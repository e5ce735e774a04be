//! Outcome of executing one unit.

use std::time::Duration;

use crate::error::UnitError;
use crate::unit::UnitId;

/// Terminal classification of a unit's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    /// Still retryable when the pool stopped, which only happens when a stop
    /// signal interrupted the backoff. The unit stays pending.
    RetryableFailure,
    PermanentFailure,
}

/// Result emitted by a worker for one unit.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub unit_id: UnitId,
    pub status: AttemptStatus,
    pub error: Option<String>,
    /// Number of the last attempt made (1-based; 0 if none ran).
    pub attempt_number: u32,
    /// Wall time across all attempts and backoff.
    pub duration: Duration,
    /// Succeeded without moving data because the destination already held it.
    pub already_present: bool,
}

impl AttemptResult {
    pub fn success(unit_id: UnitId, attempt_number: u32, duration: Duration) -> Self {
        Self {
            unit_id,
            status: AttemptStatus::Success,
            error: None,
            attempt_number,
            duration,
            already_present: false,
        }
    }

    pub fn already_present(unit_id: UnitId, duration: Duration) -> Self {
        Self {
            already_present: true,
            ..Self::success(unit_id, 0, duration)
        }
    }

    pub fn permanent(
        unit_id: UnitId,
        error: &UnitError,
        attempt_number: u32,
        duration: Duration,
    ) -> Self {
        Self {
            unit_id,
            status: AttemptStatus::PermanentFailure,
            error: Some(error.to_string()),
            attempt_number,
            duration,
            already_present: false,
        }
    }

    pub fn interrupted(
        unit_id: UnitId,
        error: &UnitError,
        attempt_number: u32,
        duration: Duration,
    ) -> Self {
        Self {
            unit_id,
            status: AttemptStatus::RetryableFailure,
            error: Some(format!("interrupted during backoff: {error}")),
            attempt_number,
            duration,
            already_present: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }
}
