//! Bounded-concurrency execution of one batch.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moldata_storage::{StorageBackend, StorageError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::attempt::AttemptResult;
use crate::batcher::Batch;
use crate::config::EngineConfig;
use crate::error::UnitError;
use crate::progress::{EventSink, TransferEvent};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::unit::{Direction, TransferUnit, UnitId};

/// Results of one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One terminal result per started unit, in completion order.
    pub results: Vec<AttemptResult>,
    /// Units never started because the run was cancelled.
    pub not_started: Vec<UnitId>,
}

/// How a retried operation ended.
#[derive(Debug)]
pub(crate) enum RetryOutcome {
    Done { attempts: u32 },
    Failed { error: UnitError, attempts: u32 },
    /// Cancelled while waiting to retry.
    Interrupted { error: UnitError, attempts: u32 },
}

/// Runs `op` until it succeeds, the policy gives up, or `cancel` fires during
/// a backoff sleep. Each attempt is bounded by `op_timeout`.
pub(crate) async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op_timeout: Option<Duration>,
    seed: &str,
    mut op: F,
) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match op_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(r) => r.map_err(UnitError::from),
                Err(_) => Err(UnitError::Timeout(limit)),
            },
            None => op().await.map_err(UnitError::from),
        };
        let error = match outcome {
            Ok(()) => return RetryOutcome::Done { attempts: attempt },
            Err(e) => e,
        };

        match policy.decide(attempt, &error) {
            RetryDecision::GiveUp => {
                let error = if error.is_retryable() {
                    UnitError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    }
                } else {
                    error
                };
                return RetryOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }
            RetryDecision::Retry(delay) => {
                let delay = policy.jittered(delay, (seed, attempt));
                debug!(unit = seed, attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return RetryOutcome::Interrupted { error, attempts: attempt };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Per-unit state shared by every worker task.
#[derive(Clone)]
struct UnitRunner {
    backend: Arc<dyn StorageBackend>,
    policy: RetryPolicy,
    op_timeout: Option<Duration>,
    skip_existing: bool,
    direction: Direction,
    cancel: CancellationToken,
}

impl UnitRunner {
    async fn execute(&self, unit: TransferUnit) -> AttemptResult {
        let started = Instant::now();
        let id = unit.id().clone();

        if self.skip_existing && self.already_present(&unit).await {
            debug!(unit = %id, "already present, skipping transfer");
            return AttemptResult::already_present(id, started.elapsed());
        }

        let outcome = run_with_retry(
            &self.policy,
            &self.cancel,
            self.op_timeout,
            id.as_str(),
            || self.transfer(&unit),
        )
        .await;

        match outcome {
            RetryOutcome::Done { attempts } => {
                debug!(unit = %id, attempts, "unit transferred");
                AttemptResult::success(id, attempts, started.elapsed())
            }
            RetryOutcome::Failed { error, attempts } => {
                warn!(unit = %id, source = unit.source(), attempts, error = %error, "unit failed");
                AttemptResult::permanent(id, &error, attempts, started.elapsed())
            }
            RetryOutcome::Interrupted { error, attempts } => {
                debug!(unit = %id, attempts, "unit interrupted during backoff");
                AttemptResult::interrupted(id, &error, attempts, started.elapsed())
            }
        }
    }

    fn transfer<'a>(&'a self, unit: &'a TransferUnit) -> moldata_storage::StorageFuture<'a, ()> {
        match self.direction {
            Direction::Upload => self
                .backend
                .put(Path::new(unit.source()), unit.destination()),
            Direction::Download => self
                .backend
                .get(unit.source(), Path::new(unit.destination())),
        }
    }

    /// An upload counts as present only when the object size equals the
    /// expected size (`size_hint`, else the local file length). Probe errors
    /// and unknown sizes are not fatal; the unit is then transferred normally.
    async fn already_present(&self, unit: &TransferUnit) -> bool {
        match self.direction {
            Direction::Upload => {
                let expected = match unit.size_hint() {
                    Some(size) => size,
                    None => match tokio::fs::metadata(unit.source()).await {
                        Ok(m) if m.is_file() => m.len(),
                        _ => return false,
                    },
                };
                let probe = self.backend.stat(unit.destination());
                let meta = match self.op_timeout {
                    Some(limit) => match tokio::time::timeout(limit, probe).await {
                        Ok(r) => r,
                        Err(_) => return false,
                    },
                    None => probe.await,
                };
                match meta {
                    Ok(Some(meta)) => meta.size == Some(expected),
                    Ok(None) => false,
                    Err(e) => {
                        debug!(unit = %unit.id(), error = %e, "existence probe failed");
                        false
                    }
                }
            }
            Direction::Download => tokio::fs::metadata(unit.destination())
                .await
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false),
        }
    }
}

/// Executes a batch with at most `max_workers` units in flight.
pub struct WorkerPool {
    runner: UnitRunner,
    max_workers: usize,
    events: Option<EventSink>,
}

impl WorkerPool {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner: UnitRunner {
                backend,
                policy: config.retry_policy(),
                op_timeout: config.op_timeout(),
                skip_existing: config.skip_existing,
                direction: config.direction,
                cancel,
            },
            max_workers: config.max_workers.max(1),
            events: None,
        }
    }

    pub(crate) fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// Runs every unit of `batch` to a terminal result.
    ///
    /// Returns once all started units have finished. After cancellation no
    /// further units start; those are listed in
    /// [`BatchReport::not_started`].
    pub async fn run(&self, batch: Batch) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        let mut owners: HashMap<tokio::task::Id, UnitId> = HashMap::with_capacity(batch.len());
        let mut report = BatchReport::default();

        let mut units = batch.units.into_iter();
        while let Some(unit) = units.next() {
            let permit = tokio::select! {
                biased;
                _ = self.runner.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.not_started.push(unit.id().clone());
                break;
            };

            let id = unit.id().clone();
            let runner = self.runner.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                runner.execute(unit).await
            });
            owners.insert(handle.id(), id);
        }
        report
            .not_started
            .extend(units.map(|u| u.id().clone()));

        while let Some(joined) = tasks.join_next_with_id().await {
            let result = match joined {
                Ok((task_id, result)) => {
                    owners.remove(&task_id);
                    result
                }
                Err(e) => {
                    let Some(id) = owners.remove(&e.id()) else {
                        error!(error = %e, "worker task without owner");
                        continue;
                    };
                    let detail = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        e.to_string()
                    };
                    error!(unit = %id, error = %detail, "worker panicked");
                    AttemptResult::permanent(id, &UnitError::Worker(detail), 0, Duration::ZERO)
                }
            };

            if let Some(events) = &self.events {
                events.emit(TransferEvent::UnitFinished {
                    unit_id: result.unit_id.clone(),
                    status: result.status,
                    attempts: result.attempt_number,
                    already_present: result.already_present,
                });
            }
            report.results.push(result);
        }

        report
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => (*s).to_string(),
            Err(_) => "panic".to_string(),
        },
    }
}
