//! Run orchestration: checkpoint, batches, pool, flush, shards, cleanup.
//!
//! Batches run strictly one after another. The checkpoint is merged and
//! flushed after every batch before the next one starts, so a crash loses at
//! most the batch in flight, and those units are simply redone on restart.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use moldata_storage::StorageBackend;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attempt::AttemptStatus;
use crate::batcher::Batcher;
use crate::checkpoint::{Checkpoint, CheckpointStore, FailedUnit};
use crate::cleanup::{cleanup_targets, remove_local_files};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::WorkerPool;
use crate::progress::{EventSink, RateMeter, TransferEvent};
use crate::shard::{ShardPacker, ShardReport};
use crate::unit::{TransferUnit, UnitId};

/// Outcome of [`TransferEngine::run`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Units that succeeded in this run (including already present ones).
    pub succeeded_count: usize,
    /// Units that failed permanently in this run, in input order.
    pub permanently_failed: Vec<FailedUnit>,
    /// Units skipped because the checkpoint already had them completed.
    pub skipped_count: usize,
    /// Successes that needed no transfer.
    pub already_present_count: usize,
    /// Units stopped in backoff by cancellation; still pending.
    pub interrupted_count: usize,
    /// Units never started because of cancellation; still pending.
    pub not_started_count: usize,
    pub cancelled: bool,
    pub shards: Vec<ShardReport>,
    /// Local files removed after the run.
    pub cleaned_count: usize,
}

impl RunSummary {
    pub fn failed_count(&self) -> usize {
        self.permanently_failed.len()
    }

    /// Units left for a later run.
    pub fn pending_count(&self) -> usize {
        self.interrupted_count + self.not_started_count
    }

    /// Every unit is done and every shard uploaded.
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self.permanently_failed.is_empty()
            && self.pending_count() == 0
            && self.shards.iter().all(ShardReport::is_uploaded)
    }
}

/// Drives a list of [`TransferUnit`]s to completion against one backend.
pub struct TransferEngine {
    backend: Arc<dyn StorageBackend>,
    config: EngineConfig,
    store: CheckpointStore,
    events: EventSink,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    cancel: CancellationToken,
}

impl TransferEngine {
    /// Creates an engine persisting to `config.checkpoint_location`.
    pub fn new(backend: Arc<dyn StorageBackend>, config: EngineConfig) -> Self {
        let store = CheckpointStore::new(config.checkpoint_location.clone());
        let (events, events_rx) = EventSink::channel();
        Self {
            backend,
            config,
            store,
            events,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the checkpoint store (e.g. one from
    /// [`CheckpointStore::for_label`]).
    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Token that stops the run: no new units start, in-flight units finish,
    /// and the checkpoint is flushed before `run` returns.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Transfers every unit not already completed.
    ///
    /// Unit failures never make this return `Err`; they are listed in the
    /// summary. Only checkpoint load or persist failures are fatal.
    pub async fn run(&self, units: &[TransferUnit]) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let mut checkpoint = self.store.load().await?;
        let batcher = Batcher::new(units, &checkpoint, self.config.batch_size);
        checkpoint.set_total_units_seen(batcher.distinct_count() as u64);

        let mut summary = RunSummary {
            skipped_count: batcher.skipped_count(),
            ..RunSummary::default()
        };
        let pending = batcher.pending_count();
        let batches = batcher.batch_count();
        if batcher.duplicate_count() > 0 {
            warn!(duplicates = batcher.duplicate_count(), "duplicate unit ids ignored");
        }
        info!(
            backend = self.backend.name(),
            direction = ?self.config.direction,
            distinct = batcher.distinct_count(),
            skipped = summary.skipped_count,
            pending,
            batches,
            checkpoint = %self.store.path().display(),
            "transfer run starting"
        );
        self.events.emit(TransferEvent::Started {
            distinct: batcher.distinct_count(),
            skipped: summary.skipped_count,
            pending,
            batches,
        });

        let pool = WorkerPool::new(Arc::clone(&self.backend), &self.config, self.cancel.clone())
            .with_events(self.events.clone());
        let mut failures: HashMap<UnitId, String> = HashMap::new();
        let mut meter = RateMeter::default();
        meter.record(0);
        let mut processed = 0usize;

        for batch in batcher {
            if self.cancel.is_cancelled() {
                break;
            }
            let index = batch.index;
            processed += batch.len();
            let report = pool.run(batch).await;

            for result in &report.results {
                match result.status {
                    AttemptStatus::Success => {
                        summary.succeeded_count += 1;
                        if result.already_present {
                            summary.already_present_count += 1;
                        }
                    }
                    AttemptStatus::PermanentFailure => {
                        let error = result.error.clone().unwrap_or_default();
                        failures.insert(result.unit_id.clone(), error);
                    }
                    AttemptStatus::RetryableFailure => summary.interrupted_count += 1,
                }
            }
            summary.not_started_count += report.not_started.len();

            let (next, stats) = self
                .store
                .merge_and_flush(checkpoint, &report.results)
                .await?;
            checkpoint = next;

            meter.record(report.results.len() as u64);
            let units_per_sec = meter.per_second();
            info!(
                batch = index,
                of = batches,
                completed = stats.completed,
                failed = stats.failed,
                pending = stats.pending + report.not_started.len(),
                units_per_sec = format_args!("{units_per_sec:.1}"),
                eta_secs = meter.eta((pending - processed) as u64).map(|d| d.as_secs()),
                "batch flushed"
            );
            self.events.emit(TransferEvent::BatchFlushed {
                index,
                completed: stats.completed,
                failed: stats.failed,
                pending: stats.pending + report.not_started.len(),
                units_per_sec,
            });
        }
        summary.not_started_count += pending - processed;
        summary.cancelled = self.cancel.is_cancelled();
        summary.permanently_failed = in_input_order(units, failures);

        if !summary.cancelled {
            self.finish(units, &checkpoint, &mut summary).await;
        }

        info!(
            succeeded = summary.succeeded_count,
            failed = summary.failed_count(),
            skipped = summary.skipped_count,
            already_present = summary.already_present_count,
            pending = summary.pending_count(),
            shards = summary.shards.len(),
            cleaned = summary.cleaned_count,
            cancelled = summary.cancelled,
            elapsed_secs = started.elapsed().as_secs(),
            "transfer run finished"
        );
        self.events.emit(TransferEvent::Finished {
            succeeded: summary.succeeded_count,
            failed: summary.failed_count(),
            cancelled: summary.cancelled,
        });
        Ok(summary)
    }

    /// Shard packing and local cleanup after all batches ran.
    async fn finish(&self, units: &[TransferUnit], checkpoint: &Checkpoint, summary: &mut RunSummary) {
        let completed_local = self.completed_local_files(units, checkpoint);

        if let Some(shard_config) = &self.config.shards {
            let packer = ShardPacker::new(
                Arc::clone(&self.backend),
                shard_config.clone(),
                self.config.retry_policy(),
                self.config.op_timeout(),
                self.cancel.clone(),
            );
            summary.shards = packer.pack_and_upload(&completed_local).await;
            for report in summary.shards.iter().filter(|r| r.is_uploaded()) {
                self.events.emit(TransferEvent::ShardUploaded {
                    key: report.key.clone(),
                    members: report.member_count(),
                });
            }
        }

        if self.config.keep_local || self.cancel.is_cancelled() {
            return;
        }
        let targets = cleanup_targets(
            self.config.direction,
            &completed_local,
            self.config.shards.as_ref().map(|_| summary.shards.as_slice()),
        );
        if !targets.is_empty() {
            summary.cleaned_count = remove_local_files(&targets).await;
        }
    }

    /// Local files of completed units that still exist, in input order.
    fn completed_local_files(&self, units: &[TransferUnit], checkpoint: &Checkpoint) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        units
            .iter()
            .filter(|u| checkpoint.is_completed(u.id().as_str()) && seen.insert(u.id().as_str()))
            .map(|u| u.local_path(self.config.direction).to_path_buf())
            .filter(|p| p.is_file())
            .collect()
    }
}

/// Orders failures by the first position of their unit in `units`.
fn in_input_order(units: &[TransferUnit], mut failures: HashMap<UnitId, String>) -> Vec<FailedUnit> {
    if failures.is_empty() {
        return Vec::new();
    }
    let mut ordered = Vec::with_capacity(failures.len());
    for unit in units {
        if let Some(error) = failures.remove(unit.id()) {
            ordered.push(FailedUnit {
                unit_id: unit.id().clone(),
                error,
            });
        }
    }
    ordered
}
