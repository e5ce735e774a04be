//! Durable record of units that reached a terminal outcome.
//!
//! The checkpoint is a plain value: the engine loads it once, threads it
//! through [`CheckpointStore::merge_and_flush`] after every batch and never
//! shares it with workers. The file on disk is the single source of truth on
//! restart and is replaced atomically (temp file, fsync, rename).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::attempt::{AttemptResult, AttemptStatus};
use crate::error::CheckpointError;
use crate::unit::UnitId;

const FORMAT_VERSION: u32 = 1;

/// A unit that failed permanently, with its last error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub unit_id: UnitId,
    pub error: String,
}

/// Completed and permanently failed unit ids.
///
/// Invariant: an id is in at most one of `completed` and `failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    completed: BTreeSet<UnitId>,
    failed: BTreeMap<UnitId, String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    total_units_seen: u64,
}

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub completed: usize,
    pub failed: usize,
    /// Results left pending (interrupted units).
    pub pending: usize,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint {
    /// Creates an empty checkpoint.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            completed: BTreeSet::new(),
            failed: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            total_units_seen: 0,
        }
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    pub fn completed(&self) -> &BTreeSet<UnitId> {
        &self.completed
    }

    /// Last error of a permanently failed unit.
    pub fn failure(&self, id: &str) -> Option<&str> {
        self.failed.get(id).map(String::as_str)
    }

    pub fn failed(&self) -> impl Iterator<Item = FailedUnit> + '_ {
        self.failed.iter().map(|(id, error)| FailedUnit {
            unit_id: id.clone(),
            error: error.clone(),
        })
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn total_units_seen(&self) -> u64 {
        self.total_units_seen
    }

    pub fn set_total_units_seen(&mut self, total: u64) {
        self.total_units_seen = total;
    }

    /// Records a success, clearing any earlier failure for the same unit.
    pub fn mark_completed(&mut self, id: UnitId) {
        self.failed.remove(&id);
        self.completed.insert(id);
    }

    /// Records a permanent failure. A completed unit stays completed.
    pub fn mark_failed(&mut self, id: UnitId, error: impl Into<String>) -> bool {
        if self.completed.contains(&id) {
            return false;
        }
        self.failed.insert(id, error.into());
        true
    }

    /// Folds a batch's terminal results into the checkpoint.
    pub fn merge(&mut self, results: &[AttemptResult]) -> MergeStats {
        let mut stats = MergeStats::default();
        for result in results {
            match result.status {
                AttemptStatus::Success => {
                    self.mark_completed(result.unit_id.clone());
                    stats.completed += 1;
                }
                AttemptStatus::PermanentFailure => {
                    let error = result.error.clone().unwrap_or_else(|| "unknown error".into());
                    if self.mark_failed(result.unit_id.clone(), error) {
                        stats.failed += 1;
                    }
                }
                AttemptStatus::RetryableFailure => stats.pending += 1,
            }
        }
        self.updated_at = Utc::now();
        stats
    }
}

// ---------------------------------------------------------------------------
// Persisted form
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    total_units_seen: u64,
    completed: Vec<UnitId>,
    failed: Vec<FailedUnit>,
}

/// Accepted on-disk layouts, newest first. The flat `keys`/`urls` lists
/// come from the earlier upload and download tooling.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredCheckpoint {
    Current(CheckpointFile),
    LegacyKeys { keys: Vec<String> },
    LegacyUrls { urls: Vec<String> },
}

impl From<&Checkpoint> for CheckpointFile {
    fn from(c: &Checkpoint) -> Self {
        Self {
            version: FORMAT_VERSION,
            created_at: c.created_at,
            updated_at: c.updated_at,
            total_units_seen: c.total_units_seen,
            completed: c.completed.iter().cloned().collect(),
            failed: c.failed().collect(),
        }
    }
}

impl From<StoredCheckpoint> for Checkpoint {
    fn from(stored: StoredCheckpoint) -> Self {
        match stored {
            StoredCheckpoint::Current(file) => {
                let mut checkpoint = Checkpoint {
                    completed: BTreeSet::new(),
                    failed: BTreeMap::new(),
                    created_at: file.created_at,
                    updated_at: file.updated_at,
                    total_units_seen: file.total_units_seen,
                };
                for id in file.completed {
                    checkpoint.completed.insert(id);
                }
                for f in file.failed {
                    checkpoint.mark_failed(f.unit_id, f.error);
                }
                checkpoint
            }
            StoredCheckpoint::LegacyKeys { keys: ids } | StoredCheckpoint::LegacyUrls { urls: ids } => {
                let mut checkpoint = Checkpoint::new();
                checkpoint.total_units_seen = ids.len() as u64;
                for id in ids {
                    checkpoint.completed.insert(UnitId::new(id));
                }
                checkpoint
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Loads and atomically persists a [`Checkpoint`] at a file path.
///
/// Single writer: concurrent engines against one path are not supported.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/<kind>_<first 16 hex of sha256(label)>.json`.
    pub fn for_label(dir: &Path, kind: &str, label: &str) -> Self {
        let digest = hex::encode(Sha256::digest(label.as_bytes()));
        Self::new(dir.join(format!("{kind}_{}.json", &digest[..16])))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// Reads the persisted checkpoint; an absent file yields an empty one.
    pub async fn load(&self) -> Result<Checkpoint, CheckpointError> {
        // A leftover temp file means a flush died before its rename; the
        // previous checkpoint is still the valid one.
        let tmp = self.tmp_path();
        if tokio::fs::try_exists(&tmp).await.unwrap_or(false) {
            warn!(path = %tmp.display(), "discarding incomplete checkpoint write");
            let _ = tokio::fs::remove_file(&tmp).await;
        }

        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint, starting fresh");
                return Ok(Checkpoint::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let stored: StoredCheckpoint =
            serde_json::from_slice(&data).map_err(|source| CheckpointError::Corrupt {
                path: self.path.display().to_string(),
                source,
            })?;
        let checkpoint = Checkpoint::from(stored);
        debug!(
            path = %self.path.display(),
            completed = checkpoint.completed_count(),
            failed = checkpoint.failed_count(),
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }

    /// Durably writes `checkpoint`, replacing the previous file only once the
    /// new content is fully on disk.
    pub async fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec(&CheckpointFile::from(checkpoint))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&json).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        #[cfg(unix)]
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = tokio::fs::File::open(parent)
                .await
                .map_err(|e| self.io_error(e))?;
            dir.sync_all().await.map_err(|e| self.io_error(e))?;
        }

        debug!(
            path = %self.path.display(),
            completed = checkpoint.completed_count(),
            failed = checkpoint.failed_count(),
            bytes = json.len(),
            "checkpoint persisted"
        );
        Ok(())
    }

    /// Merges a batch's results into `checkpoint` and persists the whole
    /// updated value before returning it.
    pub async fn merge_and_flush(
        &self,
        mut checkpoint: Checkpoint,
        results: &[AttemptResult],
    ) -> Result<(Checkpoint, MergeStats), CheckpointError> {
        let stats = checkpoint.merge(results);
        self.persist(&checkpoint).await?;
        Ok((checkpoint, stats))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::UnitError;
    use moldata_storage::StorageError;

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path().join("ckpt/upload.json"));
        (tmp, store)
    }

    fn ok(id: &str) -> AttemptResult {
        AttemptResult::success(UnitId::from(id), 1, Duration::ZERO)
    }

    fn failed(id: &str) -> AttemptResult {
        let err = UnitError::Storage(StorageError::NotFound(id.into()));
        AttemptResult::permanent(UnitId::from(id), &err, 1, Duration::ZERO)
    }

    #[tokio::test]
    async fn load_missing_returns_empty() {
        let (_tmp, store) = store();
        let checkpoint = store.load().await.unwrap();
        assert_eq!(checkpoint.completed_count(), 0);
        assert_eq!(checkpoint.failed_count(), 0);
    }

    #[tokio::test]
    async fn empty_checkpoint_round_trips() {
        let (_tmp, store) = store();
        let checkpoint = Checkpoint::new();
        store.persist(&checkpoint).await.unwrap();
        assert_eq!(store.load().await.unwrap(), checkpoint);
    }

    #[tokio::test]
    async fn populated_checkpoint_round_trips() {
        let (_tmp, store) = store();
        let mut checkpoint = Checkpoint::new();
        checkpoint.set_total_units_seen(5);
        checkpoint.merge(&[ok("a"), ok("b"), failed("c"), ok("d")]);
        store.persist(&checkpoint).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(loaded.is_completed("a"));
        assert!(loaded.failure("c").unwrap().contains("not found"));
        assert_eq!(loaded.total_units_seen(), 5);
    }

    #[tokio::test]
    async fn persist_leaves_no_temp_file() {
        let (_tmp, store) = store();
        store.persist(&Checkpoint::new()).await.unwrap();
        assert!(store.path().exists());
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn torn_temp_file_is_ignored() {
        let (_tmp, store) = store();
        let mut checkpoint = Checkpoint::new();
        checkpoint.merge(&[ok("a")]);
        store.persist(&checkpoint).await.unwrap();

        // Simulate a crash halfway through the next flush.
        std::fs::write(store.tmp_path(), b"{\"version\":1,\"compl").unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let (_tmp, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), b"not json").unwrap();
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn legacy_key_list_loads_as_completed() {
        let (_tmp, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), br#"{"keys":["pdb/1abc.cif","pdb/2xyz.cif"]}"#).unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.completed_count(), 2);
        assert!(loaded.is_completed("pdb/1abc.cif"));

        std::fs::write(store.path(), br#"{"urls":["https://x/1.cif"]}"#).unwrap();
        assert!(store.load().await.unwrap().is_completed("https://x/1.cif"));
    }

    #[tokio::test]
    async fn merge_and_flush_persists_before_returning() {
        let (_tmp, store) = store();
        let (checkpoint, stats) = store
            .merge_and_flush(Checkpoint::new(), &[ok("a"), failed("b")])
            .await
            .unwrap();
        assert_eq!(stats, MergeStats { completed: 1, failed: 1, pending: 0 });

        let on_disk = store.load().await.unwrap();
        assert_eq!(on_disk, checkpoint);
    }

    #[test]
    fn success_clears_previous_failure() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.merge(&[failed("a")]);
        assert_eq!(checkpoint.failed_count(), 1);

        checkpoint.merge(&[ok("a")]);
        assert!(checkpoint.is_completed("a"));
        assert_eq!(checkpoint.failed_count(), 0);
    }

    #[test]
    fn failure_never_overrides_completion() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.merge(&[ok("a")]);
        let stats = checkpoint.merge(&[failed("a")]);
        assert_eq!(stats.failed, 0);
        assert!(checkpoint.is_completed("a"));
        assert!(checkpoint.failure("a").is_none());
    }

    #[test]
    fn interrupted_results_stay_pending() {
        let mut checkpoint = Checkpoint::new();
        let err = UnitError::Timeout(Duration::from_secs(1));
        let interrupted = AttemptResult::interrupted(UnitId::from("a"), &err, 2, Duration::ZERO);
        let stats = checkpoint.merge(&[interrupted]);
        assert_eq!(stats.pending, 1);
        assert!(!checkpoint.is_completed("a"));
        assert!(checkpoint.failure("a").is_none());
    }

    #[test]
    fn for_label_hashes_label() {
        let a = CheckpointStore::for_label(Path::new("/ckpt"), "upload", "pdb");
        let b = CheckpointStore::for_label(Path::new("/ckpt"), "upload", "pdbbind");
        assert_ne!(a.path(), b.path());
        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("upload_"));
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), "upload_".len() + 16 + ".json".len());
    }
}
