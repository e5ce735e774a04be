//! Packs completed files into tar shards and uploads them.
//!
//! Many small objects are expensive to list and fetch; shards group them
//! into fewer, larger archives. Shard names carry the member range and a
//! digest of the member list, so a rerun over the same files reuses the
//! archive already on disk and skips the upload when the object exists.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use moldata_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ShardError;
use crate::pool::{RetryOutcome, run_with_retry};
use crate::retry::RetryPolicy;

/// Shard layout and naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Files per archive.
    #[serde(default = "default_shard_size")]
    pub shard_size: usize,

    /// Local directory for archives.
    #[serde(default = "default_shard_dir")]
    pub shard_dir: PathBuf,

    /// Prepended to `shards/<file>` to form the object key.
    #[serde(default)]
    pub key_prefix: String,

    /// Archive name stem.
    #[serde(default = "default_name")]
    pub name: String,

    /// Member paths inside the archive are made relative to this directory;
    /// without it, only the file name is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<PathBuf>,
}

fn default_shard_size() -> usize {
    1000
}

fn default_shard_dir() -> PathBuf {
    PathBuf::from("_shards")
}

fn default_name() -> String {
    "data".into()
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_size: default_shard_size(),
            shard_dir: default_shard_dir(),
            key_prefix: String::new(),
            name: default_name(),
            strip_prefix: None,
        }
    }
}

/// Outcome of one shard.
#[derive(Debug, Clone)]
pub struct ShardReport {
    /// Object key of the archive.
    pub key: String,
    /// Local archive path.
    pub path: PathBuf,
    pub members: Vec<PathBuf>,
    /// The object already existed and was not uploaded again.
    pub already_present: bool,
    /// Set when building or uploading failed.
    pub error: Option<String>,
}

impl ShardReport {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_uploaded(&self) -> bool {
        self.error.is_none()
    }
}

/// Builds shard archives and uploads them with the unit retry loop.
pub struct ShardPacker {
    backend: Arc<dyn StorageBackend>,
    config: ShardConfig,
    policy: RetryPolicy,
    op_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ShardPacker {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: ShardConfig,
        policy: RetryPolicy,
        op_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            config,
            policy,
            op_timeout,
            cancel,
        }
    }

    /// File name of the shard covering `members` at offsets `start..end`.
    pub fn shard_file_name(&self, start: usize, end: usize, members: &[PathBuf]) -> String {
        let mut hasher = Sha256::new();
        for m in members {
            hasher.update(m.to_string_lossy().as_bytes());
            hasher.update(b"\n");
        }
        let digest = hex::encode(hasher.finalize());
        format!(
            "{}_shard_{start:06}_{end:06}_{}.tar",
            self.config.name,
            &digest[..8]
        )
    }

    /// Groups `paths` in order into shards, then builds and uploads each.
    ///
    /// Shards are independent: a failed shard is reported and the rest
    /// proceed. Packing stops early when the run is cancelled.
    pub async fn pack_and_upload(&self, paths: &[PathBuf]) -> Vec<ShardReport> {
        let size = self.config.shard_size.max(1);
        let mut reports = Vec::with_capacity(paths.len().div_ceil(size));

        for (i, members) in paths.chunks(size).enumerate() {
            if self.cancel.is_cancelled() {
                info!(remaining = paths.len() - i * size, "shard packing cancelled");
                break;
            }
            let start = i * size;
            let end = start + members.len();
            let file_name = self.shard_file_name(start, end, members);
            let report = ShardReport {
                key: format!("{}shards/{file_name}", self.config.key_prefix),
                path: self.config.shard_dir.join(&file_name),
                members: members.to_vec(),
                already_present: false,
                error: None,
            };
            reports.push(self.process(report).await);
        }

        let uploaded = reports.iter().filter(|r| r.is_uploaded()).count();
        info!(
            shards = reports.len(),
            uploaded,
            failed = reports.len() - uploaded,
            "shard upload done"
        );
        reports
    }

    async fn process(&self, mut report: ShardReport) -> ShardReport {
        match self.build_and_upload(&mut report).await {
            Ok(()) => {}
            Err(e) => {
                warn!(key = %report.key, error = %e, "shard failed");
                report.error = Some(e.to_string());
            }
        }
        report
    }

    async fn build_and_upload(&self, report: &mut ShardReport) -> Result<(), ShardError> {
        let path = report.path.clone();
        let members = report.members.clone();
        let strip = self.config.strip_prefix.clone();
        tokio::task::spawn_blocking(move || build_archive(&path, &members, strip.as_deref()))
            .await
            .map_err(|e| ShardError::Join(e.to_string()))??;

        if let Ok(true) = self.backend.exists(&report.key).await {
            debug!(key = %report.key, "shard already uploaded");
            report.already_present = true;
            return Ok(());
        }

        let outcome = run_with_retry(
            &self.policy,
            &self.cancel,
            self.op_timeout,
            &report.key,
            || self.backend.put(&report.path, &report.key),
        )
        .await;
        match outcome {
            RetryOutcome::Done { attempts, .. } => {
                info!(key = %report.key, members = report.member_count(), attempts, "shard uploaded");
                Ok(())
            }
            RetryOutcome::Failed { error, .. } | RetryOutcome::Interrupted { error, .. } => {
                Err(ShardError::Upload(error.to_string()))
            }
        }
    }
}

/// Path of `member` inside the archive.
fn archive_name(member: &Path, strip_prefix: Option<&Path>) -> PathBuf {
    if let Some(prefix) = strip_prefix
        && let Ok(rel) = member.strip_prefix(prefix)
        && !rel.as_os_str().is_empty()
    {
        return rel.to_path_buf();
    }
    member
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| member.to_path_buf())
}

/// Writes the archive via a `.part` file and rename. An archive already at
/// `path` is complete and reused as is.
fn build_archive(path: &Path, members: &[PathBuf], strip_prefix: Option<&Path>) -> io::Result<()> {
    if path.is_file() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tar.part");
    let result = (|| {
        let mut builder = tar::Builder::new(File::create(&tmp)?);
        for member in members {
            builder.append_path_with_name(member, archive_name(member, strip_prefix))?;
        }
        let file = builder.into_inner()?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use moldata_storage::{LocalBackend, ObjectMeta, StorageError, StorageFuture};

    fn write_files(dir: &Path, n: usize) -> Vec<PathBuf> {
        let staging = dir.join("staging/pdb");
        std::fs::create_dir_all(&staging).unwrap();
        (0..n)
            .map(|i| {
                let p = staging.join(format!("{i}.cif"));
                std::fs::write(&p, format!("data_{i}")).unwrap();
                p
            })
            .collect()
    }

    fn packer(backend: Arc<dyn StorageBackend>, config: ShardConfig) -> ShardPacker {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter: false,
        };
        ShardPacker::new(backend, config, policy, None, CancellationToken::new())
    }

    fn entries(archive: &Path) -> Vec<String> {
        let mut ar = tar::Archive::new(File::open(archive).unwrap());
        ar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn packs_and_uploads_in_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let files = write_files(tmp.path(), 5);
        let backend = Arc::new(LocalBackend::new(tmp.path().join("remote")));
        let config = ShardConfig {
            shard_size: 2,
            shard_dir: tmp.path().join("_shards"),
            key_prefix: "pdb/".into(),
            name: "pdb".into(),
            strip_prefix: Some(tmp.path().join("staging")),
        };
        let reports = packer(backend.clone(), config).pack_and_upload(&files).await;

        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(ShardReport::is_uploaded));
        assert_eq!(
            reports.iter().map(ShardReport::member_count).collect::<Vec<_>>(),
            [2, 2, 1]
        );
        assert!(reports[0].key.starts_with("pdb/shards/pdb_shard_000000_000002_"));
        assert!(reports[2].key.starts_with("pdb/shards/pdb_shard_000004_000005_"));

        assert_eq!(entries(&reports[0].path), ["pdb/0.cif", "pdb/1.cif"]);
        assert!(backend.exists(&reports[1].key).await.unwrap());
    }

    #[tokio::test]
    async fn rerun_skips_existing_shard() {
        let tmp = tempfile::tempdir().unwrap();
        let files = write_files(tmp.path(), 3);
        let backend = Arc::new(LocalBackend::new(tmp.path().join("remote")));
        let config = ShardConfig {
            shard_dir: tmp.path().join("_shards"),
            ..ShardConfig::default()
        };

        let first = packer(backend.clone(), config.clone()).pack_and_upload(&files).await;
        assert!(!first[0].already_present);
        let second = packer(backend, config).pack_and_upload(&files).await;
        assert_eq!(second[0].key, first[0].key);
        assert!(second[0].already_present);
        assert_eq!(entries(&second[0].path), ["0.cif", "1.cif", "2.cif"]);
    }

    #[test]
    fn name_depends_on_members() {
        let p = packer(
            Arc::new(LocalBackend::new("/nonexistent")),
            ShardConfig::default(),
        );
        let a = p.shard_file_name(0, 2, &[PathBuf::from("a"), PathBuf::from("b")]);
        let b = p.shard_file_name(0, 2, &[PathBuf::from("a"), PathBuf::from("c")]);
        assert_ne!(a, b);
        assert!(a.starts_with("data_shard_000000_000002_"));
        assert!(a.ends_with(".tar"));
    }

    #[test]
    fn missing_member_leaves_no_partial_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("x.tar");
        let err = build_archive(&archive, &[tmp.path().join("missing.cif")], None);
        assert!(err.is_err());
        assert!(!archive.exists());
        assert!(!archive.with_extension("tar.part").exists());
    }

    /// Rejects every upload.
    struct RejectingBackend {
        puts: Mutex<HashMap<String, usize>>,
    }

    impl StorageBackend for RejectingBackend {
        fn name(&self) -> &str {
            "rejecting"
        }

        fn stat<'a>(&'a self, _locator: &'a str) -> StorageFuture<'a, Option<ObjectMeta>> {
            Box::pin(async { Ok(None) })
        }

        fn put<'a>(&'a self, _source: &'a Path, key: &'a str) -> StorageFuture<'a, ()> {
            *self.puts.lock().unwrap().entry(key.to_string()).or_default() += 1;
            Box::pin(async move {
                Err(StorageError::Transient {
                    locator: key.to_string(),
                    detail: "503".into(),
                })
            })
        }

        fn get<'a>(&'a self, source: &'a str, _dest: &'a Path) -> StorageFuture<'a, ()> {
            Box::pin(async move { Err(StorageError::NotFound(source.to_string())) })
        }

        fn delete<'a>(&'a self, _locator: &'a str) -> StorageFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn failed_upload_is_reported_after_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let files = write_files(tmp.path(), 1);
        let backend = Arc::new(RejectingBackend {
            puts: Mutex::new(HashMap::new()),
        });
        let config = ShardConfig {
            shard_dir: tmp.path().join("_shards"),
            ..ShardConfig::default()
        };
        let reports = packer(backend.clone(), config).pack_and_upload(&files).await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].is_uploaded());
        assert!(reports[0].error.as_deref().unwrap().contains("retries exhausted"));
        assert_eq!(backend.puts.lock().unwrap()[&reports[0].key], 3);
    }
}
