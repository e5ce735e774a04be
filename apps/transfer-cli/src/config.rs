//! CLI configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables, then by command-line flags:
//!
//! ```toml
//! label = "pdb"
//! checkpoint_dir = "/moldata/checkpoints"
//!
//! [storage]
//! backend = "s3"
//! endpoint = "http://localhost:9000"
//! bucket = "molfun-data"
//! access_key = "minioadmin"
//! secret_key = "minioadmin123"
//!
//! [engine]
//! max_workers = 16
//! batch_size = 500
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, bail};
use moldata_storage::{LocalBackend, S3Backend, S3Config, StorageBackend};
use moldata_transfer::{CheckpointStore, Direction, EngineConfig};
use serde::Deserialize;

/// Where objects live.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Local {
        #[serde(default = "default_local_root")]
        root: PathBuf,
    },
    #[serde(alias = "minio")]
    S3(S3Config),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            root: default_local_root(),
        }
    }
}

impl StorageConfig {
    pub async fn build(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        Ok(match self {
            StorageConfig::Local { root } => Arc::new(LocalBackend::new(root.clone())),
            StorageConfig::S3(config) => Arc::new(
                S3Backend::connect(config)
                    .await
                    .context("invalid S3 storage settings")?,
            ),
        })
    }
}

fn default_local_root() -> PathBuf {
    PathBuf::from("/data/moldata")
}

/// Full CLI configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Derives the checkpoint file from this label under `checkpoint_dir`
    /// instead of using `engine.checkpoint_location`.
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Config {
    /// Reads `path` if given (defaults otherwise) and applies the process
    /// environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str::<Config>(&content)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        tracing::debug!(path = ?path, "configuration loaded");
        Ok(config)
    }

    /// Applies `MOLDATA_*` and `MINIO_*` overrides read through `var`.
    ///
    /// Without `MOLDATA_STORAGE_BACKEND`, setting `MINIO_ENDPOINT` or
    /// `MINIO_ACCESS_KEY` selects the S3 backend.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let use_s3 = match var("MOLDATA_STORAGE_BACKEND").as_deref() {
            None => var("MINIO_ENDPOINT").is_some() || var("MINIO_ACCESS_KEY").is_some(),
            Some("local") => {
                if !matches!(self.storage, StorageConfig::Local { .. }) {
                    self.storage = StorageConfig::default();
                }
                false
            }
            Some("s3" | "minio") => true,
            Some(other) => bail!("unknown MOLDATA_STORAGE_BACKEND {other:?} (expected local, s3 or minio)"),
        };
        if use_s3 && !matches!(self.storage, StorageConfig::S3(_)) {
            self.storage = StorageConfig::S3(S3Config {
                endpoint: Some(minio_endpoint("localhost", Some("9000"), false)),
                ..S3Config::default()
            });
        }

        match &mut self.storage {
            StorageConfig::Local { root } => {
                if let Some(value) = var("MOLDATA_LOCAL_ROOT") {
                    *root = PathBuf::from(value);
                }
            }
            StorageConfig::S3(s3) => {
                if let Some(host) = var("MINIO_ENDPOINT") {
                    let secure = var("MINIO_SECURE")
                        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"));
                    s3.endpoint = Some(minio_endpoint(&host, var("MINIO_PORT").as_deref(), secure));
                }
                if let Some(bucket) = var("MINIO_BUCKET") {
                    s3.bucket = bucket;
                }
                if let Some(region) = var("MINIO_REGION") {
                    s3.region = region;
                }
                if let Some(key) = var("MINIO_ACCESS_KEY") {
                    s3.access_key = Some(key);
                }
                if let Some(key) = var("MINIO_SECRET_KEY") {
                    s3.secret_key = Some(key);
                }
            }
        }

        if let Some(n) = parse_var(&var, "MOLDATA_UPLOAD_MAX_WORKERS")? {
            self.engine.max_workers = n;
        }
        if let Some(n) = parse_var(&var, "MOLDATA_UPLOAD_BATCH_SIZE")? {
            self.engine.batch_size = n;
        }
        if let Some(n) = parse_var(&var, "MOLDATA_MAX_RETRIES")? {
            self.engine.max_retries = n;
        }
        if let Some(dir) = var("MOLDATA_CHECKPOINT_DIR") {
            self.checkpoint_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Label-derived checkpoint store, when a label is configured.
    pub fn checkpoint_store(&self) -> Option<CheckpointStore> {
        let label = self.label.as_deref()?;
        let dir = self
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("checkpoints"));
        let kind = match self.engine.direction {
            Direction::Upload => "upload",
            Direction::Download => "download",
        };
        Some(CheckpointStore::for_label(&dir, kind, label))
    }
}

/// Builds a URL from a MinIO-style host, which may lack scheme and port.
fn minio_endpoint(host: &str, port: Option<&str>, secure: bool) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        return host.trim_end_matches('/').to_string();
    }
    let scheme = if secure { "https" } else { "http" };
    match port {
        Some(port) if !host.contains(':') => format!("{scheme}://{host}:{port}"),
        _ => format!("{scheme}://{host}"),
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|v| v.trim().parse::<T>().with_context(|| format!("invalid {key}={v:?}")))
        .transpose()
}
