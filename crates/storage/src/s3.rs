//! S3-compatible object store backend (AWS S3, MinIO).
//!
//! Requests are SigV4-signed by `aws-sdk-s3`. Explicit access and secret
//! keys take precedence; without them the standard AWS credential chain
//! (environment, profile, instance role) applies. SDK-level retries are
//! disabled: every call is a single attempt and the transfer engine owns
//! the retry policy.
//!
//! Absolute `http(s)://` locators are fetched with an [`HttpFetcher`]
//! instead, which lets download units point at public mirrors.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::backend::{ObjectMeta, StorageBackend, StorageFuture};
use crate::http::{HttpFetcher, is_url};
use crate::part::PartFile;
use crate::{StorageError, normalize_key};

/// Connection settings for [`S3Backend`].
#[derive(Clone, Deserialize)]
pub struct S3Config {
    /// Custom endpoint, e.g. `http://localhost:9000` for MinIO. `None` uses AWS.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    /// `{endpoint}/{bucket}/{key}` addressing; MinIO needs this.
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_bucket() -> String {
    "molfun-data".into()
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_force_path_style() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: default_bucket(),
            region: default_region(),
            access_key: None,
            secret_key: None,
            force_path_style: default_force_path_style(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl S3Config {
    /// Explicit key pair, when both halves are set and non-empty.
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        let access = self.access_key.as_deref().filter(|k| !k.is_empty())?;
        let secret = self.secret_key.as_deref().filter(|k| !k.is_empty())?;
        Some((access, secret))
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("force_path_style", &self.force_path_style)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Bucket on an S3-compatible store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    fetcher: HttpFetcher,
}

impl S3Backend {
    /// Builds a signed client for `config`. No request is sent.
    pub async fn connect(config: &S3Config) -> Result<Self, StorageError> {
        if config.bucket.is_empty() || config.bucket.contains('/') {
            return Err(StorageError::InvalidLocator(format!(
                "bucket name: {:?}",
                config.bucket
            )));
        }
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(connect_timeout)
                    .build(),
            );
        if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            loader = loader.endpoint_url(endpoint.trim_end_matches('/'));
        }
        match config.static_credentials() {
            Some((access, secret)) => {
                loader = loader.credentials_provider(Credentials::new(
                    access, secret, None, None, "moldata-config",
                ));
            }
            None => debug!("no static S3 keys configured, using the default credential chain"),
        }
        let shared = loader.load().await;

        let s3 = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3),
            bucket: config.bucket.clone(),
            fetcher: HttpFetcher::new(connect_timeout)?,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn download(&self, key: &str, destination: &Path) -> Result<u64, StorageError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(e, key))?;

        let dest_str = destination.display().to_string();
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, &dest_str))?;
        }
        let part = PartFile::for_destination(destination);
        let mut file = tokio::fs::File::create(part.path())
            .await
            .map_err(|e| StorageError::from_io(e, &dest_str))?;

        let mut body = out.body;
        let mut bytes = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::transient(key, e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| StorageError::from_io(e, &dest_str))?;
            bytes += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| StorageError::from_io(e, &dest_str))?;
        drop(file);

        part.commit(destination)
            .await
            .map_err(|e| StorageError::from_io(e, &dest_str))?;
        Ok(bytes)
    }
}

/// Maps an SDK failure to the error taxonomy by HTTP status.
fn sdk_error<E>(err: SdkError<E, HttpResponse>, locator: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    match (&err, status) {
        (SdkError::ConstructionFailure(_), _) => {
            StorageError::InvalidLocator(format!("{locator}: {}", DisplayErrorContext(&err)))
        }
        (SdkError::DispatchFailure(_) | SdkError::TimeoutError(_), _) | (_, None) => {
            StorageError::transient(locator, DisplayErrorContext(&err))
        }
        (_, Some(status)) => StorageError::from_status(status, locator),
    }
}

fn object_key(locator: &str) -> Result<String, StorageError> {
    if is_url(locator) {
        return Err(StorageError::InvalidLocator(format!(
            "{locator}: URLs are read-only sources"
        )));
    }
    normalize_key(locator)
}

impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        "s3"
    }

    fn stat<'a>(&'a self, locator: &'a str) -> StorageFuture<'a, Option<ObjectMeta>> {
        Box::pin(async move {
            if is_url(locator) {
                return self.fetcher.stat(locator).await;
            }
            let key = normalize_key(locator)?;
            let head = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await;
            match head {
                Ok(out) => Ok(Some(ObjectMeta {
                    size: out.content_length().and_then(|n| u64::try_from(n).ok()),
                })),
                Err(e) => match sdk_error(e, &key) {
                    StorageError::NotFound(_) => Ok(None),
                    e => Err(e),
                },
            }
        })
    }

    fn put<'a>(&'a self, source: &'a Path, destination_key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let key = object_key(destination_key)?;
            let source_str = source.display().to_string();
            let len = tokio::fs::metadata(source)
                .await
                .map_err(|e| StorageError::from_io(e, &source_str))?
                .len();
            let body = ByteStream::from_path(source)
                .await
                .map_err(|e| StorageError::transient(&source_str, e))?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| sdk_error(e, &key))?;
            trace!(bucket = %self.bucket, key = %key, bytes = len, "s3 put");
            Ok(())
        })
    }

    fn get<'a>(&'a self, source: &'a str, destination: &'a Path) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            if is_url(source) {
                return self.fetcher.get(source, destination).await;
            }
            let key = normalize_key(source)?;
            let bytes = self.download(&key, destination).await?;
            trace!(bucket = %self.bucket, key = %key, dest = %destination.display(), bytes, "s3 get");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, locator: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let key = object_key(locator)?;
            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => match sdk_error(e, &key) {
                    StorageError::NotFound(_) => Ok(()),
                    e => Err(e),
                },
            }
        })
    }
}
