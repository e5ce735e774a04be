//! Plain HTTP(S) fetches for absolute source URLs.
//!
//! Public mirrors (RCSB, UniProt) serve files over unauthenticated HTTPS. The
//! S3 backend hands any `http://` or `https://` locator to an [`HttpFetcher`]
//! instead of the bucket.

use std::path::Path;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::StorageError;
use crate::backend::ObjectMeta;
use crate::part::PartFile;

const DEFAULT_USER_AGENT: &str = concat!("moldata/", env!("CARGO_PKG_VERSION"));

/// Whether `locator` is an absolute URL rather than an object key.
pub fn is_url(locator: &str) -> bool {
    locator.starts_with("https://") || locator.starts_with("http://")
}

/// Read-only client for absolute URLs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, StorageError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StorageError::InvalidLocator(format!("HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// HEAD probe. `Ok(None)` on 404.
    pub async fn stat(&self, url: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let resp = self
            .http
            .head(parse(url)?)
            .send()
            .await
            .map_err(|e| request_error(e, url))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StorageError::from_status(status.as_u16(), url));
        }
        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Ok(Some(ObjectMeta { size }))
    }

    /// Streams `url` into `destination` through a `.part` sibling.
    pub async fn get(&self, url: &str, destination: &Path) -> Result<(), StorageError> {
        let mut resp = self
            .http
            .get(parse(url)?)
            .send()
            .await
            .map_err(|e| request_error(e, url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StorageError::from_status(status.as_u16(), url));
        }

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

        let mut bytes = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(|e| request_error(e, url))? {
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
        trace!(url = %url, dest = %destination.display(), bytes, "http get");
        Ok(())
    }
}

fn parse(url: &str) -> Result<Url, StorageError> {
    Url::parse(url).map_err(|e| StorageError::InvalidLocator(format!("{url}: {e}")))
}

fn request_error(err: reqwest::Error, url: &str) -> StorageError {
    if err.is_builder() {
        return StorageError::InvalidLocator(format!("{url}: {err}"));
    }
    StorageError::transient(url, err)
}
