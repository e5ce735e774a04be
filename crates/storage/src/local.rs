//! Local filesystem backend.

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::backend::{ObjectMeta, StorageBackend, StorageFuture};
use crate::part::PartFile;
use crate::{StorageError, normalize_key};

/// Stores objects as files under a root directory.
///
/// Writes go through a `.part` sibling and a rename so a reader never sees a
/// half-written object.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an object key to its path under the root.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(normalize_key(key)?))
    }
}

/// Copies `from` to `to` through a temporary sibling file.
async fn copy_atomic(from: &Path, to: &Path, locator: &str) -> Result<u64, StorageError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::from_io(e, locator))?;
    }
    let part = PartFile::for_destination(to);
    let bytes = tokio::fs::copy(from, part.path())
        .await
        .map_err(|e| StorageError::from_io(e, locator))?;
    part.commit(to)
        .await
        .map_err(|e| StorageError::from_io(e, locator))?;
    Ok(bytes)
}

impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn stat<'a>(&'a self, locator: &'a str) -> StorageFuture<'a, Option<ObjectMeta>> {
        Box::pin(async move {
            let path = self.resolve(locator)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                    size: Some(meta.len()),
                })),
                Ok(_) => Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StorageError::from_io(e, locator)),
            }
        })
    }

    fn put<'a>(&'a self, source: &'a Path, destination_key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let dst = self.resolve(destination_key)?;
            let source_str = source.display().to_string();
            tokio::fs::metadata(source)
                .await
                .map_err(|e| StorageError::from_io(e, &source_str))?;

            let bytes = copy_atomic(source, &dst, destination_key).await?;
            trace!(key = %destination_key, bytes, "local put");
            Ok(())
        })
    }

    fn get<'a>(&'a self, source: &'a str, destination: &'a Path) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let src = self.resolve(source)?;
            let bytes = copy_atomic(&src, destination, source).await?;
            trace!(key = %source, dest = %destination.display(), bytes, "local get");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, locator: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let path = self.resolve(locator)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::from_io(e, locator)),
            }
        })
    }
}
