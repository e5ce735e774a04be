//! The storage capability trait.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::StorageError;

/// Boxed future returned by [`StorageBackend`] operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Metadata returned by a metadata-only probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object size in bytes, when the target reports one.
    pub size: Option<u64>,
}

/// Uniform exists/put/get/delete capability over a storage target.
///
/// Implementations perform exactly one attempt per call. New targets are
/// added by implementing this trait; the transfer engine only sees
/// `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs (`"local"`, `"s3"`).
    fn name(&self) -> &str;

    /// Metadata-only probe. Returns `Ok(None)` when the object is absent.
    fn stat<'a>(&'a self, locator: &'a str) -> StorageFuture<'a, Option<ObjectMeta>>;

    /// Whether `locator` exists. Side-effect free, never transfers data.
    fn exists<'a>(&'a self, locator: &'a str) -> StorageFuture<'a, bool> {
        Box::pin(async move { Ok(self.stat(locator).await?.is_some()) })
    }

    /// Writes the local file `source` to the object `destination_key`.
    fn put<'a>(&'a self, source: &'a Path, destination_key: &'a str) -> StorageFuture<'a, ()>;

    /// Reads the object `source` into the local file `destination`.
    fn get<'a>(&'a self, source: &'a str, destination: &'a Path) -> StorageFuture<'a, ()>;

    /// Removes `locator`. Removing an absent object is not an error.
    fn delete<'a>(&'a self, locator: &'a str) -> StorageFuture<'a, ()>;
}
