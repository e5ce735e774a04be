//! Storage backends for bulk file transfers.
//!
//! A [`StorageBackend`] performs exactly one attempt of an existence check,
//! upload, download or delete and reports success or a typed
//! [`StorageError`]. Retry, timeouts and checkpointing live in the transfer
//! engine, never here.
//!
//! Two targets are provided:
//!
//! - [`LocalBackend`]: keys resolve under a root directory.
//! - [`S3Backend`]: a bucket on AWS S3 or MinIO; absolute `https://`
//!   locators are fetched as-is through an [`HttpFetcher`].

mod backend;
mod error;
mod http;
mod local;
mod part;
mod s3;
mod validation;

pub use backend::{ObjectMeta, StorageBackend, StorageFuture};
pub use error::StorageError;
pub use http::{HttpFetcher, is_url};
pub use local::LocalBackend;
pub use s3::{S3Backend, S3Config};
pub use validation::normalize_key;
