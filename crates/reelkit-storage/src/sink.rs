//! The blob-sink interface consumed by the upload stage.

use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageResult;

/// A destination for final artifacts.
///
/// `put` is idempotent by key: uploading the same key twice overwrites the
/// object and returns the same URL.
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Upload a local file under `key` and return its public URL.
    async fn put(&self, local_path: &Path, key: &str) -> StorageResult<String>;
}
