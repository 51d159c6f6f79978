//! Blob storage for final artifacts.
//!
//! The pipeline talks to storage only through the [`BlobSink`] trait:
//! `put(local_path, key) -> url`, idempotent by key. The default
//! implementation is an S3-compatible client.

pub mod client;
pub mod error;
pub mod sink;

pub use client::{S3Client, S3Config};
pub use error::{StorageError, StorageResult};
pub use sink::BlobSink;
