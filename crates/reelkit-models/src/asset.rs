//! Asset references shared by images, videos and audio tracks.

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A reference to a media asset, remote or local.
///
/// The job document carries a `url`; the downloader materializes the asset
/// and fills `local_path`, which becomes the source of truth for every later
/// stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssetRef {
    /// http(s) URL or a local filesystem path
    pub url: String,

    /// Resolved local file, populated by the downloader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl AssetRef {
    /// Create a reference from a URL string.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            local_path: None,
        }
    }

    /// Whether the URL points at a remote server.
    pub fn is_remote(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }

    /// The resolved local file, if the downloader has run.
    pub fn resolved(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    /// File extension hinted by the URL, without the dot.
    pub fn url_extension(&self) -> Option<&str> {
        let tail = self.url.rsplit('/').next()?;
        // Drop query string before looking at the extension
        let tail = tail.split('?').next()?;
        match tail.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 => Some(ext),
            _ => None,
        }
    }
}
