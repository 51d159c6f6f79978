//! Asset download stage.
//!
//! Walks every asset reference in the validated job, deduplicates by URL,
//! fetches with bounded concurrency and per-file retry, and assigns
//! `local_path` on each reference. Local (non-URL) paths pass through after
//! a readability check.
//!
//! Requiredness: a segment's chosen visual and its voice-over are required;
//! an image shadowed by a video is optional; background music degrades to a
//! warning; a broken chosen image is downgraded to a warning when the image
//! auto-fixer is enabled, since the fixer will substitute it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use reelkit_models::Job;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::context::{keys, PipelineContext};
use crate::engine::ContextStage;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::metrics::warnings;
use crate::retry::{retry_async, RetryConfig};
use crate::settings::Settings;

/// Download all job assets into the scope and publish `downloaded_job`.
pub struct DownloadStage;

#[async_trait]
impl ContextStage for DownloadStage {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let mut job: Job = ctx.get_cloned(keys::VALIDATED_JOB)?;

        let downloader = Downloader::new(ctx.settings());
        let fetched = downloader
            .fetch_all(&collect_remote_urls(&job), ctx.scope().temp_dir(), ctx)
            .await?;

        assign_local_paths(&mut job, &fetched, ctx)?;

        ctx.metadata
            .insert("downloaded_files".to_string(), fetched.len().to_string());
        ctx.set(keys::DOWNLOADED_JOB, job)
    }
}

/// How a missing asset is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetRole {
    Required,
    /// Broken image fixable by the image-auto stage
    Fixable,
    Optional,
}

/// Unique remote URLs across the whole job.
fn collect_remote_urls(job: &Job) -> Vec<String> {
    let mut urls = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut push = |url: &str| {
        if (url.starts_with("http://") || url.starts_with("https://"))
            && seen.insert(url.to_string())
        {
            urls.push(url.to_string());
        }
    };

    for segment in &job.segments {
        if let Some(image) = &segment.image {
            push(&image.url);
        }
        if let Some(video) = &segment.video {
            push(&video.url);
        }
        if let Some(vo) = &segment.voice_over {
            push(&vo.audio.url);
        }
    }
    if let Some(bgm) = &job.background_music {
        push(&bgm.audio.url);
    }
    urls
}

/// Assign resolved paths onto every reference, enforcing requiredness.
fn assign_local_paths(
    job: &mut Job,
    fetched: &HashMap<String, PathBuf>,
    ctx: &PipelineContext,
) -> PipelineResult<()> {
    let image_fix_enabled = ctx.settings().ai.image_fix_enabled;

    // BGM first so the segment loop below can use early returns freely
    if let Some(bgm) = &mut job.background_music {
        match resolve(&bgm.audio.url, fetched) {
            Some(path) => bgm.audio.local_path = Some(path),
            None => {
                warn!(url = %bgm.audio.url, "background music unavailable, dropping track");
                ctx.metrics().warning(warnings::OPTIONAL_ASSET_MISSING);
                job.background_music = None;
            }
        }
    }

    for segment in &mut job.segments {
        let has_video = segment.video.is_some();

        if let Some(video) = &mut segment.video {
            match resolve(&video.url, fetched) {
                Some(path) => video.local_path = Some(path),
                None => {
                    return Err(PipelineError::new(
                        "download",
                        ErrorKind::Asset,
                        format!("required video asset unavailable: {}", video.url),
                    )
                    .for_segment(segment.id.clone()));
                }
            }
        }

        if let Some(image) = &mut segment.image {
            let role = if has_video {
                AssetRole::Optional
            } else if image_fix_enabled {
                AssetRole::Fixable
            } else {
                AssetRole::Required
            };
            match resolve(&image.url, fetched) {
                Some(path) => image.local_path = Some(path),
                None => match role {
                    AssetRole::Required => {
                        return Err(PipelineError::new(
                            "download",
                            ErrorKind::Asset,
                            format!("required image asset unavailable: {}", image.url),
                        )
                        .for_segment(segment.id.clone()));
                    }
                    AssetRole::Fixable => {
                        warn!(
                            segment = %segment.id,
                            url = %image.url,
                            "image unavailable; deferring to image auto-fixer"
                        );
                    }
                    AssetRole::Optional => {
                        ctx.metrics().warning(warnings::OPTIONAL_ASSET_MISSING);
                    }
                },
            }
        }

        if let Some(vo) = &mut segment.voice_over {
            match resolve(&vo.audio.url, fetched) {
                Some(path) => vo.audio.local_path = Some(path),
                None => {
                    return Err(PipelineError::new(
                        "download",
                        ErrorKind::Asset,
                        format!("required voice-over unavailable: {}", vo.audio.url),
                    )
                    .for_segment(segment.id.clone()));
                }
            }
        }
    }

    Ok(())
}

/// Resolve one URL: fetched file for remote refs, readability-checked path
/// for local refs.
fn resolve(url: &str, fetched: &HashMap<String, PathBuf>) -> Option<PathBuf> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return fetched.get(url).cloned();
    }
    let path = PathBuf::from(url);
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => Some(path),
        _ => None,
    }
}

/// Fetch one URL into `dest_dir` outside the batch path. Used by the image
/// auto-fixer for substitute images.
pub(crate) async fn fetch_single(
    url: &str,
    dest_dir: &Path,
    settings: &Settings,
) -> PipelineResult<PathBuf> {
    let downloader = Downloader::new(settings);
    let dest = dest_dir.join(file_name_for(url));
    retry_async(&downloader.retry, || downloader.fetch_one(url, &dest)).await
}

/// Concurrent, deduplicating HTTP fetcher.
struct Downloader {
    client: reqwest::Client,
    max_concurrent: usize,
    max_size_bytes: u64,
    retry: RetryConfig,
}

impl Downloader {
    fn new(settings: &Settings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.download.timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_concurrent: settings.download.max_concurrent,
            max_size_bytes: settings.download.max_size_mb * 1024 * 1024,
            retry: RetryConfig {
                max_retries: settings.download.max_retries,
                base_delay: settings.download.base_delay,
                ..RetryConfig::new("download")
            },
        }
    }

    /// Fetch every URL once; failures are reported per URL, not raised, so
    /// requiredness can be judged by the caller.
    async fn fetch_all(
        &self,
        urls: &[String],
        dest_dir: &Path,
        ctx: &PipelineContext,
    ) -> PipelineResult<HashMap<String, PathBuf>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent.max(1)));
        let cancel = ctx.cancel().clone();

        let tasks = urls.iter().map(|url| {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let url = url.clone();
            let dest = dest_dir.join(file_name_for(&url));
            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            url,
                            Err(PipelineError::new(
                                "download",
                                ErrorKind::Pipeline,
                                "semaphore closed",
                            )),
                        )
                    }
                };
                if cancel.is_cancelled() {
                    return (url, Err(PipelineError::cancelled("download")));
                }
                let result = retry_async(&self.retry, || self.fetch_one(&url, &dest)).await;
                (url, result)
            }
        });

        let mut fetched = HashMap::new();
        for (url, result) in join_all(tasks).await {
            if ctx.cancel().is_cancelled() {
                return Err(PipelineError::cancelled("download"));
            }
            match result {
                Ok(path) => {
                    fetched.insert(url, path);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(url = %url, error = %e, "asset download failed");
                }
            }
        }

        info!("downloaded {}/{} unique assets", fetched.len(), urls.len());
        Ok(fetched)
    }

    async fn fetch_one(&self, url: &str, dest: &Path) -> PipelineResult<PathBuf> {
        debug!(url, "fetching asset");
        let response = self.client.get(url).send().await.map_err(|e| {
            PipelineError::with_source("download", ErrorKind::Download, "request failed", e)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::new(
                "download",
                ErrorKind::Download,
                format!("GET {url} returned {status}"),
            ));
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_size_bytes {
                return Err(PipelineError::new(
                    "download",
                    ErrorKind::Download,
                    format!("asset declares {declared} bytes, over the size cap"),
                ));
            }
        }

        check_media_type(url, response.headers());

        let dest = with_extension(dest, url, response.headers());
        let mut file = tokio::fs::File::create(&dest).await.map_err(|e| {
            PipelineError::with_source("download", ErrorKind::Resource, "create failed", e)
        })?;

        let mut written: u64 = 0;
        let mut stream = response;
        while let Some(chunk) = stream.chunk().await.map_err(|e| {
            PipelineError::with_source("download", ErrorKind::Download, "read failed", e)
        })? {
            written += chunk.len() as u64;
            if written > self.max_size_bytes {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(PipelineError::new(
                    "download",
                    ErrorKind::Download,
                    format!("asset exceeded the {}-byte size cap", self.max_size_bytes),
                ));
            }
            file.write_all(&chunk).await.map_err(|e| {
                PipelineError::with_source("download", ErrorKind::Resource, "write failed", e)
            })?;
        }
        file.flush().await.map_err(|e| {
            PipelineError::with_source("download", ErrorKind::Resource, "flush failed", e)
        })?;

        debug!(url, bytes = written, path = %dest.display(), "asset stored");
        Ok(dest)
    }
}

/// Media types we expect for job assets.
fn check_media_type(url: &str, headers: &reqwest::header::HeaderMap) {
    if let Some(content_type) = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        let acceptable = content_type.starts_with("image/")
            || content_type.starts_with("video/")
            || content_type.starts_with("audio/")
            || content_type.starts_with("application/octet-stream");
        if !acceptable {
            warn!(url, content_type, "unexpected content type for media asset");
        }
    }
}

/// Stable per-URL file name: first 16 hex chars of sha256(url).
fn file_name_for(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Attach an extension from the URL or, failing that, the content type.
fn with_extension(base: &Path, url: &str, headers: &reqwest::header::HeaderMap) -> PathBuf {
    let from_url = url
        .rsplit('/')
        .next()
        .and_then(|tail| tail.split('?').next())
        .and_then(|tail| tail.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5);

    let from_content_type = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| match ct.split(';').next().unwrap_or("").trim() {
            "image/jpeg" => Some("jpg"),
            "image/png" => Some("png"),
            "image/webp" => Some("webp"),
            "video/mp4" => Some("mp4"),
            "audio/mpeg" => Some("mp3"),
            "audio/wav" | "audio/x-wav" => Some("wav"),
            "audio/aac" => Some("aac"),
            _ => None,
        })
        .map(str::to_string);

    match from_url.or(from_content_type) {
        Some(ext) => base.with_extension(ext),
        None => base.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_url() {
        let job: Job = serde_json::from_str(
            r#"{"segments":[
                {"id":"a","image":{"url":"http://ex/same.jpg"}},
                {"id":"b","image":{"url":"http://ex/same.jpg"}},
                {"id":"c","image":{"url":"http://ex/other.jpg"}}
            ]}"#,
        )
        .unwrap();
        let urls = collect_remote_urls(&job);
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn test_local_paths_not_collected() {
        let job: Job = serde_json::from_str(
            r#"{"segments":[{"id":"a","image":{"url":"/data/local.jpg"}}]}"#,
        )
        .unwrap();
        assert!(collect_remote_urls(&job).is_empty());
    }

    #[test]
    fn test_file_name_is_stable_and_distinct() {
        let a1 = file_name_for("http://ex/a.jpg");
        let a2 = file_name_for("http://ex/a.jpg");
        let b = file_name_for("http://ex/b.jpg");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 16);
    }

    #[test]
    fn test_extension_from_url() {
        let headers = reqwest::header::HeaderMap::new();
        let path = with_extension(Path::new("/tmp/abcd"), "http://ex/a.mp3?sig=x", &headers);
        assert_eq!(path, PathBuf::from("/tmp/abcd.mp3"));
    }

    #[test]
    fn test_extension_from_content_type() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "image/png; charset=binary".parse().unwrap(),
        );
        let path = with_extension(Path::new("/tmp/abcd"), "http://ex/noext", &headers);
        assert_eq!(path, PathBuf::from("/tmp/abcd.png"));
    }

    #[test]
    fn test_resolve_local_requires_existing_file() {
        let fetched = HashMap::new();
        assert!(resolve("/definitely/not/there.jpg", &fetched).is_none());

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.jpg");
        std::fs::write(&file, b"img").unwrap();
        assert_eq!(
            resolve(file.to_str().unwrap(), &fetched),
            Some(file.clone())
        );
    }
}
