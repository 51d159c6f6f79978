//! Upload stage.
//!
//! Pushes the final clip to the blob sink under a job-derived key, with
//! retry on transient sink errors. On permanent failure, and in local mode
//! (storage disabled), the artifact is moved out of the scope so it survives
//! scope release; the retained path travels back to the caller.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reelkit_storage::BlobSink;
use tracing::{info, warn};

use crate::context::{keys, PipelineContext};
use crate::engine::ContextStage;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::fsops::move_file;
use crate::retry::{retry_async, RetryConfig};

/// Metadata key carrying the retained artifact path to the caller.
pub const RETAINED_PATH_KEY: &str = "retained_path";

/// Upload the final clip and publish `upload_url`.
pub struct UploadStage {
    sink: Option<Arc<dyn BlobSink>>,
}

impl UploadStage {
    pub fn new(sink: Option<Arc<dyn BlobSink>>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ContextStage for UploadStage {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let final_path: PathBuf = ctx.get_cloned(keys::FINAL_CLIP_PATH)?;
        let job_id = ctx.job_id().clone();

        let sink = match (&self.sink, ctx.settings().storage.enabled) {
            (Some(sink), true) => Arc::clone(sink),
            _ => {
                // Local mode: keep the artifact under the work dir
                let retained = ctx
                    .settings()
                    .work_dir
                    .join("output")
                    .join(format!("{job_id}.mp4"));
                move_file(&final_path, &retained).await?;
                ctx.metadata
                    .insert(RETAINED_PATH_KEY.to_string(), retained.display().to_string());
                info!(path = %retained.display(), "storage disabled, retained locally");
                return ctx.set(keys::UPLOAD_URL, format!("file://{}", retained.display()));
            }
        };

        let key = format!(
            "{}{}/{}.mp4",
            ctx.settings().storage.key_prefix,
            job_id,
            Utc::now().format("%Y%m%d%H%M%S")
        );

        let retry = RetryConfig::new("upload")
            .with_max_retries(ctx.settings().storage.upload_max_retries);
        let timeout = ctx.settings().storage.upload_timeout;

        let upload = retry_async(&retry, || async {
            match tokio::time::timeout(timeout, sink.put(&final_path, &key)).await {
                Ok(result) => result.map_err(|e| {
                    PipelineError::with_source("upload", ErrorKind::Upload, "sink rejected upload", e)
                }),
                Err(_) => Err(PipelineError::timeout(
                    "upload",
                    format!("upload exceeded {timeout:?}"),
                )),
            }
        })
        .await;

        match upload {
            Ok(url) => {
                info!(key = %key, url = %url, "final clip uploaded");
                ctx.set(keys::UPLOAD_URL, url)
            }
            Err(e) => {
                // Keep the artifact reachable after scope release
                let retained = ctx
                    .settings()
                    .work_dir
                    .join("failed")
                    .join(format!("{job_id}.mp4"));
                match move_file(&final_path, &retained).await {
                    Ok(()) => {
                        warn!(path = %retained.display(), "upload failed, artifact retained");
                        ctx.metadata.insert(
                            RETAINED_PATH_KEY.to_string(),
                            retained.display().to_string(),
                        );
                    }
                    Err(move_err) => {
                        warn!(error = %move_err, "could not retain artifact after failed upload");
                    }
                }
                Err(e)
            }
        }
    }
}
