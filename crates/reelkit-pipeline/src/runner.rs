//! The process surface: one callable entry point per job.
//!
//! `run_job(job_doc, cancel)` drives a validated job document through the
//! full stage list and returns the artifact URL plus the metrics summary, or
//! a single typed [`JobFailure`].

use std::sync::Arc;

use reelkit_models::Job;
use reelkit_storage::{BlobSink, S3Client, S3Config};
use tracing::{error, info};

use crate::cancel::CancelSignal;
use crate::context::{keys, PipelineContext};
use crate::engine::{Pipeline, StageSpec};
use crate::error::{ErrorKind, JobFailure, PipelineError, PipelineResult};
use crate::metrics::{MetricsCollector, MetricsSummary};
use crate::scope::ResourceScope;
use crate::settings::Settings;
use crate::stages::upload::RETAINED_PATH_KEY;
use crate::stages::{
    AlignTextStage, ConcatenateStage, DownloadStage, ImageAutoStage, RenderSegmentsStage,
    UploadStage, ValidateStage,
};

/// Result of a completed job.
#[derive(Debug)]
pub struct RunOutput {
    /// URL of the uploaded artifact (a `file://` URL in local mode)
    pub url: String,
    pub metrics: MetricsSummary,
}

/// Job runner owning the settings and the blob sink.
pub struct JobRunner {
    settings: Arc<Settings>,
    sink: Option<Arc<dyn BlobSink>>,
}

impl JobRunner {
    /// Build a runner; the S3 sink is constructed when storage is enabled.
    pub fn new(settings: Settings) -> PipelineResult<Self> {
        let sink: Option<Arc<dyn BlobSink>> = if settings.storage.enabled {
            let client = S3Client::new(S3Config {
                endpoint_url: settings.storage.endpoint_url.clone(),
                access_key_id: settings.storage.access_key_id.clone(),
                secret_access_key: settings.storage.secret_access_key.clone(),
                bucket: settings.storage.bucket.clone(),
                region: settings.storage.region.clone(),
                public_base_url: settings.storage.public_base_url.clone(),
            })
            .map_err(|e| {
                PipelineError::with_source(
                    "upload",
                    ErrorKind::Resource,
                    "storage client configuration failed",
                    e,
                )
            })?;
            Some(Arc::new(client))
        } else {
            None
        };

        Ok(Self {
            settings: Arc::new(settings),
            sink,
        })
    }

    /// Build a runner around an explicit sink (tests, alternative backends).
    pub fn with_sink(settings: Settings, sink: Arc<dyn BlobSink>) -> Self {
        Self {
            settings: Arc::new(settings),
            sink: Some(sink),
        }
    }

    /// Run one job to completion.
    pub async fn run_job(
        &self,
        job_doc: serde_json::Value,
        cancel: CancelSignal,
    ) -> Result<RunOutput, JobFailure> {
        let job: Job = serde_json::from_value(job_doc).map_err(|e| {
            JobFailure::from_error(&PipelineError::with_source(
                "validate",
                ErrorKind::Validation,
                "job document does not match the schema",
                e,
            ))
        })?;

        let job_id = job.id.clone();
        info!(job_id = %job_id, segments = job.segments.len(), "starting job");

        let scope = ResourceScope::create(
            &self.settings.work_dir,
            job_id.as_str(),
            self.settings.cleanup_retry_attempts,
            self.settings.cleanup_retry_delay,
        )
        .map_err(|e| JobFailure::from_error(&e))?;

        let metrics = MetricsCollector::new();
        let mut ctx = PipelineContext::new(
            job_id.clone(),
            Arc::new(scope),
            Arc::clone(&self.settings),
            metrics.clone(),
            cancel,
        );
        ctx.set(keys::JOB, job)
            .map_err(|e| JobFailure::from_error(&e))?;

        let pipeline = self.build_pipeline();
        match pipeline.execute(&mut ctx).await {
            Ok(()) => {
                let url = ctx
                    .get_cloned::<String>(keys::UPLOAD_URL)
                    .map_err(|e| JobFailure::from_error(&e))?;
                info!(job_id = %job_id, url = %url, "job completed");
                Ok(RunOutput {
                    url,
                    metrics: metrics.summary(),
                })
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "job failed");
                let mut failure = JobFailure::from_error(&e);
                if let Some(retained) = ctx.metadata.get(RETAINED_PATH_KEY) {
                    failure = failure.with_retained_path(retained.into());
                }
                Err(failure)
            }
        }
    }

    /// The full stage list. Optional stages pass their input through
    /// unchanged when their settings flag is off, keeping the key chain
    /// total.
    fn build_pipeline(&self) -> Pipeline {
        Pipeline::new(vec![
            StageSpec::new("validate", Box::new(ValidateStage))
                .requires(&[keys::JOB])
                .produces(&[keys::VALIDATED_JOB]),
            StageSpec::new("download", Box::new(DownloadStage))
                .requires(&[keys::VALIDATED_JOB])
                .produces(&[keys::DOWNLOADED_JOB]),
            StageSpec::new("image_auto", Box::new(ImageAutoStage))
                .requires(&[keys::DOWNLOADED_JOB])
                .produces(&[keys::FIXED_JOB]),
            StageSpec::new("align_text", Box::new(AlignTextStage))
                .requires(&[keys::FIXED_JOB])
                .produces(&[keys::ALIGNED_JOB]),
            StageSpec::new("render_segments", Box::new(RenderSegmentsStage))
                .requires(&[keys::ALIGNED_JOB])
                .produces(&[keys::SEGMENT_CLIPS]),
            StageSpec::new("concatenate", Box::new(ConcatenateStage))
                .requires(&[keys::SEGMENT_CLIPS, keys::ALIGNED_JOB])
                .produces(&[keys::FINAL_CLIP_PATH]),
            StageSpec::new("upload", Box::new(UploadStage::new(self.sink.clone())))
                .requires(&[keys::FINAL_CLIP_PATH])
                .produces(&[keys::UPLOAD_URL]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.work_dir = dir.to_path_buf();
        settings.ai.image_fix_enabled = false;
        settings.ai.align_enabled = false;
        settings
    }

    #[test]
    fn test_stage_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(settings_in(dir.path())).unwrap();
        assert_eq!(
            runner.build_pipeline().stage_names(),
            vec![
                "validate",
                "download",
                "image_auto",
                "align_text",
                "render_segments",
                "concatenate",
                "upload"
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_document_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(settings_in(dir.path())).unwrap();

        let failure = runner
            .run_job(serde_json::json!({"no_segments": true}), CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ErrorKind::Validation);
        assert_eq!(failure.stage, "validate");
    }

    #[tokio::test]
    async fn test_semantic_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(settings_in(dir.path())).unwrap();

        let failure = runner
            .run_job(
                serde_json::json!({"segments": [{"id": "a"}]}),
                CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ErrorKind::Validation);
        assert!(failure.message.contains("image or a video"));
    }

    #[tokio::test]
    async fn test_cancellation_before_work_leaves_no_temp_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(settings_in(dir.path())).unwrap();

        let (handle, signal) = CancelSignal::pair();
        handle.cancel();

        let failure = runner
            .run_job(
                serde_json::json!({
                    "segments": [{"id": "a", "image": {"url": "http://ex/a.jpg"}}]
                }),
                signal,
            )
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ErrorKind::Cancelled);

        // No per-job scope directory survives
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("job_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_required_asset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(settings_in(dir.path())).unwrap();

        // Local path that does not exist; image fixing is disabled
        let failure = runner
            .run_job(
                serde_json::json!({
                    "segments": [{"id": "a", "image": {"url": "/nonexistent/a.jpg"}}]
                }),
                CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ErrorKind::Asset);
        assert_eq!(failure.stage, "download");
        assert_eq!(failure.segment_id.as_deref(), Some("a"));
    }
}
