//! End-to-end pipeline behavior that does not depend on external services.
//!
//! Rendering requires a working ffmpeg against real media, so these tests
//! drive the pipeline up to the stages that can run hermetically and assert
//! the failure surface and cleanup behavior beyond that point.

use reelkit_pipeline::{CancelSignal, ErrorKind, JobRunner, Settings};

fn settings_in(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.work_dir = dir.to_path_buf();
    settings.ai.image_fix_enabled = false;
    settings.ai.align_enabled = false;
    settings.download.max_retries = 0;
    settings
}

/// A job whose assets are local files that exist but are not real media:
/// validation and download succeed, rendering fails, and the scope still
/// cleans up completely.
#[tokio::test]
async fn render_failure_is_scoped_and_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    let image = assets.join("a.jpg");
    std::fs::write(&image, b"not really a jpeg").unwrap();

    let runner = JobRunner::new(settings_in(dir.path())).unwrap();
    let doc = serde_json::json!({
        "segments": [
            {"id": "intro", "image": {"url": image.to_str().unwrap()}}
        ]
    });

    let failure = runner.run_job(doc, CancelSignal::never()).await.unwrap_err();

    // The fake image survives validation and download, then rendering fails
    assert_eq!(failure.stage, "render_segments");
    assert_eq!(failure.kind, ErrorKind::Processing);

    // Invariant: no per-job temp directory outlives the job
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("job_"))
        .collect();
    assert!(leftovers.is_empty());
}

/// Duplicate segment ids are rejected before any asset is touched.
#[tokio::test]
async fn duplicate_ids_fail_fast() {
    let dir = tempfile::tempdir().unwrap();
    let runner = JobRunner::new(settings_in(dir.path())).unwrap();

    let doc = serde_json::json!({
        "segments": [
            {"id": "a", "image": {"url": "http://ex/a.jpg"}},
            {"id": "a", "image": {"url": "http://ex/b.jpg"}}
        ]
    });

    let failure = runner.run_job(doc, CancelSignal::never()).await.unwrap_err();
    assert_eq!(failure.stage, "validate");
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert!(failure.message.contains("not unique"));
}

/// Cancellation before the first stage: nothing runs, nothing is uploaded,
/// the caller sees `Cancelled`.
#[tokio::test]
async fn pre_cancelled_job_returns_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let runner = JobRunner::new(settings_in(dir.path())).unwrap();

    let (handle, signal) = CancelSignal::pair();
    handle.cancel();

    let doc = serde_json::json!({
        "segments": [{"id": "a", "image": {"url": "http://ex/a.jpg"}}]
    });

    let failure = runner.run_job(doc, signal).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Cancelled);
}
