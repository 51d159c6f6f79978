//! Job validation stage.
//!
//! Two phases. Structural: required fields, value ranges, uniqueness of
//! segment ids, exactly-one-visual. Semantic: URL syntax, transition sums
//! against statically known duration bounds, overlay windows. Errors are
//! fatal; warnings are surfaced through metrics and the pipeline continues.

use std::collections::HashSet;

use async_trait::async_trait;
use reelkit_models::{Job, Segment, ValidationReport};
use tracing::warn;

use crate::context::{keys, PipelineContext};
use crate::engine::ContextStage;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::metrics::warnings;
use crate::settings::Settings;

/// Validate the parsed job document and publish it as `validated_job`.
pub struct ValidateStage;

#[async_trait]
impl ContextStage for ValidateStage {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let job: Job = ctx.get_cloned(keys::JOB)?;
        let report = validate_job(&job, ctx.settings());

        for issue in &report.warnings {
            warn!(field = %issue.field, code = %issue.code, "validation warning: {}", issue.message);
            if issue.code == "unsupported_transition" {
                ctx.metrics().warning(warnings::TRANSITION_DEGRADED);
            }
        }

        if !report.ok() {
            return Err(PipelineError::new(
                "validate",
                ErrorKind::Validation,
                report.error_summary(),
            ));
        }

        ctx.metadata
            .insert("segment_count".to_string(), job.segments.len().to_string());
        ctx.set(keys::VALIDATED_JOB, job)
    }
}

/// Run both validation phases over a job.
pub fn validate_job(job: &Job, settings: &Settings) -> ValidationReport {
    let mut report = ValidationReport::default();

    if job.segments.is_empty() {
        report.error("empty_segments", "segments", "at least one segment is required");
        return report;
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for (i, segment) in job.segments.iter().enumerate() {
        let field = |suffix: &str| format!("segments[{i}]{suffix}");

        if segment.id.trim().is_empty() {
            report.error("empty_segment_id", field(".id"), "segment id must be non-empty");
        } else if !seen_ids.insert(segment.id.as_str()) {
            report.error(
                "duplicate_segment_id",
                field(".id"),
                format!("segment id '{}' is not unique", segment.id),
            );
        }

        validate_segment(segment, i, settings, &mut report);
    }

    if let Some(bgm) = &job.background_music {
        if !(0.0..=2.0).contains(&bgm.volume) {
            report.error(
                "bgm_volume_range",
                "background_music.volume",
                format!("volume {} outside 0..=2", bgm.volume),
            );
        }
        if bgm.fade_in < 0.0 || bgm.fade_out < 0.0 {
            report.error(
                "negative_duration",
                "background_music",
                "fade durations must be >= 0",
            );
        }
        check_url(&bgm.audio.url, "background_music.url", &mut report);
    }

    report
}

fn validate_segment(
    segment: &Segment,
    index: usize,
    settings: &Settings,
    report: &mut ValidationReport,
) {
    let field = |suffix: &str| format!("segments[{index}]{suffix}");

    // Exactly one visual required; video wins when both are present
    if segment.image.is_none() && segment.video.is_none() {
        report.error(
            "missing_visual",
            field(""),
            "segment needs an image or a video",
        );
    }
    if segment.image.is_some() && segment.video.is_some() {
        report.warning(
            "both_visuals",
            field(""),
            "both image and video present; video wins",
        );
    }

    if let Some(image) = &segment.image {
        check_url(&image.url, &field(".image.url"), report);
    }
    if let Some(video) = &segment.video {
        check_url(&video.url, &field(".video.url"), report);
    }

    if let Some(vo) = &segment.voice_over {
        check_url(&vo.audio.url, &field(".voice_over.url"), report);
        if vo.start_delay < 0.0 || vo.end_delay < 0.0 {
            report.error(
                "negative_duration",
                field(".voice_over"),
                "start_delay and end_delay must be >= 0",
            );
        }
    }

    for transition in [&segment.transition_in, &segment.transition_out]
        .into_iter()
        .flatten()
    {
        if transition.duration < 0.0 {
            report.error(
                "negative_duration",
                field(".transition"),
                "transition duration must be >= 0",
            );
        }
        if !transition.kind.is_supported() {
            report.warning(
                "unsupported_transition",
                field(".transition"),
                format!(
                    "transition type '{}' is unsupported; degrading to fade",
                    transition.kind
                ),
            );
        }
    }

    // Statically known content bound: image segment without voice-over
    let static_content = if segment.voice_over.is_none() && segment.video.is_none() {
        Some(settings.video.default_segment_secs)
    } else {
        None
    };

    if let Some(content) = static_content {
        let transitions =
            segment.transition_in_duration() + segment.transition_out_duration();
        if transitions > content {
            report.error(
                "transitions_exceed_content",
                field(""),
                format!(
                    "transition durations ({transitions:.2}s) exceed the segment's content bound ({content:.2}s)"
                ),
            );
        }
    }

    for (j, overlay) in segment.text_over.iter().enumerate() {
        let overlay_field = format!("segments[{index}].text_over[{j}]");
        if overlay.start < 0.0 || overlay.end <= overlay.start {
            report.error(
                "invalid_overlay_window",
                overlay_field.clone(),
                format!("window [{}, {}] requires end > start >= 0", overlay.start, overlay.end),
            );
        } else if let Some(content) = static_content {
            if overlay.end > content {
                report.warning(
                    "overlay_outside_segment",
                    overlay_field,
                    format!(
                        "overlay ends at {:.2}s, after the segment's {content:.2}s content window",
                        overlay.end
                    ),
                );
            }
        }
    }
}

fn check_url(raw: &str, field: &str, report: &mut ValidationReport) {
    if raw.trim().is_empty() {
        report.error("empty_url", field, "url must be non-empty");
        return;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        if url::Url::parse(raw).is_err() {
            report.error("invalid_url", field, format!("'{raw}' is not a valid URL"));
        }
    }
    // Local paths are checked for existence by the downloader
}
