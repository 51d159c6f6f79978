//! Transcript alignment stage.
//!
//! Turns voice-over audio plus transcript text into timed text overlays:
//! split the transcript into display spans, align the audio against the
//! transcript remotely, map spans onto the timed words, and append the
//! resulting overlays to the segment. Every remote failure degrades to
//! uniform time distribution; this stage never fails the pipeline.

pub mod client;
pub mod mapping;
pub mod splitter;

use async_trait::async_trait;
use reelkit_media::probe_media;
use reelkit_models::{Job, Segment, TextOverlay, TimedSpan};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::context::{keys, PipelineContext};
use crate::engine::ContextStage;
use crate::error::PipelineResult;
use crate::llm::LlmClient;
use crate::metrics::warnings;

use client::AlignerClient;

/// Produce timed text overlays and publish `aligned_job`.
pub struct AlignTextStage;

#[async_trait]
impl ContextStage for AlignTextStage {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let mut job: Job = ctx.get_cloned(keys::FIXED_JOB)?;

        if ctx.settings().ai.align_enabled {
            let llm = LlmClient::from_settings(&ctx.settings().ai);
            let aligner = AlignerClient::new(&ctx.settings().ai);

            for segment in &mut job.segments {
                align_segment(segment, &aligner, llm.as_ref(), ctx).await;
            }
        }

        ctx.set(keys::ALIGNED_JOB, job)
    }
}

/// LLM span-splitting response.
#[derive(Debug, Deserialize, JsonSchema)]
struct TranscriptSpans {
    /// Natural display spans covering the whole transcript in order
    segments: Vec<String>,
}

/// LLM span-to-word mapping response.
#[derive(Debug, Deserialize, JsonSchema)]
struct SpanRanges {
    /// One word-index range per span, in span order
    ranges: Vec<SpanRange>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SpanRange {
    start_index: usize,
    end_index: usize,
}

/// Align one segment; all failures degrade, none propagate.
async fn align_segment(
    segment: &mut Segment,
    aligner: &AlignerClient,
    llm: Option<&LlmClient>,
    ctx: &PipelineContext,
) {
    let Some(vo) = &segment.voice_over else {
        return;
    };
    let Some(content) = vo.content.as_deref().map(str::trim).filter(|c| !c.is_empty()) else {
        return;
    };
    let Some(audio_path) = vo.audio.local_path.clone() else {
        warn!(segment = %segment.id, "voice-over has no local file, skipping alignment");
        return;
    };
    if ctx.cancel().is_cancelled() {
        return;
    }

    let spans = split_with_llm(content, llm).await;
    if spans.is_empty() {
        return;
    }

    let vo_duration = match probe_media(&audio_path).await {
        Ok(media_info) => media_info.duration,
        Err(e) => {
            debug!(segment = %segment.id, error = %e, "voice-over probe failed");
            ctx.settings().video.default_segment_secs
        }
    };

    let timed = match aligner.align(&audio_path, content).await {
        Ok((words, stats)) => {
            debug!(
                segment = %segment.id,
                ratio = stats.success_ratio(),
                "alignment succeeded, mapping spans"
            );
            match map_with_llm(&spans, &words, llm).await {
                Some(timed) => timed,
                None => {
                    ctx.metrics().warning(warnings::ALIGNER_UNAVAILABLE);
                    warn!(segment = %segment.id, "span mapping failed, using uniform timing");
                    mapping::uniform_spans(&spans, vo_duration)
                }
            }
        }
        Err(e) => {
            ctx.metrics().warning(warnings::ALIGNER_UNAVAILABLE);
            warn!(segment = %segment.id, error = %e, "aligner unavailable, using uniform timing");
            mapping::uniform_spans(&spans, vo_duration)
        }
    };

    info!(
        segment = %segment.id,
        spans = timed.len(),
        "generated text overlays"
    );
    segment
        .text_over
        .extend(timed.into_iter().map(overlay_from_span));
}

fn overlay_from_span(span: TimedSpan) -> TextOverlay {
    TextOverlay::new(span.text, span.start, span.end)
}

/// Split via the LLM when available; always repaired by the rule checker and
/// gated on content preservation, otherwise the deterministic splitter runs.
async fn split_with_llm(content: &str, llm: Option<&LlmClient>) -> Vec<String> {
    if let Some(llm) = llm {
        let prompt = format!(
            "Split this transcript into natural speech segments for video text overlay. \
             Preserve every word, break at phrase boundaries, keep each segment short:\n\n\"{content}\""
        );
        match llm
            .structured::<TranscriptSpans>(
                "You segment transcripts into short natural caption lines.",
                &prompt,
            )
            .await
        {
            Ok(response) => {
                let repaired = splitter::repair_spans(response.segments);
                if !repaired.is_empty() && splitter::preserves_content(content, &repaired) {
                    return repaired;
                }
                warn!("LLM span split failed content preservation, using rule splitter");
            }
            Err(e) => {
                warn!(error = %e, "LLM span split failed, using rule splitter");
            }
        }
    }
    splitter::split_spans(content)
}

/// Map via the LLM when available, validated for bounds and monotonicity;
/// the deterministic longest-match walk is the fallback.
async fn map_with_llm(
    spans: &[String],
    words: &[reelkit_models::AlignedWord],
    llm: Option<&LlmClient>,
) -> Option<Vec<TimedSpan>> {
    if let Some(llm) = llm {
        let word_list: Vec<&str> = words.iter().map(|w| w.word.as_str()).collect();
        let prompt = format!(
            "Given these aligned words (by index):\n{:?}\n\nand these caption spans:\n{:?}\n\n\
             Return the inclusive word-index range covering each span, in span order.",
            word_list, spans
        );
        match llm
            .structured::<SpanRanges>(
                "You map caption spans onto a word stream by index.",
                &prompt,
            )
            .await
        {
            Ok(response) => {
                if let Some(timed) = spans_from_ranges(spans, words, &response.ranges) {
                    return Some(timed);
                }
                warn!("LLM span ranges failed validation, using deterministic mapping");
            }
            Err(e) => {
                debug!(error = %e, "LLM span mapping failed, using deterministic mapping");
            }
        }
    }
    mapping::map_spans(spans, words)
}

/// Deterministic validation of LLM ranges: right count, in bounds, monotonic,
/// resolvable to timed windows.
fn spans_from_ranges(
    spans: &[String],
    words: &[reelkit_models::AlignedWord],
    ranges: &[SpanRange],
) -> Option<Vec<TimedSpan>> {
    if ranges.len() != spans.len() || words.is_empty() {
        return None;
    }

    let mut out = Vec::with_capacity(spans.len());
    let mut prev_end_index = 0usize;
    let mut prev_end_time = 0.0f64;

    for (span, range) in spans.iter().zip(ranges) {
        if range.end_index < range.start_index
            || range.end_index >= words.len()
            || range.start_index < prev_end_index
        {
            return None;
        }
        let window = &words[range.start_index..=range.end_index];
        let timed: Vec<(f64, f64)> = window
            .iter()
            .filter(|w| w.is_aligned())
            .filter_map(|w| Some((w.start?, w.end?)))
            .collect();
        if timed.is_empty() {
            return None;
        }
        let start = timed
            .iter()
            .map(|(s, _)| *s)
            .fold(f64::INFINITY, f64::min)
            .max(prev_end_time);
        let end = timed.iter().map(|(_, e)| *e).fold(0.0f64, f64::max).max(start + 0.1);

        prev_end_index = range.end_index + 1;
        prev_end_time = end;
        out.push(TimedSpan::new(span.clone(), start, end));
    }

    Some(out)
}
