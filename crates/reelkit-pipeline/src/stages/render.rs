//! Segment renderer.
//!
//! Composes each segment into one normalized intermediate MP4. Runs as a
//! batch with bounded concurrency; input order is preserved in the output.
//!
//! Timing is additive: the transition lead-in and tail extend the segment's
//! own timeline and never overlap a neighbor.
//!
//! ```text
//! |<- lead_in ->|<- start_delay + voice + end_delay ->|<- tail_out ->|
//! |   fade in   |            content                  |   fade out   |
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reelkit_media::{filters, FfmpegCommand, FfmpegInput, FfmpegRunner, MediaInfo};
use reelkit_models::{ClipFormat, Job, RenderedClip, Segment, SegmentVisual, TransitionKind};
use tracing::{debug, info, warn};

use crate::context::{keys, PipelineContext};
use crate::engine::ContextStage;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::metrics::warnings;
use crate::processor::{run_batch, BatchOptions, StageServices};
use crate::settings::Settings;

/// Render all segments into intermediate clips and publish `segment_clips`.
pub struct RenderSegmentsStage;

#[async_trait]
impl ContextStage for RenderSegmentsStage {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let job: Job = ctx.get_cloned(keys::ALIGNED_JOB)?;

        let services = StageServices {
            job_id: ctx.job_id().clone(),
            settings: ctx.settings_arc(),
            scope: ctx.scope_arc(),
            metrics: ctx.metrics().clone(),
            cancel: ctx.cancel().clone(),
        };

        let renderer = Arc::new(SegmentRenderer {
            settings: ctx.settings_arc(),
        });

        let options = BatchOptions {
            name: "render_segments.batch",
            max_concurrent: ctx.settings().performance.max_concurrent_segments,
            strict: ctx.settings().performance.strict_segments,
        };

        let total = job.segments.len();
        let outcomes = run_batch(job.segments, &options, &services, |index, segment| {
            let renderer = Arc::clone(&renderer);
            let services = services.clone();
            async move { renderer.render(index, segment, &services).await }
        })
        .await?;

        let mut clips: Vec<RenderedClip> = Vec::with_capacity(total);
        for outcome in outcomes {
            match outcome.result {
                Ok(clip) => clips.push(clip),
                Err(e) => {
                    ctx.metrics().warning(warnings::SEGMENT_RENDER_FAILED);
                    warn!(index = outcome.index, error = %e, "segment render failed, continuing");
                }
            }
        }

        info!("rendered {}/{} segments", clips.len(), total);
        ctx.metadata
            .insert("rendered_segments".to_string(), clips.len().to_string());
        ctx.set(keys::SEGMENT_CLIPS, clips)
    }
}

/// Additive timing layout of one segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentTiming {
    /// Transition lead-in seconds (0 for cut)
    pub lead_in: f64,
    /// Content seconds: delays + voice, or the source video, or the default
    pub content: f64,
    /// Transition tail seconds (0 for cut)
    pub tail_out: f64,
    /// Offset of the voice-over on the clip timeline
    pub audio_delay: f64,
}

impl SegmentTiming {
    pub fn effective(&self) -> f64 {
        self.lead_in + self.content + self.tail_out
    }
}

/// Pure timing computation; `voice_duration` and `video_duration` come from
/// probing the downloaded assets.
pub fn compute_timing(
    segment: &Segment,
    voice_duration: Option<f64>,
    video_duration: Option<f64>,
    settings: &Settings,
) -> SegmentTiming {
    let (start_delay, end_delay) = segment
        .voice_over
        .as_ref()
        .map(|vo| (vo.start_delay, vo.end_delay))
        .unwrap_or((0.0, 0.0));

    let content = match voice_duration {
        Some(voice) => start_delay + voice + end_delay,
        None => video_duration.unwrap_or(settings.video.default_segment_secs),
    };

    let lead_in = segment.transition_in_duration();
    let tail_out = segment.transition_out_duration();

    SegmentTiming {
        lead_in,
        content,
        tail_out,
        audio_delay: lead_in + start_delay,
    }
}

struct SegmentRenderer {
    settings: Arc<Settings>,
}

impl SegmentRenderer {
    async fn render(
        &self,
        index: usize,
        segment: Segment,
        services: &StageServices,
    ) -> PipelineResult<RenderedClip> {
        let segment_id = segment.id.clone();
        debug!(segment = %segment_id, index, "rendering segment");

        let visual = segment.visual().ok_or_else(|| {
            PipelineError::new("render_segments", ErrorKind::Asset, "segment has no visual")
                .for_segment(segment_id.clone())
        })?;

        let visual_path = match visual {
            SegmentVisual::Image(asset) | SegmentVisual::Video(asset) => {
                asset.local_path.clone().ok_or_else(|| {
                    PipelineError::new(
                        "render_segments",
                        ErrorKind::Asset,
                        format!("visual asset not materialized: {}", asset.url),
                    )
                    .for_segment(segment_id.clone())
                })?
            }
        };
        let is_video = matches!(visual, SegmentVisual::Video(_));

        // Probe the inputs that drive timing
        let voice_path = segment
            .voice_over
            .as_ref()
            .and_then(|vo| vo.audio.local_path.clone());
        let voice_duration = match &voice_path {
            Some(path) => Some(self.probe_duration(path, &segment_id).await?),
            None => None,
        };
        let video_duration = if is_video {
            Some(self.probe_duration(&visual_path, &segment_id).await?)
        } else {
            None
        };

        let timing = compute_timing(&segment, voice_duration, video_duration, &self.settings);
        let effective = timing.effective();

        let output = services
            .scope
            .temp_path(&format!("segment_{index:03}_{segment_id}.mp4"));

        let cmd = self.build_command(&segment, &visual_path, is_video, &voice_path, timing, &output);

        let runner = FfmpegRunner::new()
            .with_cancel(services.cancel.watch())
            .with_timeout(self.settings.subprocess_timeout(effective));
        runner
            .run(&cmd)
            .await
            .map_err(|e| PipelineError::from_media("render_segments", e).for_segment(segment_id.clone()))?;

        debug!(segment = %segment_id, duration = effective, "segment rendered");

        Ok(RenderedClip {
            index,
            segment_id,
            path: output,
            duration: effective,
            has_audio: true,
            transition_in_applied: segment.transition_in.as_ref().map(|t| t.kind.effective()),
            transition_out_applied: segment.transition_out.as_ref().map(|t| t.kind.effective()),
            format: target_format(&self.settings),
        })
    }

    async fn probe_duration(&self, path: &PathBuf, segment_id: &str) -> PipelineResult<f64> {
        let media_info: MediaInfo = reelkit_media::probe_media(path)
            .await
            .map_err(|e| PipelineError::from_media("render_segments", e).for_segment(segment_id))?;
        Ok(media_info.duration)
    }

    /// Assemble the full ffmpeg invocation for one segment.
    fn build_command(
        &self,
        segment: &Segment,
        visual_path: &PathBuf,
        is_video: bool,
        voice_path: &Option<PathBuf>,
        timing: SegmentTiming,
        output: &PathBuf,
    ) -> FfmpegCommand {
        let video = &self.settings.video;
        let effective = timing.effective();

        let visual_input = if is_video {
            FfmpegInput::file(visual_path)
        } else {
            FfmpegInput::looped_image(visual_path)
        };
        let audio_input = match voice_path {
            Some(path) => FfmpegInput::file(path),
            None => FfmpegInput::lavfi(anullsrc_spec(
                video.audio_sample_rate,
                video.audio_channels,
            )),
        };

        let graph = format!(
            "[0:v]{video_chain}[v];[1:a]{audio_chain}[a]",
            video_chain = self.video_chain(segment, is_video, timing),
            audio_chain = self.audio_chain(voice_path.is_some(), timing),
        );

        let cmd = FfmpegCommand::new(output)
            .input(visual_input)
            .input(audio_input)
            .filter_complex(graph)
            .map("[v]")
            .map("[a]")
            .duration(effective);
        self.settings.encode_target().apply(cmd)
    }

    /// Normalization, freeze/truncate, transition fades, text overlays.
    fn video_chain(&self, segment: &Segment, is_video: bool, timing: SegmentTiming) -> String {
        let video = &self.settings.video;
        let effective = timing.effective();
        let mut chain = vec![filters::normalize_video(
            video.width,
            video.height,
            video.fps,
            &video.pix_fmt,
        )];

        if is_video {
            // Clone frames under the lead-in and out to the full length, then
            // truncate; a looped image needs neither
            chain.push(filters::freeze_extend(timing.lead_in, effective));
        }

        if let Some(transition) = &segment.transition_in {
            if !transition.is_noop() {
                chain.push(filters::video_fade_in(&transition.kind, transition.duration));
            }
        }
        if let Some(transition) = &segment.transition_out {
            if !transition.is_noop() {
                chain.push(filters::video_fade_out(
                    &transition.kind,
                    effective - transition.duration,
                    transition.duration,
                ));
            }
        }

        let defaults = self.settings.drawtext_defaults();
        for overlay in &segment.text_over {
            if let Some(filter) = filters::drawtext(overlay, &defaults, timing.audio_delay) {
                chain.push(filter);
            }
        }

        chain.join(",")
    }

    /// Voice offset and silence padding, then transition fades.
    fn audio_chain(&self, has_voice: bool, timing: SegmentTiming) -> String {
        let effective = timing.effective();
        let mut chain = Vec::new();

        if has_voice {
            chain.push(filters::voice_shape(timing.audio_delay, effective));
        } else {
            chain.push(format!("atrim=duration={:.3}", effective));
        }

        if timing.lead_in > 0.0 {
            chain.push(filters::audio_fade_in(timing.lead_in));
        }
        if timing.tail_out > 0.0 {
            chain.push(filters::audio_fade_out(
                effective - timing.tail_out,
                timing.tail_out,
            ));
        }

        chain.join(",")
    }
}

fn anullsrc_spec(sample_rate: u32, channels: u32) -> String {
    let layout = if channels == 1 { "mono" } else { "stereo" };
    format!("anullsrc=channel_layout={layout}:sample_rate={sample_rate}")
}

/// The normalized format every intermediate clip is encoded to.
fn target_format(settings: &Settings) -> ClipFormat {
    let video = &settings.video;
    ClipFormat {
        width: video.width,
        height: video.height,
        fps: video.fps as f64,
        video_codec: codec_stream_name(&video.codec),
        audio_codec: audio_stream_name(&video.audio_codec),
        sample_rate: video.audio_sample_rate,
        channels: video.audio_channels,
    }
}

/// Encoder names differ from the stream codec names ffprobe reports.
fn codec_stream_name(encoder: &str) -> String {
    match encoder {
        "libx264" => "h264".to_string(),
        "libx265" => "hevc".to_string(),
        other => other.to_string(),
    }
}

fn audio_stream_name(encoder: &str) -> String {
    match encoder {
        "libopus" => "opus".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    fn segment(body: &str) -> Segment {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_timing_voice_plus_delays() {
        let seg = segment(
            r#"{"id":"a","image":{"url":"http://ex/a.jpg"},
                "voice_over":{"url":"http://ex/a.mp3","start_delay":0.5,"end_delay":0.5}}"#,
        );
        let timing = compute_timing(&seg, Some(3.0), None, &settings());
        assert!((timing.content - 4.0).abs() < 1e-9);
        assert!((timing.effective() - 4.0).abs() < 1e-9);
        assert!((timing.audio_delay - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_timing_additive_transitions() {
        // S2 shape: 2.0s voice-over plus a 0.5s fade
        let seg = segment(
            r#"{"id":"a","image":{"url":"http://ex/a.jpg"},
                "voice_over":{"url":"http://ex/a.mp3"},
                "transition_out":{"type":"fade","duration":0.5}}"#,
        );
        let timing = compute_timing(&seg, Some(2.0), None, &settings());
        assert!((timing.effective() - 2.5).abs() < 1e-9);

        let seg = segment(
            r#"{"id":"b","image":{"url":"http://ex/b.jpg"},
                "voice_over":{"url":"http://ex/b.mp3"},
                "transition_in":{"type":"fade","duration":0.5}}"#,
        );
        let timing = compute_timing(&seg, Some(2.0), None, &settings());
        assert!((timing.effective() - 2.5).abs() < 1e-9);
        // Voice starts after the lead-in
        assert!((timing.audio_delay - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_timing_rendered_duration_invariant() {
        let seg = segment(
            r#"{"id":"a","image":{"url":"http://ex/a.jpg"},
                "voice_over":{"url":"http://ex/a.mp3","start_delay":0.3,"end_delay":0.2},
                "transition_in":{"type":"fadeblack","duration":0.4},
                "transition_out":{"type":"fadewhite","duration":0.6}}"#,
        );
        let voice = 2.5;
        let timing = compute_timing(&seg, Some(voice), None, &settings());
        let floor = voice + 0.3 + 0.2 + 0.4 + 0.6;
        assert!(timing.effective() >= floor - 1e-9);
    }

    #[test]
    fn test_timing_cut_adds_nothing() {
        let seg = segment(
            r#"{"id":"a","image":{"url":"http://ex/a.jpg"},
                "voice_over":{"url":"http://ex/a.mp3"},
                "transition_in":{"type":"cut","duration":2.0}}"#,
        );
        let timing = compute_timing(&seg, Some(3.0), None, &settings());
        assert!((timing.effective() - 3.0).abs() < 1e-9);
        assert_eq!(timing.audio_delay, 0.0);
    }

    #[test]
    fn test_timing_video_without_voice_uses_source() {
        let seg = segment(r#"{"id":"a","video":{"url":"http://ex/a.mp4"}}"#);
        let timing = compute_timing(&seg, None, Some(7.2), &settings());
        assert!((timing.content - 7.2).abs() < 1e-9);
    }

    #[test]
    fn test_timing_image_without_voice_uses_default() {
        let seg = segment(r#"{"id":"a","image":{"url":"http://ex/a.jpg"}}"#);
        let timing = compute_timing(&seg, None, None, &settings());
        assert!((timing.content - settings().video.default_segment_secs).abs() < 1e-9);
    }

    #[test]
    fn test_video_chain_structure() {
        let renderer = SegmentRenderer {
            settings: Arc::new(settings()),
        };
        let seg = segment(
            r#"{"id":"a","video":{"url":"http://ex/a.mp4"},
                "voice_over":{"url":"http://ex/a.mp3"},
                "transition_in":{"type":"fade","duration":0.5},
                "text_over":[{"text":"Hi","start":0.0,"end":1.0}]}"#,
        );
        let timing = compute_timing(&seg, Some(2.0), Some(2.0), &settings());
        let chain = renderer.video_chain(&seg, true, timing);

        assert!(chain.contains("scale=1920:1080"));
        assert!(chain.contains("fps=24"));
        assert!(chain.contains("tpad="));
        assert!(chain.contains("fade=t=in:st=0:d=0.500"));
        assert!(chain.contains("drawtext="));
        // Overlay window is offset by the transition lead-in
        assert!(chain.contains("between(t,0.500,1.500)"));
    }

    #[test]
    fn test_image_chain_has_no_freeze() {
        let renderer = SegmentRenderer {
            settings: Arc::new(settings()),
        };
        let seg = segment(r#"{"id":"a","image":{"url":"http://ex/a.jpg"}}"#);
        let timing = compute_timing(&seg, None, None, &settings());
        let chain = renderer.video_chain(&seg, false, timing);
        assert!(!chain.contains("tpad"));
    }

    #[test]
    fn test_audio_chain_with_voice() {
        let renderer = SegmentRenderer {
            settings: Arc::new(settings()),
        };
        let timing = SegmentTiming {
            lead_in: 0.5,
            content: 3.0,
            tail_out: 0.5,
            audio_delay: 0.5,
        };
        let chain = renderer.audio_chain(true, timing);
        assert!(chain.contains("adelay=500|500"));
        assert!(chain.contains("atrim=duration=4.000"));
        assert!(chain.contains("afade=t=in:st=0:d=0.500"));
        assert!(chain.contains("afade=t=out:st=3.500:d=0.500"));
    }

    #[test]
    fn test_anullsrc_spec() {
        assert_eq!(
            anullsrc_spec(44100, 2),
            "anullsrc=channel_layout=stereo:sample_rate=44100"
        );
        assert_eq!(
            anullsrc_spec(48000, 1),
            "anullsrc=channel_layout=mono:sample_rate=48000"
        );
    }

    #[test]
    fn test_target_format_uses_stream_names() {
        let format = target_format(&settings());
        assert_eq!(format.video_codec, "h264");
        assert_eq!(format.audio_codec, "aac");
    }

    #[test]
    fn test_unsupported_transition_renders_as_fade() {
        let renderer = SegmentRenderer {
            settings: Arc::new(settings()),
        };
        let seg = segment(
            r#"{"id":"a","image":{"url":"http://ex/a.jpg"},
                "voice_over":{"url":"http://ex/a.mp3"},
                "transition_in":{"type":"dissolve","duration":0.5}}"#,
        );
        let timing = compute_timing(&seg, Some(2.0), None, &settings());
        // The unknown kind still extends the timeline and draws a basic fade
        assert!((timing.effective() - 2.5).abs() < 1e-9);
        let chain = renderer.video_chain(&seg, false, timing);
        assert!(chain.contains("fade=t=in:st=0:d=0.500:color=black"));
    }
}
