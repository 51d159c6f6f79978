//! Concatenation stage.
//!
//! Joins the intermediate clips in segment order and mixes the global
//! background music under the result. Because transitions were baked
//! additively into each clip, edges never overlap and concatenation is a
//! pure append; the only decision is stream-copy versus re-encode.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use reelkit_media::concat::{
    bgm_mix_command, concat_copy_command, concat_reencode_command, parse_mean_volume,
    volumedetect_command, write_concat_list,
};
use reelkit_media::FfmpegRunner;
use reelkit_models::{BackgroundMusic, Job, RenderedClip};
use tracing::{debug, info, warn};

use crate::context::{keys, PipelineContext};
use crate::engine::ContextStage;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::metrics::warnings;

/// Join rendered clips and publish `final_clip_path`.
pub struct ConcatenateStage;

/// How the clips get joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatStrategy {
    /// Concat demuxer with `-c copy`; no re-encode
    StreamCopy,
    /// Filter-graph concat with explicit re-encode
    Reencode,
}

#[async_trait]
impl ContextStage for ConcatenateStage {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let mut clips: Vec<RenderedClip> = ctx.get_cloned(keys::SEGMENT_CLIPS)?;
        clips.sort_by_key(|c| c.index);

        if clips.is_empty() {
            return Err(PipelineError::new(
                "concatenate",
                ErrorKind::Concatenation,
                "no rendered clips to concatenate",
            ));
        }

        let job: Job = ctx.get_cloned(keys::ALIGNED_JOB)?;
        let strategy = choose_strategy(&clips);
        info!(?strategy, clips = clips.len(), "concatenating clips");

        match strategy {
            ConcatStrategy::StreamCopy => ctx.metrics().warning(warnings::CONCAT_STREAM_COPY),
            ConcatStrategy::Reencode => ctx.metrics().warning(warnings::CONCAT_REENCODE),
        }
        ctx.metadata
            .insert("concat_strategy".to_string(), format!("{strategy:?}"));

        let joined = self.join_clips(&clips, strategy, ctx).await?;

        let final_path = ctx
            .scope()
            .temp_path(&format!("final_{}.mp4", ctx.job_id()));

        match &job.background_music {
            Some(bgm) if bgm.audio.local_path.is_some() => {
                self.mix_bgm(&joined, bgm, &clips, &final_path, ctx).await?;
            }
            _ => {
                tokio::fs::rename(&joined, &final_path).await.map_err(|e| {
                    PipelineError::with_source(
                        "concatenate",
                        ErrorKind::Resource,
                        "failed to place final clip",
                        e,
                    )
                })?;
            }
        }

        info!(path = %final_path.display(), "final clip assembled");
        ctx.set(keys::FINAL_CLIP_PATH, final_path)
    }
}

impl ConcatenateStage {
    async fn join_clips(
        &self,
        clips: &[RenderedClip],
        strategy: ConcatStrategy,
        ctx: &PipelineContext,
    ) -> PipelineResult<PathBuf> {
        let output = ctx.scope().temp_path("concat_output.mp4");
        let paths: Vec<PathBuf> = clips.iter().map(|c| c.path.clone()).collect();
        let total_duration: f64 = clips.iter().map(|c| c.duration).sum();

        let cmd = match strategy {
            ConcatStrategy::StreamCopy => {
                let list = write_concat_list(ctx.scope().temp_dir(), &paths)
                    .await
                    .map_err(|e| PipelineError::from_media("concatenate", e))?;
                concat_copy_command(&list, &output)
            }
            ConcatStrategy::Reencode => {
                concat_reencode_command(&paths, &output, &ctx.settings().encode_target())
            }
        };

        let runner = FfmpegRunner::new()
            .with_cancel(ctx.cancel().watch())
            .with_timeout(ctx.settings().subprocess_timeout(total_duration));
        runner.run(&cmd).await.map_err(|e| {
            let err = PipelineError::from_media("concatenate", e);
            if err.kind == ErrorKind::Processing {
                PipelineError::with_source(
                    "concatenate",
                    ErrorKind::Concatenation,
                    err.message.clone(),
                    err,
                )
            } else {
                err
            }
        })?;

        Ok(output)
    }

    async fn mix_bgm(
        &self,
        joined: &PathBuf,
        bgm: &BackgroundMusic,
        clips: &[RenderedClip],
        final_path: &PathBuf,
        ctx: &PipelineContext,
    ) -> PipelineResult<()> {
        let settings = ctx.settings();
        let bgm_path = bgm.audio.local_path.as_ref().expect("checked by caller");

        // Program length drives trim and fade placement
        let video_duration = match reelkit_media::get_duration(joined).await {
            Ok(duration) if duration > 0.0 => duration,
            _ => clips.iter().map(|c| c.duration).sum(),
        };

        let gain = self.bgm_gain(joined, bgm_path, bgm.volume, ctx).await;
        let fade_in = positive_or(bgm.fade_in, settings.audio.bgm_fade_in);
        let fade_out = positive_or(bgm.fade_out, settings.audio.bgm_fade_out);

        debug!(
            gain,
            fade_in, fade_out, video_duration, "mixing background music"
        );

        let cmd = bgm_mix_command(
            joined,
            bgm_path,
            final_path,
            gain,
            fade_in,
            fade_out,
            video_duration,
            settings.audio.bgm_loop,
            &settings.video.audio_codec,
            &settings.video.audio_bitrate,
        );

        let runner = FfmpegRunner::new()
            .with_cancel(ctx.cancel().watch())
            .with_timeout(settings.subprocess_timeout(video_duration));
        runner
            .run(&cmd)
            .await
            .map_err(|e| PipelineError::from_media("concatenate", e))?;
        Ok(())
    }

    /// Final BGM gain: the job's volume knob times either the measured
    /// duck factor or the configured base volume.
    async fn bgm_gain(
        &self,
        program: &PathBuf,
        bgm: &PathBuf,
        job_volume: f64,
        ctx: &PipelineContext,
    ) -> f64 {
        let base = if ctx.settings().audio.bgm_auto_duck {
            match (measure_mean_volume(program).await, measure_mean_volume(bgm).await) {
                (Some(program_db), Some(bgm_db)) => {
                    let diff_db = program_db - bgm_db;
                    let factor = 10f64.powf(diff_db / 20.0).clamp(0.1, 0.5);
                    debug!(program_db, bgm_db, factor, "auto-ducked bgm volume");
                    factor
                }
                _ => {
                    warn!("mean volume unavailable, using configured bgm volume");
                    ctx.settings().audio.bgm_volume
                }
            }
        } else {
            ctx.settings().audio.bgm_volume
        };
        base * job_volume
    }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        fallback
    }
}

/// Stream-copy is possible when every boundary is a clean cut and all clips
/// share the normalized format.
pub fn choose_strategy(clips: &[RenderedClip]) -> ConcatStrategy {
    let all_cut = clips.iter().all(RenderedClip::has_clean_boundaries);
    let uniform = clips
        .windows(2)
        .all(|pair| pair[0].format.matches(&pair[1].format));

    if all_cut && uniform {
        ConcatStrategy::StreamCopy
    } else {
        ConcatStrategy::Reencode
    }
}

/// Run `volumedetect` over a file; the reading arrives on stderr.
async fn measure_mean_volume(path: &PathBuf) -> Option<f64> {
    let output = tokio::process::Command::new("ffmpeg")
        .args(volumedetect_command(path))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .ok()?;

    parse_mean_volume(&String::from_utf8_lossy(&output.stderr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelkit_models::{ClipFormat, TransitionKind};

    fn format() -> ClipFormat {
        ClipFormat {
            width: 1920,
            height: 1080,
            fps: 24.0,
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            sample_rate: 44100,
            channels: 2,
        }
    }

    fn clip(index: usize, transition_out: Option<TransitionKind>) -> RenderedClip {
        RenderedClip {
            index,
            segment_id: format!("s{index}"),
            path: PathBuf::from(format!("/tmp/{index}.mp4")),
            duration: 3.0,
            has_audio: true,
            transition_in_applied: None,
            transition_out_applied: transition_out,
            format: format(),
        }
    }

    #[test]
    fn test_all_cut_uniform_uses_stream_copy() {
        let clips = vec![
            clip(0, Some(TransitionKind::Cut)),
            clip(1, None),
            clip(2, Some(TransitionKind::Cut)),
        ];
        assert_eq!(choose_strategy(&clips), ConcatStrategy::StreamCopy);
    }

    #[test]
    fn test_fade_forces_reencode() {
        let clips = vec![clip(0, Some(TransitionKind::Fade)), clip(1, None)];
        assert_eq!(choose_strategy(&clips), ConcatStrategy::Reencode);
    }

    #[test]
    fn test_format_mismatch_forces_reencode() {
        let mut second = clip(1, None);
        second.format.fps = 30.0;
        let clips = vec![clip(0, None), second];
        assert_eq!(choose_strategy(&clips), ConcatStrategy::Reencode);
    }

    #[test]
    fn test_single_clip_stream_copies() {
        let clips = vec![clip(0, None)];
        assert_eq!(choose_strategy(&clips), ConcatStrategy::StreamCopy);
    }

    #[test]
    fn test_positive_or() {
        assert_eq!(positive_or(1.5, 0.3), 1.5);
        assert_eq!(positive_or(0.0, 0.3), 0.3);
    }
}
