//! Concatenation helpers: demuxer lists, stream-copy and re-encode joins,
//! background-music overlay.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::command::{FfmpegCommand, FfmpegInput};
use crate::error::MediaResult;
use crate::filters;

/// Target encoding parameters shared by the renderer and the re-encode
/// concat path.
#[derive(Debug, Clone)]
pub struct EncodeTarget {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub pix_fmt: String,
    pub fps: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    pub channels: u32,
}

impl EncodeTarget {
    /// Apply the full target to a command.
    pub fn apply(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        cmd.video_codec(&self.video_codec)
            .preset(&self.preset)
            .crf(self.crf)
            .pix_fmt(&self.pix_fmt)
            .fps(self.fps)
            .audio_codec(&self.audio_codec)
            .audio_bitrate(&self.audio_bitrate)
            .audio_rate(self.sample_rate)
            .audio_channels(self.channels)
    }
}

/// Write a concat-demuxer list file next to the clips.
///
/// Single quotes in paths are escaped per the demuxer's quoting rules.
pub async fn write_concat_list(dir: &Path, clips: &[PathBuf]) -> MediaResult<PathBuf> {
    let list_path = dir.join("concat_list.txt");
    let mut body = String::new();
    for clip in clips {
        let escaped = clip.to_string_lossy().replace('\'', "'\\''");
        body.push_str(&format!("file '{}'\n", escaped));
    }

    let mut file = tokio::fs::File::create(&list_path).await?;
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;
    Ok(list_path)
}

/// Stream-copy concatenation via the concat demuxer. Valid only when every
/// input shares the normalized format and all boundaries are clean cuts.
pub fn concat_copy_command(list_path: &Path, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(output)
        .input(FfmpegInput::file(list_path).with_args(["-f", "concat", "-safe", "0"]))
        .copy_streams()
}

/// Filter-graph concatenation with explicit re-encode.
pub fn concat_reencode_command(
    clips: &[PathBuf],
    output: &Path,
    target: &EncodeTarget,
) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(output);
    for clip in clips {
        cmd = cmd.input(FfmpegInput::file(clip));
    }
    let cmd = cmd
        .filter_complex(filters::concat_graph(clips.len()))
        .map("[v]")
        .map("[a]");
    target.apply(cmd)
}

/// Overlay background music under a concatenated video.
///
/// The video stream is copied; only audio is re-encoded. `volume` is the
/// final gain, `duration` the program length the track is clipped to. With
/// `looped` the source repeats until trimmed.
pub fn bgm_mix_command(
    video: &Path,
    bgm: &Path,
    output: &Path,
    volume: f64,
    fade_in: f64,
    fade_out: f64,
    duration: f64,
    looped: bool,
    audio_codec: &str,
    audio_bitrate: &str,
) -> FfmpegCommand {
    let bgm_input = if looped {
        FfmpegInput::stream_looped(bgm)
    } else {
        FfmpegInput::file(bgm)
    };
    let shape = filters::bgm_shape(volume, fade_in, fade_out, duration);

    FfmpegCommand::new(output)
        .input(FfmpegInput::file(video))
        .input(bgm_input)
        .filter_complex(filters::bgm_mix_graph(&shape))
        .map("0:v")
        .map("[aout]")
        .output_args(["-c:v", "copy"])
        .audio_codec(audio_codec)
        .audio_bitrate(audio_bitrate)
        .shortest()
}

/// Parse the `mean_volume` report from ffmpeg `volumedetect` stderr.
pub fn parse_mean_volume(stderr: &str) -> Option<f64> {
    for line in stderr.lines() {
        if let Some(idx) = line.find("mean_volume:") {
            let rest = line[idx + "mean_volume:".len()..].trim();
            let value = rest.strip_suffix("dB").map(str::trim).unwrap_or(rest);
            if let Ok(db) = value.parse::<f64>() {
                return Some(db);
            }
        }
    }
    None
}

/// Command measuring a file's mean volume; the reading lands on stderr.
pub fn volumedetect_command(input: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-af".to_string(),
        "volumedetect".to_string(),
        "-vn".to_string(),
        "-sn".to_string(),
        "-dn".to_string(),
        "-f".to_string(),
        "null".to_string(),
        "/dev/null".to_string(),
    ]
}
