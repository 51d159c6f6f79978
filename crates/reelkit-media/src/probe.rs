//! FFprobe media inspection.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{MediaError, MediaResult};

/// Probed media information. Also used for still images, which probe with a
/// zero duration and no audio stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Duration in seconds; 0.0 for still images
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub sample_rate: u32,
    pub channels: u32,
    /// File size in bytes
    pub size: u64,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

/// FFprobe JSON output shape.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    duration: Option<String>,
}

/// Probe a media file.
pub async fn probe_media(path: impl AsRef<Path>) -> MediaResult<MediaInfo> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)?;

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::FfprobeFailed {
            message: format!("FFprobe failed for {}", path.display()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
        });
    }

    let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
    parse_probe(probe)
}

fn parse_probe(probe: FfprobeOutput) -> MediaResult<MediaInfo> {
    let video_stream = probe.streams.iter().find(|s| s.codec_type == "video");
    let audio_stream = probe.streams.iter().find(|s| s.codec_type == "audio");

    if video_stream.is_none() && audio_stream.is_none() {
        return Err(MediaError::invalid_media("no audio or video streams"));
    }

    // Container duration, falling back to the longest stream duration
    let duration = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            probe
                .streams
                .iter()
                .filter_map(|s| s.duration.as_deref().and_then(|d| d.parse::<f64>().ok()))
                .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.max(d))))
        })
        .unwrap_or(0.0);

    let size = probe
        .format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let fps = video_stream
        .and_then(|s| {
            s.avg_frame_rate
                .as_deref()
                .or(s.r_frame_rate.as_deref())
                .and_then(parse_frame_rate)
        })
        .unwrap_or(0.0);

    Ok(MediaInfo {
        duration,
        width: video_stream.and_then(|s| s.width).unwrap_or(0),
        height: video_stream.and_then(|s| s.height).unwrap_or(0),
        fps,
        video_codec: video_stream.and_then(|s| s.codec_name.clone()),
        audio_codec: audio_stream.and_then(|s| s.codec_name.clone()),
        sample_rate: audio_stream
            .and_then(|s| s.sample_rate.as_deref())
            .and_then(|r| r.parse().ok())
            .unwrap_or(0),
        channels: audio_stream.and_then(|s| s.channels).unwrap_or(0),
        size,
    })
}

/// Get a file's duration in seconds.
pub async fn get_duration(path: impl AsRef<Path>) -> MediaResult<f64> {
    let info = probe_media(path).await?;
    Ok(info.duration)
}

/// Parse a frame rate string, "30/1" or "29.97".
fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("30/1").unwrap() - 30.0).abs() < 0.01);
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert!((parse_frame_rate("24").unwrap() - 24.0).abs() < 0.01);
        assert!(parse_frame_rate("0/0").is_none());
    }

    #[test]
    fn test_parse_probe_video_with_audio() {
        let raw = r#"{
            "format": {"duration": "3.041", "size": "102400"},
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920,
                 "height": 1080, "avg_frame_rate": "24/1"},
                {"codec_type": "audio", "codec_name": "aac",
                 "sample_rate": "44100", "channels": 2}
            ]
        }"#;
        let probe: FfprobeOutput = serde_json::from_str(raw).unwrap();
        let info = parse_probe(probe).unwrap();
        assert!((info.duration - 3.041).abs() < 1e-9);
        assert_eq!(info.width, 1920);
        assert_eq!(info.sample_rate, 44100);
        assert!(info.has_audio());
        assert!(info.has_video());
    }

    #[test]
    fn test_parse_probe_still_image() {
        let raw = r#"{
            "format": {"size": "2048"},
            "streams": [
                {"codec_type": "video", "codec_name": "png", "width": 640, "height": 360}
            ]
        }"#;
        let probe: FfprobeOutput = serde_json::from_str(raw).unwrap();
        let info = parse_probe(probe).unwrap();
        assert_eq!(info.duration, 0.0);
        assert_eq!(info.width, 640);
        assert!(!info.has_audio());
    }

    #[test]
    fn test_parse_probe_no_streams_is_invalid() {
        let raw = r#"{"format": {}, "streams": []}"#;
        let probe: FfprobeOutput = serde_json::from_str(raw).unwrap();
        assert!(parse_probe(probe).is_err());
    }
}
