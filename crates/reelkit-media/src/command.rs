//! FFmpeg command builder and runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// Number of trailing stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 40;

/// One `-i` input with its preceding arguments.
#[derive(Debug, Clone)]
pub struct FfmpegInput {
    /// Arguments placed before this input's `-i`
    args: Vec<String>,
    /// Input source: a path or a lavfi graph spec
    source: String,
}

impl FfmpegInput {
    /// A plain file input.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            args: Vec::new(),
            source: path.as_ref().to_string_lossy().into_owned(),
        }
    }

    /// A still image looped into a constant-rate stream (`-loop 1`).
    pub fn looped_image(path: impl AsRef<Path>) -> Self {
        Self::file(path).with_args(["-loop", "1"])
    }

    /// A generated source via the lavfi device, e.g. `anullsrc=...`.
    pub fn lavfi(spec: impl Into<String>) -> Self {
        Self {
            args: vec!["-f".to_string(), "lavfi".to_string()],
            source: spec.into(),
        }
    }

    /// A file input looped indefinitely (`-stream_loop -1`), trimmed later.
    pub fn stream_looped(path: impl AsRef<Path>) -> Self {
        Self::file(path).with_args(["-stream_loop", "-1"])
    }

    /// Add arguments placed ahead of this input's `-i`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Builder for FFmpeg invocations with any number of inputs.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<FfmpegInput>,
    output: PathBuf,
    /// Arguments placed after the inputs, before the output path
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    /// Create a command writing to `output`.
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Add an input.
    pub fn input(mut self, input: FfmpegInput) -> Self {
        self.inputs.push(input);
        self
    }

    /// Add an output argument.
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the video filter chain (`-vf`).
    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    /// Set the audio filter chain (`-af`).
    pub fn audio_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-af").output_arg(filter)
    }

    /// Set a filter-complex graph.
    pub fn filter_complex(self, graph: impl Into<String>) -> Self {
        self.output_arg("-filter_complex").output_arg(graph)
    }

    /// Map a stream specifier into the output.
    pub fn map(self, spec: impl Into<String>) -> Self {
        self.output_arg("-map").output_arg(spec)
    }

    /// Cap the output duration (`-t`).
    pub fn duration(self, seconds: f64) -> Self {
        self.output_arg("-t").output_arg(format!("{:.3}", seconds))
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    /// Set audio codec.
    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    /// Stream-copy both streams.
    pub fn copy_streams(self) -> Self {
        self.output_arg("-c").output_arg("copy")
    }

    /// Set pixel format.
    pub fn pix_fmt(self, fmt: impl Into<String>) -> Self {
        self.output_arg("-pix_fmt").output_arg(fmt)
    }

    /// Set output frame rate.
    pub fn fps(self, fps: u32) -> Self {
        self.output_arg("-r").output_arg(fps.to_string())
    }

    /// Set encoder preset.
    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Set CRF quality.
    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    /// Set audio bitrate, e.g. "192k".
    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    /// Set audio sample rate.
    pub fn audio_rate(self, rate: u32) -> Self {
        self.output_arg("-ar").output_arg(rate.to_string())
    }

    /// Set audio channel count.
    pub fn audio_channels(self, channels: u32) -> Self {
        self.output_arg("-ac").output_arg(channels.to_string())
    }

    /// Stop writing at the end of the shortest stream.
    pub fn shortest(self) -> Self {
        self.output_arg("-shortest")
    }

    /// Extract a single frame.
    pub fn single_frame(self) -> Self {
        self.output_arg("-frames:v").output_arg("1")
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Output path of this command.
    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Build the full argument vector.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        for input in &self.inputs {
            args.extend(input.args.iter().cloned());
            args.push("-i".to_string());
            args.push(input.source.clone());
        }

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().into_owned());

        args
    }
}

/// Runner for FFmpeg commands with cancellation and timeout.
pub struct FfmpegRunner {
    cancel_rx: Option<watch::Receiver<bool>>,
    timeout: Option<Duration>,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self {
            cancel_rx: None,
            timeout: None,
        }
    }

    /// Observe a cancellation signal; the child is killed when it fires.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    /// Kill the child and fail after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run an FFmpeg command to completion.
    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)?;

        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Collect the stderr tail for error reporting
        let stderr = child.stderr.take().expect("stderr not captured");
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() >= STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail
        });

        let status = self.wait_for_exit(&mut child).await;
        let tail = stderr_task.await.unwrap_or_default();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(MediaError::ffmpeg_failed(
                "FFmpeg exited with non-zero status",
                Some(tail.join("\n")),
                status.code(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_exit(
        &self,
        child: &mut tokio::process::Child,
    ) -> MediaResult<std::process::ExitStatus> {
        // A day is effectively unbounded for a single ffmpeg invocation
        let timeout = self.timeout.unwrap_or(Duration::from_secs(24 * 60 * 60));
        let mut cancel_rx = self.cancel_rx.clone();

        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = tokio::time::sleep(timeout) => {
                warn!("FFmpeg timed out after {:?}, killing process", timeout);
                let _ = child.kill().await;
                Err(MediaError::Timeout(timeout.as_secs()))
            }
            _ = wait_cancelled(&mut cancel_rx) => {
                info!("FFmpeg cancelled, killing process");
                let _ = child.kill().await;
                Err(MediaError::Cancelled)
            }
        }
    }
}

/// Resolve once the cancel channel reads true; pend forever without one.
async fn wait_cancelled(cancel_rx: &mut Option<watch::Receiver<bool>>) {
    match cancel_rx {
        Some(rx) => {
            if *rx.borrow() {
                return;
            }
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            // Sender dropped without cancelling; never resolve
            std::future::pending::<()>().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Check that FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check that FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_input_order() {
        let cmd = FfmpegCommand::new("out.mp4")
            .input(FfmpegInput::file("in.mp4"))
            .video_codec("libx264")
            .crf(23);

        let args = cmd.build_args();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "in.mp4");
        assert!(args.contains(&"-c:v".to_string()));
        assert!(args.contains(&"23".to_string()));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn test_input_args_precede_their_input() {
        let cmd = FfmpegCommand::new("out.mp4")
            .input(FfmpegInput::looped_image("bg.png"))
            .input(FfmpegInput::lavfi("anullsrc=channel_layout=stereo:sample_rate=44100"));

        let args = cmd.build_args();
        let loop_pos = args.iter().position(|a| a == "-loop").unwrap();
        let first_i = args.iter().position(|a| a == "-i").unwrap();
        assert!(loop_pos < first_i);
        assert_eq!(args[first_i + 1], "bg.png");

        let lavfi_pos = args.iter().position(|a| a == "lavfi").unwrap();
        assert!(lavfi_pos > first_i);
    }

    #[test]
    fn test_duration_formatting() {
        let cmd = FfmpegCommand::new("out.mp4")
            .input(FfmpegInput::file("in.mp4"))
            .duration(3.5);
        let args = cmd.build_args();
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "3.500");
    }

    #[test]
    fn test_stream_copy() {
        let cmd = FfmpegCommand::new("out.mp4")
            .input(FfmpegInput::file("list.txt").with_args(["-f", "concat", "-safe", "0"]))
            .copy_streams();
        let args = cmd.build_args();
        let c = args.iter().position(|a| a == "-c").unwrap();
        assert_eq!(args[c + 1], "copy");
        assert!(args.contains(&"concat".to_string()));
    }
}
