//! Process configuration.
//!
//! One typed record loaded from the environment at startup, immutable
//! afterwards. Environment variables are the only configuration source;
//! every field has a default and an env name equal to its upper-cased name.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Read an env var, falling back to `default` on absence or parse failure.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Asset download limits.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub max_size_mb: u64,
    pub max_retries: u32,
    pub base_delay: Duration,
}

/// Output normalization targets.
#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: String,
    pub pix_fmt: String,
    pub preset: String,
    pub crf: u8,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    /// Fallback duration for image segments without voice-over, seconds
    pub default_segment_secs: f64,
}

/// Background-music behavior.
#[derive(Debug, Clone)]
pub struct AudioSettings {
    /// Base BGM gain; multiplied by the job's `background_music.volume`
    pub bgm_volume: f64,
    pub bgm_fade_in: f64,
    pub bgm_fade_out: f64,
    /// Loop the track to cover the video instead of ending early
    pub bgm_loop: bool,
    /// Auto-adjust BGM gain against measured program loudness
    pub bgm_auto_duck: bool,
}

/// Text overlay defaults.
#[derive(Debug, Clone)]
pub struct TextSettings {
    pub font: String,
    pub font_file: Option<String>,
    pub font_size: u32,
    pub font_color: String,
    pub position_x: String,
    pub position_y: String,
    pub fade_in: f64,
    pub fade_out: f64,
}

/// Concurrency and resource limits.
#[derive(Debug, Clone)]
pub struct PerformanceSettings {
    pub max_concurrent_segments: usize,
    /// Advisory memory budget; 0 = unlimited
    pub max_memory_mb: u64,
    /// Fail the render batch on any single segment failure
    pub strict_segments: bool,
}

/// Remote AI helpers: LLM, image search, forced aligner.
#[derive(Debug, Clone)]
pub struct AiSettings {
    /// Master switch for the LLM
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub max_keywords: usize,

    pub image_fix_enabled: bool,
    pub image_search_endpoint: Option<String>,
    pub image_search_key: Option<String>,
    pub min_image_width: u32,
    pub min_image_height: u32,

    pub align_enabled: bool,
    pub aligner_url: String,
    pub aligner_timeout: Duration,
    pub aligner_min_success_ratio: f64,
    pub aligner_max_retries: u32,
}

/// Blob storage target.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub enabled: bool,
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub key_prefix: String,
    pub public_base_url: Option<String>,
    pub upload_max_retries: u32,
    pub upload_timeout: Duration,
}

/// Application settings with environment variable support.
#[derive(Debug, Clone)]
pub struct Settings {
    pub download: DownloadSettings,
    pub video: VideoSettings,
    pub audio: AudioSettings,
    pub text: TextSettings,
    pub performance: PerformanceSettings,
    pub ai: AiSettings,
    pub storage: StorageSettings,

    /// Root for per-job temp scopes and retained outputs
    pub work_dir: PathBuf,
    pub cleanup_retry_attempts: u32,
    pub cleanup_retry_delay: Duration,

    /// Subprocess timeout = factor x expected duration, floored below
    pub subprocess_timeout_factor: f64,
    pub subprocess_min_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download: DownloadSettings {
                max_concurrent: 10,
                timeout: Duration::from_secs(30),
                max_size_mb: 100,
                max_retries: 3,
                base_delay: Duration::from_millis(250),
            },
            video: VideoSettings {
                width: 1920,
                height: 1080,
                fps: 24,
                codec: "libx264".to_string(),
                pix_fmt: "yuv420p".to_string(),
                preset: "veryfast".to_string(),
                crf: 23,
                audio_codec: "aac".to_string(),
                audio_bitrate: "192k".to_string(),
                audio_sample_rate: 44100,
                audio_channels: 2,
                default_segment_secs: 5.0,
            },
            audio: AudioSettings {
                bgm_volume: 0.2,
                bgm_fade_in: 0.0,
                bgm_fade_out: 0.0,
                bgm_loop: false,
                bgm_auto_duck: true,
            },
            text: TextSettings {
                font: "DejaVuSans".to_string(),
                font_file: None,
                font_size: 48,
                font_color: "white".to_string(),
                position_x: "(w-text_w)/2".to_string(),
                position_y: "h-text_h-80".to_string(),
                fade_in: 0.3,
                fade_out: 0.3,
            },
            performance: PerformanceSettings {
                max_concurrent_segments: 4,
                max_memory_mb: 0,
                strict_segments: false,
            },
            ai: AiSettings {
                enabled: false,
                endpoint: None,
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                max_keywords: 5,
                image_fix_enabled: true,
                image_search_endpoint: None,
                image_search_key: None,
                min_image_width: 640,
                min_image_height: 360,
                align_enabled: true,
                aligner_url: "http://localhost:8765/transcriptions".to_string(),
                aligner_timeout: Duration::from_secs(300),
                aligner_min_success_ratio: 0.8,
                aligner_max_retries: 3,
            },
            storage: StorageSettings {
                enabled: false,
                bucket: String::new(),
                region: "auto".to_string(),
                endpoint_url: None,
                access_key_id: String::new(),
                secret_access_key: String::new(),
                key_prefix: "videos/".to_string(),
                public_base_url: None,
                upload_max_retries: 3,
                upload_timeout: Duration::from_secs(300),
            },
            work_dir: PathBuf::from("/tmp/reelkit"),
            cleanup_retry_attempts: 3,
            cleanup_retry_delay: Duration::from_millis(500),
            subprocess_timeout_factor: 10.0,
            subprocess_min_timeout: Duration::from_secs(60),
        }
    }
}

impl Settings {
    /// Create settings from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            download: DownloadSettings {
                max_concurrent: env_parse("DOWNLOAD_MAX_CONCURRENT", d.download.max_concurrent),
                timeout: Duration::from_secs(env_parse("DOWNLOAD_TIMEOUT_SECS", 30)),
                max_size_mb: env_parse("DOWNLOAD_MAX_SIZE_MB", d.download.max_size_mb),
                max_retries: env_parse("DOWNLOAD_MAX_RETRIES", d.download.max_retries),
                base_delay: Duration::from_millis(env_parse("DOWNLOAD_BASE_DELAY_MS", 250)),
            },
            video: VideoSettings {
                width: env_parse("VIDEO_WIDTH", d.video.width),
                height: env_parse("VIDEO_HEIGHT", d.video.height),
                fps: env_parse("VIDEO_FPS", d.video.fps),
                codec: env_string("VIDEO_CODEC", &d.video.codec),
                pix_fmt: env_string("VIDEO_PIX_FMT", &d.video.pix_fmt),
                preset: env_string("VIDEO_PRESET", &d.video.preset),
                crf: env_parse("VIDEO_CRF", d.video.crf),
                audio_codec: env_string("VIDEO_AUDIO_CODEC", &d.video.audio_codec),
                audio_bitrate: env_string("VIDEO_AUDIO_BITRATE", &d.video.audio_bitrate),
                audio_sample_rate: env_parse("VIDEO_AUDIO_SAMPLE_RATE", d.video.audio_sample_rate),
                audio_channels: env_parse("VIDEO_AUDIO_CHANNELS", d.video.audio_channels),
                default_segment_secs: env_parse(
                    "VIDEO_DEFAULT_SEGMENT_SECS",
                    d.video.default_segment_secs,
                ),
            },
            audio: AudioSettings {
                bgm_volume: env_parse("AUDIO_BGM_VOLUME", d.audio.bgm_volume),
                bgm_fade_in: env_parse("AUDIO_BGM_FADE_IN", d.audio.bgm_fade_in),
                bgm_fade_out: env_parse("AUDIO_BGM_FADE_OUT", d.audio.bgm_fade_out),
                bgm_loop: env_parse("AUDIO_BGM_LOOP", d.audio.bgm_loop),
                bgm_auto_duck: env_parse("AUDIO_BGM_AUTO_DUCK", d.audio.bgm_auto_duck),
            },
            text: TextSettings {
                font: env_string("TEXT_FONT", &d.text.font),
                font_file: env_opt("TEXT_FONT_FILE"),
                font_size: env_parse("TEXT_FONT_SIZE", d.text.font_size),
                font_color: env_string("TEXT_FONT_COLOR", &d.text.font_color),
                position_x: env_string("TEXT_POSITION_X", &d.text.position_x),
                position_y: env_string("TEXT_POSITION_Y", &d.text.position_y),
                fade_in: env_parse("TEXT_FADE_IN", d.text.fade_in),
                fade_out: env_parse("TEXT_FADE_OUT", d.text.fade_out),
            },
            performance: PerformanceSettings {
                max_concurrent_segments: env_parse(
                    "PERFORMANCE_MAX_CONCURRENT_SEGMENTS",
                    d.performance.max_concurrent_segments,
                ),
                max_memory_mb: env_parse("PERFORMANCE_MAX_MEMORY_MB", d.performance.max_memory_mb),
                strict_segments: env_parse(
                    "PERFORMANCE_STRICT_SEGMENTS",
                    d.performance.strict_segments,
                ),
            },
            ai: AiSettings {
                enabled: env_parse("AI_ENABLED", d.ai.enabled),
                endpoint: env_opt("AI_ENDPOINT"),
                api_key: env_opt("AI_API_KEY"),
                model: env_string("AI_MODEL", &d.ai.model),
                max_keywords: env_parse("AI_MAX_KEYWORDS", d.ai.max_keywords),
                image_fix_enabled: env_parse("AI_IMAGE_FIX_ENABLED", d.ai.image_fix_enabled),
                image_search_endpoint: env_opt("AI_IMAGE_SEARCH_ENDPOINT"),
                image_search_key: env_opt("AI_IMAGE_SEARCH_KEY"),
                min_image_width: env_parse("AI_MIN_IMAGE_WIDTH", d.ai.min_image_width),
                min_image_height: env_parse("AI_MIN_IMAGE_HEIGHT", d.ai.min_image_height),
                align_enabled: env_parse("AI_ALIGN_ENABLED", d.ai.align_enabled),
                aligner_url: env_string("AI_ALIGNER_URL", &d.ai.aligner_url),
                aligner_timeout: Duration::from_secs(env_parse("AI_ALIGNER_TIMEOUT_SECS", 300)),
                aligner_min_success_ratio: env_parse(
                    "AI_ALIGNER_MIN_SUCCESS_RATIO",
                    d.ai.aligner_min_success_ratio,
                ),
                aligner_max_retries: env_parse("AI_ALIGNER_MAX_RETRIES", d.ai.aligner_max_retries),
            },
            storage: StorageSettings {
                enabled: env_parse("STORAGE_ENABLED", d.storage.enabled),
                bucket: env_string("STORAGE_BUCKET", ""),
                region: env_string("STORAGE_REGION", &d.storage.region),
                endpoint_url: env_opt("STORAGE_ENDPOINT_URL"),
                access_key_id: env_string("STORAGE_ACCESS_KEY_ID", ""),
                secret_access_key: env_string("STORAGE_SECRET_ACCESS_KEY", ""),
                key_prefix: env_string("STORAGE_KEY_PREFIX", &d.storage.key_prefix),
                public_base_url: env_opt("STORAGE_PUBLIC_BASE_URL"),
                upload_max_retries: env_parse(
                    "STORAGE_UPLOAD_MAX_RETRIES",
                    d.storage.upload_max_retries,
                ),
                upload_timeout: Duration::from_secs(env_parse("STORAGE_UPLOAD_TIMEOUT_SECS", 300)),
            },
            work_dir: PathBuf::from(env_string("WORK_DIR", "/tmp/reelkit")),
            cleanup_retry_attempts: env_parse(
                "CLEANUP_RETRY_ATTEMPTS",
                d.cleanup_retry_attempts,
            ),
            cleanup_retry_delay: Duration::from_millis(env_parse("CLEANUP_RETRY_DELAY_MS", 500)),
            subprocess_timeout_factor: env_parse(
                "SUBPROCESS_TIMEOUT_FACTOR",
                d.subprocess_timeout_factor,
            ),
            subprocess_min_timeout: Duration::from_secs(env_parse(
                "SUBPROCESS_MIN_TIMEOUT_SECS",
                60,
            )),
        }
    }

    /// Encoding target derived from the video group.
    pub fn encode_target(&self) -> reelkit_media::EncodeTarget {
        reelkit_media::EncodeTarget {
            video_codec: self.video.codec.clone(),
            preset: self.video.preset.clone(),
            crf: self.video.crf,
            pix_fmt: self.video.pix_fmt.clone(),
            fps: self.video.fps,
            audio_codec: self.video.audio_codec.clone(),
            audio_bitrate: self.video.audio_bitrate.clone(),
            sample_rate: self.video.audio_sample_rate,
            channels: self.video.audio_channels,
        }
    }

    /// Subprocess timeout for work with a known expected duration.
    pub fn subprocess_timeout(&self, expected_secs: f64) -> Duration {
        let scaled = Duration::from_secs_f64(
            (expected_secs.max(0.0) * self.subprocess_timeout_factor).max(1.0),
        );
        scaled.max(self.subprocess_min_timeout)
    }

    /// Drawtext defaults for the text group.
    pub fn drawtext_defaults(&self) -> reelkit_media::filters::DrawtextDefaults {
        reelkit_media::filters::DrawtextDefaults {
            font: self.text.font.clone(),
            font_file: self.text.font_file.clone(),
            size: self.text.font_size,
            color: self.text.font_color.clone(),
            position_x: self.text.position_x.clone(),
            position_y: self.text.position_y.clone(),
            fade_in: self.text.fade_in,
            fade_out: self.text.fade_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.video.width, 1920);
        assert_eq!(s.video.fps, 24);
        assert_eq!(s.download.max_concurrent, 10);
        assert_eq!(s.performance.max_concurrent_segments, 4);
        assert!(!s.storage.enabled);
        assert!(s.ai.align_enabled);
    }

    #[test]
    fn test_subprocess_timeout_scaling() {
        let s = Settings::default();
        // Short work hits the floor
        assert_eq!(s.subprocess_timeout(1.0), Duration::from_secs(60));
        // Long work scales by the factor
        assert_eq!(s.subprocess_timeout(30.0), Duration::from_secs(300));
    }

    #[test]
    fn test_encode_target_mirrors_video_group() {
        let s = Settings::default();
        let target = s.encode_target();
        assert_eq!(target.video_codec, "libx264");
        assert_eq!(target.sample_rate, 44100);
        assert_eq!(target.fps, 24);
    }
}
