//! Forced-aligner HTTP client.
//!
//! POSTs multipart `{audio, transcript}` and parses per-word timestamps.
//! Unknown response fields are ignored. Alignment quality below the
//! configured success ratio counts as a failure, which the stage treats the
//! same as an outage: uniform fallback.

use std::path::Path;

use reelkit_models::AlignedWord;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::retry::{retry_async, RetryConfig};
use crate::settings::AiSettings;

#[derive(Debug, Deserialize)]
struct AlignerResponse {
    #[serde(default)]
    words: Vec<AlignedWord>,
}

/// Alignment quality figures, logged and used for the ratio gate.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentStats {
    pub total_words: usize,
    pub aligned_words: usize,
}

impl AlignmentStats {
    pub fn success_ratio(&self) -> f64 {
        if self.total_words == 0 {
            0.0
        } else {
            self.aligned_words as f64 / self.total_words as f64
        }
    }
}

/// Client for the forced-alignment service.
pub struct AlignerClient {
    url: String,
    timeout: std::time::Duration,
    min_success_ratio: f64,
    retry: RetryConfig,
}

impl AlignerClient {
    pub fn new(ai: &AiSettings) -> Self {
        Self {
            url: ai.aligner_url.clone(),
            timeout: ai.aligner_timeout,
            min_success_ratio: ai.aligner_min_success_ratio,
            retry: RetryConfig::new("forced_alignment")
                .with_max_retries(ai.aligner_max_retries),
        }
    }

    /// Align an audio file against its transcript; returns the word stream
    /// when quality passes the ratio gate.
    pub async fn align(
        &self,
        audio_path: &Path,
        transcript: &str,
    ) -> PipelineResult<(Vec<AlignedWord>, AlignmentStats)> {
        let audio_bytes = tokio::fs::read(audio_path).await.map_err(|e| {
            PipelineError::with_source(
                "align_text",
                ErrorKind::Asset,
                format!("voice-over unreadable: {}", audio_path.display()),
                e,
            )
        })?;

        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        let words = retry_async(&self.retry, || {
            self.post_alignment(audio_bytes.clone(), file_name.clone(), transcript)
        })
        .await?;

        let stats = AlignmentStats {
            total_words: words.len(),
            aligned_words: words.iter().filter(|w| w.is_aligned()).count(),
        };

        info!(
            total = stats.total_words,
            aligned = stats.aligned_words,
            ratio = stats.success_ratio(),
            "forced alignment completed"
        );

        if stats.success_ratio() < self.min_success_ratio {
            return Err(PipelineError::new(
                "align_text",
                ErrorKind::Processing,
                format!(
                    "alignment success ratio {:.2} below the {:.2} threshold",
                    stats.success_ratio(),
                    self.min_success_ratio
                ),
            ));
        }

        Ok((words, stats))
    }

    async fn post_alignment(
        &self,
        audio_bytes: Vec<u8>,
        file_name: String,
        transcript: &str,
    ) -> PipelineResult<Vec<AlignedWord>> {
        debug!(url = %self.url, transcript_chars = transcript.len(), "posting alignment request");

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| {
                PipelineError::with_source("align_text", ErrorKind::Processing, "client build", e)
            })?;

        let form = reqwest::multipart::Form::new()
            .part(
                "audio",
                reqwest::multipart::Part::bytes(audio_bytes)
                    .file_name(file_name)
                    .mime_str("audio/mpeg")
                    .map_err(|e| {
                        PipelineError::with_source(
                            "align_text",
                            ErrorKind::Processing,
                            "mime setup",
                            e,
                        )
                    })?,
            )
            .text("transcript", transcript.to_string());

        let response = client
            .post(format!("{}?async=false", self.url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                PipelineError::with_source(
                    "align_text",
                    ErrorKind::Download,
                    "aligner unreachable",
                    e,
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::new(
                "align_text",
                ErrorKind::Download,
                format!("aligner returned {status}"),
            ));
        }

        let body: AlignerResponse = response.json().await.map_err(|e| {
            PipelineError::with_source(
                "align_text",
                ErrorKind::Processing,
                "aligner response unparsable",
                e,
            )
        })?;

        Ok(body.words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_ratio() {
        let stats = AlignmentStats {
            total_words: 10,
            aligned_words: 8,
        };
        assert!((stats.success_ratio() - 0.8).abs() < 1e-9);

        let empty = AlignmentStats {
            total_words: 0,
            aligned_words: 0,
        };
        assert_eq!(empty.success_ratio(), 0.0);
    }

    #[test]
    fn test_response_ignores_unknown_fields() {
        let raw = r#"{
            "transcript": "hello world",
            "words": [
                {"word":"hello","start":0.1,"end":0.4,"case":"success","phones":[{"p":"hh"}]},
                {"word":"world","case":"not-found-in-audio"}
            ]
        }"#;
        let body: AlignerResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(body.words.len(), 2);
        assert!(body.words[0].is_aligned());
        assert!(!body.words[1].is_aligned());
    }
}
