//! Image auto-fixer stage.
//!
//! Detects segments whose image is missing, unreadable or below the minimum
//! dimensions, searches the external image provider for a replacement using
//! keywords derived from segment context (LLM-extracted when configured,
//! deterministic otherwise), and falls back to a generated placeholder.
//! Isolated per segment: nothing here ever aborts the pipeline.

use std::path::PathBuf;

use async_trait::async_trait;
use reelkit_media::{probe_media, FfmpegCommand, FfmpegInput, FfmpegRunner};
use reelkit_models::{AssetRef, Job, Segment};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::context::{keys, PipelineContext};
use crate::engine::ContextStage;
use crate::error::PipelineResult;
use crate::llm::LlmClient;
use crate::metrics::warnings;
use crate::settings::Settings;
use crate::stages::download::fetch_single;

/// Replace broken segment images and publish `fixed_job`.
pub struct ImageAutoStage;

#[async_trait]
impl ContextStage for ImageAutoStage {
    async fn run(&self, ctx: &mut PipelineContext) -> PipelineResult<()> {
        let mut job: Job = ctx.get_cloned(keys::DOWNLOADED_JOB)?;

        if ctx.settings().ai.image_fix_enabled {
            let llm = LlmClient::from_settings(&ctx.settings().ai);
            let fixer = ImageFixer {
                settings: ctx.settings(),
                llm: llm.as_ref(),
            };

            let job_keywords = job.keywords.clone();
            let niche = job.niche.clone();
            for segment in &mut job.segments {
                fixer
                    .fix_segment(segment, &niche, &job_keywords, ctx)
                    .await;
            }
        }

        ctx.set(keys::FIXED_JOB, job)
    }
}

/// Structured keyword extraction result, validated and clamped after the
/// LLM call.
#[derive(Debug, Deserialize, JsonSchema)]
struct KeywordExtraction {
    /// 1-5 short search keywords, best first
    keywords: Vec<String>,
    /// The single most specific keyword
    primary_keyword: String,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

struct ImageFixer<'a> {
    settings: &'a Settings,
    llm: Option<&'a LlmClient>,
}

impl ImageFixer<'_> {
    /// Check and, when needed, replace one segment's image. Failures degrade
    /// to the placeholder; never raise.
    async fn fix_segment(
        &self,
        segment: &mut Segment,
        niche: &Option<String>,
        job_keywords: &[String],
        ctx: &PipelineContext,
    ) {
        // Video-backed segments never use the image
        if segment.video.is_some() {
            return;
        }
        if self.image_is_valid(segment).await {
            return;
        }
        if ctx.cancel().is_cancelled() {
            return;
        }

        let original_url = segment.image.as_ref().map(|i| i.url.clone());
        let prompt = search_prompt(segment, niche, job_keywords);
        info!(segment = %segment.id, prompt = %prompt, "image invalid, searching replacement");

        match self.search_and_fetch(&prompt, ctx).await {
            Some((url, path)) => {
                ctx.metrics().warning(warnings::IMAGE_SUBSTITUTED);
                debug!(
                    segment = %segment.id,
                    original = original_url.as_deref().unwrap_or("<none>"),
                    substitute = %url,
                    "image substituted"
                );
                segment.image = Some(AssetRef {
                    url,
                    local_path: Some(path),
                });
            }
            None => match self.placeholder(&segment.id, ctx).await {
                Some(path) => {
                    ctx.metrics().warning(warnings::IMAGE_PLACEHOLDER);
                    warn!(segment = %segment.id, "using placeholder image");
                    segment.image = Some(AssetRef {
                        url: format!("placeholder://{}", segment.id),
                        local_path: Some(path),
                    });
                }
                None => {
                    warn!(
                        segment = %segment.id,
                        "placeholder generation failed; leaving segment as-is"
                    );
                }
            },
        }
    }

    /// An image is valid when it resolves to a readable file with acceptable
    /// dimensions.
    async fn image_is_valid(&self, segment: &Segment) -> bool {
        let Some(path) = segment.image.as_ref().and_then(|i| i.local_path.clone()) else {
            return false;
        };
        match probe_media(&path).await {
            Ok(info) => {
                info.width >= self.settings.ai.min_image_width
                    && info.height >= self.settings.ai.min_image_height
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "image probe failed");
                false
            }
        }
    }

    /// Keyword chain -> provider search -> substitute download.
    async fn search_and_fetch(
        &self,
        prompt: &str,
        ctx: &PipelineContext,
    ) -> Option<(String, PathBuf)> {
        let endpoint = self.settings.ai.image_search_endpoint.as_deref()?;

        for keywords in self.keyword_candidates(prompt).await {
            if ctx.cancel().is_cancelled() {
                return None;
            }
            let Some(url) = self.search_provider(endpoint, &keywords).await else {
                continue;
            };
            match fetch_single(&url, ctx.scope().temp_dir(), self.settings).await {
                Ok(path) => return Some((url, path)),
                Err(e) => {
                    warn!(url = %url, error = %e, "substitute image download failed");
                }
            }
        }
        None
    }

    /// Keywords tried in order: LLM extraction when configured, then the
    /// deterministic chain, then the generic fallback.
    async fn keyword_candidates(&self, prompt: &str) -> Vec<String> {
        let mut candidates = Vec::new();

        if let Some(llm) = self.llm {
            match llm
                .structured::<KeywordExtraction>(
                    "You extract short, visual, concrete English keywords for stock photo search.",
                    &format!("Extract image search keywords for: {prompt}"),
                )
                .await
            {
                Ok(extraction) => {
                    candidates.extend(clamp_keywords(
                        extraction,
                        self.settings.ai.max_keywords,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "LLM keyword extraction failed, using fallback");
                }
            }
        }

        if candidates.is_empty() && !prompt.trim().is_empty() {
            candidates.push(prompt.trim().to_string());
        }
        candidates.push("abstract background".to_string());
        candidates
    }

    /// GET the provider; the first hit wins.
    async fn search_provider(&self, endpoint: &str, keywords: &str) -> Option<String> {
        let client = reqwest::Client::builder()
            .timeout(self.settings.download.timeout)
            .build()
            .ok()?;

        let mut request = client.get(endpoint).query(&[
            ("q", keywords),
            ("min_width", &self.settings.ai.min_image_width.to_string()),
            ("min_height", &self.settings.ai.min_image_height.to_string()),
        ]);
        if let Some(key) = &self.settings.ai.image_search_key {
            request = request.query(&[("key", key.as_str())]);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<SearchResponse>().await {
                    Ok(body) => body.hits.into_iter().map(|h| h.url).next(),
                    Err(e) => {
                        warn!(error = %e, "image search response unparsable");
                        None
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "image search returned an error");
                None
            }
            Err(e) => {
                warn!(error = %e, "image search request failed");
                None
            }
        }
    }

    /// Deterministic placeholder: a flat-color canvas at target dimensions.
    async fn placeholder(&self, segment_id: &str, ctx: &PipelineContext) -> Option<PathBuf> {
        let path = ctx
            .scope()
            .temp_path(&format!("placeholder_{segment_id}.png"));
        let spec = format!(
            "color=c=0x202833:s={}x{}",
            self.settings.video.width, self.settings.video.height
        );
        let cmd = FfmpegCommand::new(&path)
            .input(FfmpegInput::lavfi(spec))
            .single_frame();

        let runner = FfmpegRunner::new()
            .with_cancel(ctx.cancel().watch())
            .with_timeout(self.settings.subprocess_min_timeout);
        match runner.run(&cmd).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(error = %e, "placeholder render failed");
                None
            }
        }
    }
}

/// Prompt for the image search, derived from segment context.
fn search_prompt(segment: &Segment, niche: &Option<String>, job_keywords: &[String]) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(content) = segment.voice_over.as_ref().and_then(|vo| vo.content.as_ref()) {
        // First few words carry the topic
        let head: Vec<&str> = content.split_whitespace().take(12).collect();
        if !head.is_empty() {
            parts.push(head.join(" "));
        }
    }
    if let Some(niche) = niche {
        parts.push(niche.clone());
    }
    if !job_keywords.is_empty() {
        parts.push(job_keywords.join(" "));
    }

    if parts.is_empty() {
        "nature".to_string()
    } else {
        parts.join(" ")
    }
}

/// Deterministic repair of the LLM extraction: short, non-empty, primary
/// first, at most `max` entries.
fn clamp_keywords(extraction: KeywordExtraction, max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    let primary = extraction.primary_keyword.trim().to_string();
    if !primary.is_empty() {
        out.push(primary);
    }

    for keyword in extraction.keywords {
        let keyword = keyword.trim().to_string();
        if keyword.is_empty() || keyword.split_whitespace().count() > 3 || keyword.len() > 40 {
            continue;
        }
        if out.iter().any(|k| k.eq_ignore_ascii_case(&keyword)) {
            continue;
        }
        out.push(keyword);
        if out.len() >= max.max(1) {
            break;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_prompt_prefers_transcript() {
        let segment: Segment = serde_json::from_str(
            r#"{"id":"a","image":{"url":"http://ex/a.jpg"},
                "voice_over":{"url":"http://ex/a.mp3","content":"The quiet mountain valley at dawn"}}"#,
        )
        .unwrap();
        let prompt = search_prompt(&segment, &Some("travel".to_string()), &[]);
        assert!(prompt.contains("quiet mountain valley"));
        assert!(prompt.contains("travel"));
    }

    #[test]
    fn test_search_prompt_fallback() {
        let segment: Segment =
            serde_json::from_str(r#"{"id":"a","image":{"url":"http://ex/a.jpg"}}"#).unwrap();
        assert_eq!(search_prompt(&segment, &None, &[]), "nature");
    }

    #[test]
    fn test_clamp_keywords_limits_and_dedups() {
        let extraction = KeywordExtraction {
            keywords: vec![
                "Business".to_string(),
                "meeting".to_string(),
                "  ".to_string(),
                "a very long keyword phrase with too many words".to_string(),
                "office".to_string(),
                "teamwork".to_string(),
            ],
            primary_keyword: "business".to_string(),
        };
        let keywords = clamp_keywords(extraction, 3);
        assert_eq!(keywords.len(), 3);
        assert_eq!(keywords[0], "business");
        // Case-insensitive dedup against the primary
        assert!(!keywords[1..].iter().any(|k| k.eq_ignore_ascii_case("business")));
    }

    #[test]
    fn test_clamp_keywords_empty_extraction() {
        let extraction = KeywordExtraction {
            keywords: vec![],
            primary_keyword: "  ".to_string(),
        };
        assert!(clamp_keywords(extraction, 5).is_empty());
    }

    #[test]
    fn test_search_response_shape() {
        let body: SearchResponse =
            serde_json::from_str(r#"{"hits":[{"url":"http://img/1.jpg"},{"url":"http://img/2.jpg"}]}"#)
                .unwrap();
        assert_eq!(body.hits.len(), 2);
        assert_eq!(body.hits[0].url, "http://img/1.jpg");
    }
}
