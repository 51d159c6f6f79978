//! The input job document.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asset::AssetRef;
use crate::segment::Segment;

/// Unique identifier for a composition job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global background-music track mixed under the whole composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BackgroundMusic {
    #[serde(flatten)]
    pub audio: AssetRef,

    /// Gain applied to the track, 0..=2
    #[serde(default = "default_bgm_volume")]
    pub volume: f64,

    /// Fade-in at the head of the mix, seconds
    #[serde(default)]
    pub fade_in: f64,

    /// Fade-out at the tail of the mix, seconds
    #[serde(default)]
    pub fade_out: f64,
}

fn default_bgm_volume() -> f64 {
    1.0
}

/// A validated composition request: an ordered list of segments plus the
/// optional background music and informational metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Job ID; generated when the document does not carry one
    #[serde(default)]
    pub id: JobId,

    /// Ordered, non-empty
    pub segments: Vec<Segment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_music: Option<BackgroundMusic>,

    // Informational metadata; feeds image-search prompts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub niche: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Job {
    /// Every asset reference in the job, mutably (segments first, BGM last).
    pub fn asset_refs_mut(&mut self) -> Vec<&mut AssetRef> {
        let mut refs: Vec<&mut AssetRef> = Vec::new();
        for segment in &mut self.segments {
            refs.extend(segment.asset_refs_mut());
        }
        if let Some(bgm) = self.background_music.as_mut() {
            refs.push(&mut bgm.audio);
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_job_parses() {
        let job: Job = serde_json::from_str(
            r#"{"segments":[{"id":"only","image":{"url":"http://ex/a.jpg"}}]}"#,
        )
        .unwrap();
        assert_eq!(job.segments.len(), 1);
        assert!(!job.id.as_str().is_empty());
        assert!(job.background_music.is_none());
    }

    #[test]
    fn test_bgm_defaults() {
        let job: Job = serde_json::from_str(
            r#"{
                "segments":[{"id":"s","image":{"url":"http://ex/a.jpg"}}],
                "background_music":{"url":"http://ex/bgm.mp3","volume":0.5,"fade_in":1.0}
            }"#,
        )
        .unwrap();
        let bgm = job.background_music.unwrap();
        assert_eq!(bgm.audio.url, "http://ex/bgm.mp3");
        assert!((bgm.volume - 0.5).abs() < f64::EPSILON);
        assert!((bgm.fade_in - 1.0).abs() < f64::EPSILON);
        assert_eq!(bgm.fade_out, 0.0);
    }

    #[test]
    fn test_asset_refs_cover_segments_and_bgm() {
        let mut job: Job = serde_json::from_str(
            r#"{
                "segments":[
                    {"id":"a","image":{"url":"http://ex/a.jpg"},"voice_over":{"url":"http://ex/a.mp3"}},
                    {"id":"b","video":{"url":"http://ex/b.mp4"}}
                ],
                "background_music":{"url":"http://ex/bgm.mp3"}
            }"#,
        )
        .unwrap();
        assert_eq!(job.asset_refs_mut().len(), 4);
    }
}
