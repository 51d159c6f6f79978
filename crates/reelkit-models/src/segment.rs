//! Segment model: one ordered slice of the output video.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::asset::AssetRef;
use crate::overlay::TextOverlay;
use crate::transition::Transition;

/// Voice-over audio bound to a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VoiceOver {
    #[serde(flatten)]
    pub audio: AssetRef,

    /// Transcript text; enables timed text overlays via forced alignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Leading silence in seconds, >= 0
    #[serde(default)]
    pub start_delay: f64,

    /// Trailing silence in seconds, >= 0
    #[serde(default)]
    pub end_delay: f64,
}

/// The visual asset a segment renders, after the video-wins rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentVisual<'a> {
    Image(&'a AssetRef),
    Video(&'a AssetRef),
}

/// One ordered slice of the output, binding a visual to optional voice,
/// text and transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Segment {
    /// Non-empty, unique within the job
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<AssetRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<AssetRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_over: Option<VoiceOver>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_over: Vec<TextOverlay>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_in: Option<Transition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_out: Option<Transition>,
}

impl Segment {
    /// The visual this segment renders. Video wins when both are present.
    pub fn visual(&self) -> Option<SegmentVisual<'_>> {
        if let Some(video) = &self.video {
            Some(SegmentVisual::Video(video))
        } else {
            self.image.as_ref().map(SegmentVisual::Image)
        }
    }

    /// Total transition lead-in duration in seconds.
    pub fn transition_in_duration(&self) -> f64 {
        self.transition_in
            .as_ref()
            .map(Transition::added_duration)
            .unwrap_or(0.0)
    }

    /// Total transition tail duration in seconds.
    pub fn transition_out_duration(&self) -> f64 {
        self.transition_out
            .as_ref()
            .map(Transition::added_duration)
            .unwrap_or(0.0)
    }

    /// Every asset reference in this segment, mutably.
    pub fn asset_refs_mut(&mut self) -> Vec<&mut AssetRef> {
        let mut refs = Vec::new();
        if let Some(image) = self.image.as_mut() {
            refs.push(image);
        }
        if let Some(video) = self.video.as_mut() {
            refs.push(video);
        }
        if let Some(vo) = self.voice_over.as_mut() {
            refs.push(&mut vo.audio);
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_json(body: &str) -> Segment {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_video_wins_over_image() {
        let seg = segment_json(
            r#"{"id":"s1","image":{"url":"http://ex/a.jpg"},"video":{"url":"http://ex/a.mp4"}}"#,
        );
        assert!(matches!(seg.visual(), Some(SegmentVisual::Video(_))));
    }

    #[test]
    fn test_image_only() {
        let seg = segment_json(r#"{"id":"s1","image":{"url":"http://ex/a.jpg"}}"#);
        assert!(matches!(seg.visual(), Some(SegmentVisual::Image(_))));
    }

    #[test]
    fn test_no_visual() {
        let seg = segment_json(r#"{"id":"s1"}"#);
        assert!(seg.visual().is_none());
    }

    #[test]
    fn test_voice_over_flattened_url() {
        let seg = segment_json(
            r#"{"id":"s1","voice_over":{"url":"http://ex/a.mp3","content":"hi","start_delay":0.5}}"#,
        );
        let vo = seg.voice_over.unwrap();
        assert_eq!(vo.audio.url, "http://ex/a.mp3");
        assert_eq!(vo.content.as_deref(), Some("hi"));
        assert!((vo.start_delay - 0.5).abs() < f64::EPSILON);
        assert_eq!(vo.end_delay, 0.0);
    }

    #[test]
    fn test_asset_refs_mut_covers_all() {
        let mut seg = segment_json(
            r#"{"id":"s1","image":{"url":"http://ex/a.jpg"},"voice_over":{"url":"http://ex/a.mp3"}}"#,
        );
        assert_eq!(seg.asset_refs_mut().len(), 2);
    }
}
