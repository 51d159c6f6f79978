//! Rendered intermediate clips.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::transition::TransitionKind;

/// Normalized stream parameters of an intermediate clip.
///
/// The concatenator compares these across clips to decide whether stream-copy
/// concatenation is possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClipFormat {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u32,
}

impl ClipFormat {
    /// Whether two clips can be joined without re-encoding.
    pub fn matches(&self, other: &ClipFormat) -> bool {
        self.width == other.width
            && self.height == other.height
            && (self.fps - other.fps).abs() < 0.01
            && self.video_codec == other.video_codec
            && self.audio_codec == other.audio_codec
            && self.sample_rate == other.sample_rate
            && self.channels == other.channels
    }
}

/// Product of the segment renderer: one normalized MP4 plus the metadata the
/// concatenator needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenderedClip {
    /// Position of the source segment in the job; the concatenator consumes
    /// clips by this index.
    pub index: usize,

    pub segment_id: String,

    pub path: PathBuf,

    /// Effective duration in seconds (content + additive transitions)
    pub duration: f64,

    pub has_audio: bool,

    /// Transition kind baked into the clip head, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_in_applied: Option<TransitionKind>,

    /// Transition kind baked into the clip tail, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_out_applied: Option<TransitionKind>,

    pub format: ClipFormat,
}

impl RenderedClip {
    /// Whether both clip boundaries are clean cuts (no baked filter).
    pub fn has_clean_boundaries(&self) -> bool {
        let clean = |t: &Option<TransitionKind>| match t {
            None => true,
            Some(kind) => kind.effective().is_cut(),
        };
        clean(&self.transition_in_applied) && clean(&self.transition_out_applied)
    }
}
