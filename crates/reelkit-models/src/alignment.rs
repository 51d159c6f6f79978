//! Forced-alignment records.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome reported by the aligner for one word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AlignmentCase {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "not-found-in-audio")]
    NotFoundInAudio,
    #[serde(other)]
    Other,
}

impl Default for AlignmentCase {
    fn default() -> Self {
        Self::Other
    }
}

/// One word with its time range, as returned by the forced aligner.
/// Unknown response fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AlignedWord {
    pub word: String,

    #[serde(default)]
    pub start: Option<f64>,

    #[serde(default)]
    pub end: Option<f64>,

    #[serde(default)]
    pub case: AlignmentCase,
}

impl AlignedWord {
    /// Whether the aligner produced usable timing for this word.
    pub fn is_aligned(&self) -> bool {
        self.case == AlignmentCase::Success && self.start.is_some() && self.end.is_some()
    }
}

/// A display span with resolved timing, the aligner stage's product before
/// conversion into text overlays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TimedSpan {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl TimedSpan {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
        }
    }
}
