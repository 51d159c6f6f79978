//! Segment transition types.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Supported transition kinds.
///
/// Unknown names are preserved as [`TransitionKind::Other`] so the pipeline
/// can degrade them to a basic fade with a warning instead of rejecting the
/// job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, JsonSchema)]
pub enum TransitionKind {
    Fade,
    FadeBlack,
    FadeWhite,
    Cut,
    /// Anything else; degrades to `Fade` at render time.
    Other(String),
}

impl TransitionKind {
    /// Parse a transition name; never fails.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "fade" => Self::Fade,
            "fadeblack" => Self::FadeBlack,
            "fadewhite" => Self::FadeWhite,
            "cut" => Self::Cut,
            _ => Self::Other(name.to_string()),
        }
    }

    /// The kind actually applied at render time (degrade, never reject).
    pub fn effective(&self) -> Self {
        match self {
            Self::Other(_) => Self::Fade,
            other => other.clone(),
        }
    }

    /// Whether this kind is in the supported set.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    pub fn is_cut(&self) -> bool {
        matches!(self, Self::Cut)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Fade => "fade",
            Self::FadeBlack => "fadeblack",
            Self::FadeWhite => "fadewhite",
            Self::Cut => "cut",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for TransitionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TransitionKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}

/// A transition at the head or tail of a segment.
///
/// Transitions are additive: their duration extends the hosting segment and
/// never overlaps a neighbor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Transition {
    #[serde(rename = "type")]
    pub kind: TransitionKind,

    /// Duration in seconds, >= 0
    #[serde(default)]
    pub duration: f64,
}

impl Transition {
    pub fn new(kind: TransitionKind, duration: f64) -> Self {
        Self { kind, duration }
    }

    /// Duration contributed to the clip timeline. A `cut` never extends the
    /// segment.
    pub fn added_duration(&self) -> f64 {
        if self.kind.effective().is_cut() {
            0.0
        } else {
            self.duration.max(0.0)
        }
    }

    /// Whether this transition draws any filter at all.
    pub fn is_noop(&self) -> bool {
        self.kind.effective().is_cut() || self.duration <= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_kinds() {
        assert_eq!(TransitionKind::parse("fade"), TransitionKind::Fade);
        assert_eq!(TransitionKind::parse("FADEBLACK"), TransitionKind::FadeBlack);
        assert_eq!(TransitionKind::parse("fadewhite"), TransitionKind::FadeWhite);
        assert_eq!(TransitionKind::parse("cut"), TransitionKind::Cut);
    }

    #[test]
    fn test_unknown_kind_degrades() {
        let kind = TransitionKind::parse("dissolve");
        assert!(!kind.is_supported());
        assert_eq!(kind.effective(), TransitionKind::Fade);
        assert_eq!(kind.as_str(), "dissolve");
    }

    #[test]
    fn test_deserialize_from_job_document() {
        let t: Transition = serde_json::from_str(r#"{"type":"fade","duration":0.5}"#).unwrap();
        assert_eq!(t.kind, TransitionKind::Fade);
        assert!((t.duration - 0.5).abs() < f64::EPSILON);

        let t: Transition = serde_json::from_str(r#"{"type":"zoom","duration":1.0}"#).unwrap();
        assert_eq!(t.kind, TransitionKind::Other("zoom".to_string()));
        assert_eq!(t.kind.effective(), TransitionKind::Fade);
    }

    #[test]
    fn test_cut_adds_no_duration() {
        let t = Transition::new(TransitionKind::Cut, 2.0);
        assert_eq!(t.added_duration(), 0.0);
        assert!(t.is_noop());

        let t = Transition::new(TransitionKind::Fade, 0.5);
        assert!((t.added_duration() - 0.5).abs() < f64::EPSILON);
        assert!(!t.is_noop());
    }
}
