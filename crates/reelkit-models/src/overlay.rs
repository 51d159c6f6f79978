//! Timed text overlays.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Optional boxed background behind an overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoxStyle {
    /// FFmpeg color spec, e.g. "black@0.5"
    #[serde(default = "default_box_color")]
    pub color: String,

    /// Border width in pixels
    #[serde(default = "default_box_border")]
    pub border_width: u32,
}

fn default_box_color() -> String {
    "black@0.5".to_string()
}

fn default_box_border() -> u32 {
    10
}

impl Default for BoxStyle {
    fn default() -> Self {
        Self {
            color: default_box_color(),
            border_width: default_box_border(),
        }
    }
}

/// A text overlay scoped to a `[start, end]` window on the segment timeline.
///
/// Unset styling fields fall back to the `text_*` settings when the drawtext
/// filter is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TextOverlay {
    pub text: String,

    /// Window start in seconds, relative to segment content time
    pub start: f64,

    /// Window end in seconds; must be > start
    pub end: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    /// FFmpeg x expression, e.g. "(w-text_w)/2"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_x: Option<String>,

    /// FFmpeg y expression, e.g. "h-text_h-80"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_y: Option<String>,

    /// Fade-in duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fade_in: Option<f64>,

    /// Fade-out duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fade_out: Option<f64>,

    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub box_style: Option<BoxStyle>,
}

impl TextOverlay {
    /// Create a bare overlay with the given window.
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
            font: None,
            size: None,
            color: None,
            position_x: None,
            position_y: None,
            fade_in: None,
            fade_out: None,
            box_style: None,
        }
    }

    /// Visible window length in seconds.
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document() {
        let o: TextOverlay =
            serde_json::from_str(r#"{"text":"Hello","start":0.5,"end":2.0}"#).unwrap();
        assert_eq!(o.text, "Hello");
        assert!((o.duration() - 1.5).abs() < 1e-9);
        assert!(o.box_style.is_none());
    }

    #[test]
    fn test_box_defaults() {
        let o: TextOverlay =
            serde_json::from_str(r#"{"text":"x","start":0,"end":1,"box":{}}"#).unwrap();
        let style = o.box_style.unwrap();
        assert_eq!(style.color, "black@0.5");
        assert_eq!(style.border_width, 10);
    }
}
