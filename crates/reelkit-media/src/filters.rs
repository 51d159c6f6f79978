//! FFmpeg filter vocabulary used by the renderer and concatenator.
//!
//! Everything here is a pure string builder; filter graphs are fully
//! determined by their inputs so rendering stays reproducible.

use reelkit_models::{TextOverlay, TransitionKind};

/// Scale into the target canvas preserving aspect, then pad centered.
pub fn scale_pad(width: u32, height: u32) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
        w = width,
        h = height
    )
}

/// Full video normalization chain: canvas, frame rate, pixel format.
pub fn normalize_video(width: u32, height: u32, fps: u32, pix_fmt: &str) -> String {
    format!("{},fps={},format={}", scale_pad(width, height), fps, pix_fmt)
}

/// Extend a video stream to `total` seconds by cloning frames: the first
/// frame for `lead` seconds at the head, the last frame for whatever remains
/// at the tail. Output is trimmed to exactly `total`.
pub fn freeze_extend(lead: f64, total: f64) -> String {
    let mut parts = Vec::new();
    let mut tpad = Vec::new();
    if lead > 0.0 {
        tpad.push(format!("start_duration={:.3}:start_mode=clone", lead));
    }
    // Always clone the tail; trim below bounds the stream
    tpad.push(format!("stop_duration={:.3}:stop_mode=clone", total));
    parts.push(format!("tpad={}", tpad.join(":")));
    parts.push(format!("trim=duration={:.3}", total));
    parts.push("setpts=PTS-STARTPTS".to_string());
    parts.join(",")
}

/// Fade color for a transition kind.
fn fade_color(kind: &TransitionKind) -> &'static str {
    match kind.effective() {
        TransitionKind::FadeWhite => "white",
        _ => "black",
    }
}

/// Video fade-in at the clip head.
pub fn video_fade_in(kind: &TransitionKind, duration: f64) -> String {
    format!(
        "fade=t=in:st=0:d={:.3}:color={}",
        duration,
        fade_color(kind)
    )
}

/// Video fade-out starting at `start`.
pub fn video_fade_out(kind: &TransitionKind, start: f64, duration: f64) -> String {
    format!(
        "fade=t=out:st={:.3}:d={:.3}:color={}",
        start,
        duration,
        fade_color(kind)
    )
}

/// Audio fade-in at the clip head.
pub fn audio_fade_in(duration: f64) -> String {
    format!("afade=t=in:st=0:d={:.3}", duration)
}

/// Audio fade-out starting at `start`.
pub fn audio_fade_out(start: f64, duration: f64) -> String {
    format!("afade=t=out:st={:.3}:d={:.3}", start, duration)
}

/// Shape a voice-over stream onto the clip timeline: delay the content by
/// `delay` seconds, then pad with silence and trim to `total`.
pub fn voice_shape(delay: f64, total: f64) -> String {
    let mut parts = Vec::new();
    if delay > 0.0 {
        let ms = (delay * 1000.0).round() as u64;
        parts.push(format!("adelay={ms}|{ms}"));
    }
    parts.push("apad".to_string());
    parts.push(format!("atrim=duration={:.3}", total));
    parts.push("asetpts=PTS-STARTPTS".to_string());
    parts.join(",")
}

/// Background-music shaping: loop-independent trim to the program length,
/// gain, and head/tail fades.
pub fn bgm_shape(volume: f64, fade_in: f64, fade_out: f64, duration: f64) -> String {
    let mut parts = vec![
        format!("atrim=duration={:.3}", duration),
        "asetpts=PTS-STARTPTS".to_string(),
        format!("volume={:.3}", volume),
    ];
    if fade_in > 0.0 {
        parts.push(audio_fade_in(fade_in));
    }
    if fade_out > 0.0 {
        let start = (duration - fade_out).max(0.0);
        parts.push(audio_fade_out(start, fade_out));
    }
    parts.join(",")
}

/// Filter-complex graph joining `n` normalized clips with re-encode.
pub fn concat_graph(n: usize) -> String {
    let mut graph = String::new();
    for i in 0..n {
        graph.push_str(&format!("[{i}:v][{i}:a]"));
    }
    graph.push_str(&format!("concat=n={n}:v=1:a=1[v][a]"));
    graph
}

/// Mix graph overlaying a shaped BGM stream (input 1) under the program
/// audio (input 0).
pub fn bgm_mix_graph(bgm_filter: &str) -> String {
    format!(
        "[1:a]{bgm_filter}[bgm];[0:a][bgm]amix=inputs=2:duration=first:dropout_transition=2[aout]"
    )
}

/// Escape text for a drawtext `text=` option.
///
/// Backslash and colon are escaped at the filter level; a single quote closes
/// the quoted section, emits an escaped quote and reopens it.
pub fn escape_drawtext(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\:"),
            '\'' => out.push_str("'\\''"),
            _ => out.push(c),
        }
    }
    out
}

/// Resolved drawtext defaults supplied by the caller's settings.
#[derive(Debug, Clone)]
pub struct DrawtextDefaults {
    pub font: String,
    /// Path to a font file; takes precedence over `font` when set
    pub font_file: Option<String>,
    pub size: u32,
    pub color: String,
    pub position_x: String,
    pub position_y: String,
    pub fade_in: f64,
    pub fade_out: f64,
}

/// Build a drawtext filter for one overlay.
///
/// `offset` shifts the overlay window onto the clip timeline (transition
/// lead-in plus start delay). Returns `None` for empty text or an empty
/// window.
pub fn drawtext(overlay: &TextOverlay, defaults: &DrawtextDefaults, offset: f64) -> Option<String> {
    if overlay.text.trim().is_empty() {
        return None;
    }
    let start = overlay.start + offset;
    let end = overlay.end + offset;
    if end <= start {
        return None;
    }

    let visible = end - start;
    let fade_in = overlay.fade_in.unwrap_or(defaults.fade_in).clamp(0.0, visible / 2.0);
    let fade_out = overlay.fade_out.unwrap_or(defaults.fade_out).clamp(0.0, visible / 2.0);

    let mut args = Vec::new();
    match (&defaults.font_file, &overlay.font) {
        (_, Some(font)) => args.push(format!("font={font}")),
        (Some(file), None) => args.push(format!("fontfile={file}")),
        (None, None) => args.push(format!("font={}", defaults.font)),
    }
    args.push(format!("text='{}'", escape_drawtext(&overlay.text)));
    args.push("expansion=none".to_string());
    args.push(format!(
        "fontcolor={}",
        overlay.color.as_deref().unwrap_or(&defaults.color)
    ));
    args.push(format!("fontsize={}", overlay.size.unwrap_or(defaults.size)));
    args.push(format!(
        "x={}",
        overlay.position_x.as_deref().unwrap_or(&defaults.position_x)
    ));
    args.push(format!(
        "y={}",
        overlay.position_y.as_deref().unwrap_or(&defaults.position_y)
    ));
    args.push(format!("enable='between(t,{:.3},{:.3})'", start, end));

    if fade_in > 0.0 || fade_out > 0.0 {
        args.push(format!(
            "alpha='{}'",
            alpha_envelope(start, end, fade_in, fade_out)
        ));
    }

    if let Some(style) = &overlay.box_style {
        args.push("box=1".to_string());
        args.push(format!("boxcolor={}", style.color));
        args.push(format!("boxborderw={}", style.border_width));
    }

    Some(format!("drawtext={}", args.join(":")))
}

/// Piecewise alpha expression: ramp up over `fade_in`, hold, ramp down over
/// `fade_out`.
fn alpha_envelope(start: f64, end: f64, fade_in: f64, fade_out: f64) -> String {
    let rise = if fade_in > 0.0 {
        format!("(t-{start:.3})/{fade_in:.3}")
    } else {
        "1".to_string()
    };
    let fall = if fade_out > 0.0 {
        format!("({end:.3}-t)/{fade_out:.3}")
    } else {
        "1".to_string()
    };
    format!(
        "if(lt(t,{start:.3}),0,if(lt(t,{in_end:.3}),{rise},if(lt(t,{out_start:.3}),1,if(lt(t,{end:.3}),{fall},0))))",
        in_end = start + fade_in,
        out_start = end - fade_out,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> DrawtextDefaults {
        DrawtextDefaults {
            font: "DejaVuSans".to_string(),
            font_file: None,
            size: 48,
            color: "white".to_string(),
            position_x: "(w-text_w)/2".to_string(),
            position_y: "h-text_h-80".to_string(),
            fade_in: 0.3,
            fade_out: 0.3,
        }
    }

    #[test]
    fn test_scale_pad_centered() {
        let f = scale_pad(1920, 1080);
        assert!(f.contains("force_original_aspect_ratio=decrease"));
        assert!(f.contains("pad=1920:1080:(ow-iw)/2:(oh-ih)/2"));
    }

    #[test]
    fn test_freeze_extend_with_lead() {
        let f = freeze_extend(0.5, 3.0);
        assert!(f.contains("start_duration=0.500:start_mode=clone"));
        assert!(f.contains("stop_mode=clone"));
        assert!(f.contains("trim=duration=3.000"));
    }

    #[test]
    fn test_freeze_extend_without_lead_has_no_start_pad() {
        let f = freeze_extend(0.0, 2.0);
        assert!(!f.contains("start_duration"));
        assert!(f.contains("trim=duration=2.000"));
    }

    #[test]
    fn test_fade_colors() {
        assert!(video_fade_in(&TransitionKind::Fade, 0.5).contains("color=black"));
        assert!(video_fade_in(&TransitionKind::FadeBlack, 0.5).contains("color=black"));
        assert!(video_fade_in(&TransitionKind::FadeWhite, 0.5).contains("color=white"));
        // Unknown kinds degrade to a plain fade
        let other = TransitionKind::Other("zoom".to_string());
        assert!(video_fade_out(&other, 2.5, 0.5).contains("color=black"));
    }

    #[test]
    fn test_voice_shape() {
        let f = voice_shape(1.5, 4.0);
        assert!(f.contains("adelay=1500|1500"));
        assert!(f.contains("apad"));
        assert!(f.contains("atrim=duration=4.000"));

        let f = voice_shape(0.0, 4.0);
        assert!(!f.contains("adelay"));
    }

    #[test]
    fn test_bgm_shape_fades() {
        let f = bgm_shape(0.2, 1.0, 2.0, 10.0);
        assert!(f.contains("volume=0.200"));
        assert!(f.contains("afade=t=in:st=0:d=1.000"));
        assert!(f.contains("afade=t=out:st=8.000:d=2.000"));
        assert!(f.starts_with("atrim=duration=10.000"));
    }

    #[test]
    fn test_concat_graph() {
        let g = concat_graph(3);
        assert_eq!(g, "[0:v][0:a][1:v][1:a][2:v][2:a]concat=n=3:v=1:a=1[v][a]");
    }

    #[test]
    fn test_escape_drawtext() {
        assert_eq!(escape_drawtext("a:b"), "a\\:b");
        assert_eq!(escape_drawtext("it's"), "it'\\''s");
        assert_eq!(escape_drawtext("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_drawtext_window_and_defaults() {
        let overlay = TextOverlay::new("Hello world", 1.0, 3.0);
        let f = drawtext(&overlay, &defaults(), 0.5).unwrap();
        assert!(f.contains("text='Hello world'"));
        assert!(f.contains("enable='between(t,1.500,3.500)'"));
        assert!(f.contains("fontsize=48"));
        assert!(f.contains("alpha="));
    }

    #[test]
    fn test_drawtext_empty_text_is_none() {
        let overlay = TextOverlay::new("   ", 0.0, 1.0);
        assert!(drawtext(&overlay, &defaults(), 0.0).is_none());
    }

    #[test]
    fn test_drawtext_no_fade_skips_alpha() {
        let mut overlay = TextOverlay::new("x", 0.0, 2.0);
        overlay.fade_in = Some(0.0);
        overlay.fade_out = Some(0.0);
        let f = drawtext(&overlay, &defaults(), 0.0).unwrap();
        assert!(!f.contains("alpha="));
    }

    #[test]
    fn test_drawtext_box() {
        let mut overlay = TextOverlay::new("x", 0.0, 2.0);
        overlay.box_style = Some(Default::default());
        let f = drawtext(&overlay, &defaults(), 0.0).unwrap();
        assert!(f.contains("box=1"));
        assert!(f.contains("boxcolor=black@0.5"));
    }
}
