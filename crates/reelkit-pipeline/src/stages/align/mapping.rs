//! Span-to-word mapping.
//!
//! Maps display spans onto the aligner's word stream to derive each span's
//! time window. Exact sequential matching first, then a flexible windowed
//! match for spans the aligner partially missed. Spans that still resolve
//! nothing are interpolated between their timed neighbors.

use reelkit_models::{AlignedWord, TimedSpan};
use tracing::debug;

/// Words considered during a flexible match before giving up.
const FLEXIBLE_LOOKAHEAD: usize = 20;

/// Lowercased alphanumeric words of a text, punctuation stripped. Compound
/// separators split here on purpose: the aligner tokenizes the same way.
pub fn normalize_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '\'' {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Map spans to time windows against the aligned word stream.
///
/// Returns `None` when nothing could be matched at all; the caller then
/// falls back to uniform distribution.
pub fn map_spans(spans: &[String], words: &[AlignedWord]) -> Option<Vec<TimedSpan>> {
    if spans.is_empty() || words.is_empty() {
        return None;
    }

    let mut windows: Vec<Option<(f64, f64)>> = Vec::with_capacity(spans.len());
    let mut cursor = 0usize;

    for span in spans {
        let span_words = normalize_words(span);
        if span_words.is_empty() {
            windows.push(None);
            continue;
        }

        if let Some((start_idx, end_idx)) = find_exact(&span_words, words, cursor) {
            windows.push(window_of(&words[start_idx..=end_idx]));
            cursor = end_idx + 1;
        } else if let Some((window, advanced)) = find_flexible(&span_words, words, cursor) {
            windows.push(Some(window));
            cursor = advanced;
        } else {
            debug!(span = %span, "no aligned words matched span");
            windows.push(None);
        }
    }

    if windows.iter().all(Option::is_none) {
        return None;
    }

    Some(finalize(spans, windows))
}

/// Exact sequential match of `span_words` in the word stream at or after
/// `start`. Returns the matched index range.
fn find_exact(
    span_words: &[String],
    words: &[AlignedWord],
    start: usize,
) -> Option<(usize, usize)> {
    if start >= words.len() || span_words.len() > words.len() - start {
        return None;
    }

    for i in start..=(words.len() - span_words.len()) {
        let matches = span_words
            .iter()
            .zip(&words[i..i + span_words.len()])
            .all(|(expected, actual)| normalized_eq(expected, &actual.word));
        if matches {
            return Some((i, i + span_words.len() - 1));
        }
    }
    None
}

/// Flexible match: scan a bounded window for the span's words in any order,
/// falling back to containment for near-miss tokens. Returns the time window
/// and the next cursor position.
fn find_flexible(
    span_words: &[String],
    words: &[AlignedWord],
    start: usize,
) -> Option<((f64, f64), usize)> {
    if start >= words.len() {
        return None;
    }
    let window_end = (start + FLEXIBLE_LOOKAHEAD).min(words.len());
    let window = &words[start..window_end];

    let mut remaining: Vec<&String> = span_words.iter().collect();
    let mut matched: Vec<&AlignedWord> = Vec::new();
    let mut last_index = start;

    for (offset, word) in window.iter().enumerate() {
        let normalized = normalize_words(&word.word).into_iter().next().unwrap_or_default();
        if let Some(pos) = remaining.iter().position(|w| {
            normalized_eq(w, &word.word)
                || (w.len() >= 3 && normalized.len() >= 3
                    && (w.contains(&normalized) || normalized.contains(w.as_str())))
        }) {
            remaining.remove(pos);
            matched.push(word);
            last_index = start + offset;
            if remaining.is_empty() {
                break;
            }
        }
    }

    // Require at least half the span's words before trusting the window
    if matched.len() * 2 < span_words.len() {
        return None;
    }

    let timed: Vec<AlignedWord> = matched.into_iter().cloned().collect();
    window_of(&timed).map(|w| (w, last_index + 1))
}

fn normalized_eq(expected: &str, actual_raw: &str) -> bool {
    normalize_words(actual_raw)
        .first()
        .map(|actual| actual == expected)
        .unwrap_or(false)
}

/// Bounding time window of the aligned words in a slice.
fn window_of(words: &[AlignedWord]) -> Option<(f64, f64)> {
    let timed: Vec<(f64, f64)> = words
        .iter()
        .filter(|w| w.is_aligned())
        .filter_map(|w| Some((w.start?, w.end?)))
        .collect();
    if timed.is_empty() {
        return None;
    }
    let start = timed.iter().map(|(s, _)| *s).fold(f64::INFINITY, f64::min);
    let end = timed.iter().map(|(_, e)| *e).fold(0.0f64, f64::max);
    Some((start, end))
}

/// Fill unmatched spans by interpolating between timed neighbors, then clamp
/// the sequence monotonic and non-overlapping.
fn finalize(spans: &[String], windows: Vec<Option<(f64, f64)>>) -> Vec<TimedSpan> {
    let n = spans.len();
    let mut resolved: Vec<(f64, f64)> = Vec::with_capacity(n);

    for (i, window) in windows.iter().enumerate() {
        match window {
            Some(w) => resolved.push(*w),
            None => {
                let prev_end = resolved.last().map(|(_, e)| *e).unwrap_or(0.0);
                // Next timed window, if any, bounds the gap
                let next_start = windows[i + 1..]
                    .iter()
                    .flatten()
                    .map(|(s, _)| *s)
                    .next()
                    .unwrap_or(prev_end + 2.0);
                let gap = (next_start - prev_end).max(0.2);
                resolved.push((prev_end, prev_end + gap));
            }
        }
    }

    // Monotonic, non-overlapping
    let mut out = Vec::with_capacity(n);
    let mut prev_end = 0.0f64;
    for (i, (start, end)) in resolved.into_iter().enumerate() {
        let start = start.max(prev_end);
        let end = end.max(start + 0.1);
        prev_end = end;
        out.push(TimedSpan::new(spans[i].clone(), start, end));
    }
    out
}

/// Uniform fallback: distribute spans evenly across the voice-over duration.
pub fn uniform_spans(spans: &[String], total_duration: f64) -> Vec<TimedSpan> {
    let n = spans.len().max(1);
    let slot = (total_duration.max(0.1)) / n as f64;
    spans
        .iter()
        .enumerate()
        .map(|(i, span)| TimedSpan::new(span.clone(), i as f64 * slot, (i + 1) as f64 * slot))
        .collect()
}
