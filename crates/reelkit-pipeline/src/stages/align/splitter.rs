//! Transcript span splitting.
//!
//! Display spans obey the readability rules: at most 35 characters, 2 to 7
//! words, compound words never broken. The repairer is applied to both the
//! deterministic splitter's output and the LLM's, so downstream code only
//! ever sees conforming spans.

/// Maximum characters per display span.
pub const MAX_SPAN_CHARS: usize = 35;
/// Maximum words per display span.
pub const MAX_SPAN_WORDS: usize = 7;
/// Minimum words per display span (single-word tails get merged).
pub const MIN_SPAN_WORDS: usize = 2;

/// Deterministic rule-based splitter.
pub fn split_spans(content: &str) -> Vec<String> {
    repair_spans(vec![content.to_string()])
}

/// Validate and auto-fix a span list: whitespace-normalize, re-chunk
/// over-long spans, merge single-word tails.
pub fn repair_spans(spans: Vec<String>) -> Vec<String> {
    let mut repaired: Vec<String> = Vec::new();

    for span in spans {
        let normalized = span.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            continue;
        }

        let word_count = normalized.split_whitespace().count();
        if (MIN_SPAN_WORDS..=MAX_SPAN_WORDS).contains(&word_count)
            && normalized.len() <= MAX_SPAN_CHARS
        {
            repaired.push(normalized);
        } else {
            repaired.extend(chunk_words(
                normalized.split_whitespace().map(str::to_string).collect(),
            ));
        }
    }

    merge_single_word_tail(&mut repaired);
    repaired
}

/// Greedy packing: up to 7 words and 35 characters per chunk.
fn chunk_words(words: Vec<String>) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut i = 0;

    while i < words.len() {
        let mut chunk: Vec<&str> = Vec::new();
        let mut chars = 0usize;

        while i < words.len() && chunk.len() < MAX_SPAN_WORDS {
            let word = &words[i];
            let added = chars + word.len() + usize::from(!chunk.is_empty());
            if added <= MAX_SPAN_CHARS {
                chunk.push(word);
                chars = added;
                i += 1;
            } else {
                break;
            }
        }

        if chunk.is_empty() {
            // A single word longer than the budget; keep it whole
            chunk.push(&words[i]);
            i += 1;
        }

        chunks.push(chunk.join(" "));
    }

    chunks
}

/// A trailing single-word chunk reads poorly; merge it into the previous
/// chunk when the character budget allows, otherwise steal a word from it.
fn merge_single_word_tail(chunks: &mut Vec<String>) {
    let len = chunks.len();
    if len < 2 {
        return;
    }
    let last_words = chunks[len - 1].split_whitespace().count();
    if last_words >= MIN_SPAN_WORDS {
        return;
    }

    let merged_len = chunks[len - 2].len() + 1 + chunks[len - 1].len();
    let prev_words = chunks[len - 2].split_whitespace().count();

    if merged_len <= MAX_SPAN_CHARS && prev_words < MAX_SPAN_WORDS {
        let tail = chunks.pop().unwrap();
        let prev = chunks.last_mut().unwrap();
        prev.push(' ');
        prev.push_str(&tail);
    } else if prev_words > MIN_SPAN_WORDS {
        let prev = &mut chunks[len - 2];
        let stolen = prev
            .rsplit_once(' ')
            .map(|(head, word)| (head.to_string(), word.to_string()));
        if let Some((head, word)) = stolen {
            *prev = head;
            chunks[len - 1] = format!("{} {}", word, chunks[len - 1]);
        }
    }
}

/// Whether a span list preserves the original transcript's vocabulary.
/// Mirrors the 95% word-set check applied to LLM output.
pub fn preserves_content(original: &str, spans: &[String]) -> bool {
    let original_words = word_set(original);
    if original_words.is_empty() {
        return !spans.is_empty();
    }

    let mut span_words = std::collections::HashSet::new();
    for span in spans {
        span_words.extend(word_set(span));
    }

    let kept = original_words.intersection(&span_words).count();
    kept as f64 / original_words.len() as f64 >= 0.95
}

fn word_set(text: &str) -> std::collections::HashSet<String> {
    crate::stages::align::mapping::normalize_words(text)
        .into_iter()
        .collect()
}
