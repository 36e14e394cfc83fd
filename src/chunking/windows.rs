//! Token windows with overlap for sections that exceed the chunk budget

use super::ChunkingConfig;
use std::ops::Range;

/// Characters allowed to trail a sentence terminator (`end."` or `end.)`)
const CLOSING_CHARS: &[char] = &['"', '\'', ')', ']', '}', '\u{201d}', '\u{2019}'];

/// One window of a split section
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Window {
    pub text: String,
    pub token_count: usize,
    /// Shares its leading tokens with the previous window
    pub overlap: bool,
}

/// Count whitespace-delimited tokens
pub(crate) fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Byte ranges of every whitespace-delimited token in `text`
pub(crate) fn token_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    for (idx, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push(s..idx);
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }

    if let Some(s) = start {
        spans.push(s..text.len());
    }

    spans
}

/// For each token, whether a window may end right after it
fn break_points(text: &str, spans: &[Range<usize>]) -> Vec<bool> {
    spans
        .iter()
        .enumerate()
        .map(|(i, span)| {
            let token = text[span.clone()].trim_end_matches(CLOSING_CHARS);
            let sentence_end = token.ends_with(['.', '!', '?']);

            let paragraph_end = spans
                .get(i + 1)
                .map(|next| text[span.end..next.start].matches('\n').count() >= 2)
                .unwrap_or(true);

            sentence_end || paragraph_end
        })
        .collect()
}

/// Split `text` into overlapping windows.
///
/// Every window except the last holds between `min_tokens` and
/// `target_tokens` tokens, ending at the latest sentence or paragraph break in
/// that range, or exactly at `target_tokens` when there is none. Consecutive
/// windows share exactly `overlap_tokens` tokens. Once the remaining tokens fit
/// in `max_tokens` they form the final window.
pub(crate) fn split_windows(text: &str, config: &ChunkingConfig) -> Vec<Window> {
    let spans = token_spans(text);
    let total = spans.len();
    if total == 0 {
        return Vec::new();
    }

    let breaks = break_points(text, &spans);
    let slice = |start: usize, end: usize| text[spans[start].start..spans[end - 1].end].to_string();

    let mut windows = Vec::new();
    let mut start = 0;

    loop {
        let overlap = start > 0;

        if total - start <= config.max_tokens {
            windows.push(Window {
                text: slice(start, total),
                token_count: total - start,
                overlap,
            });
            break;
        }

        let hard_end = start + config.target_tokens;
        let floor = start + config.min_tokens.max(config.overlap_tokens + 1);
        let end = (floor..=hard_end)
            .rev()
            .find(|&end| breaks[end - 1])
            .unwrap_or(hard_end);

        windows.push(Window {
            text: slice(start, end),
            token_count: end - start,
            overlap,
        });

        // end - start > overlap_tokens, so start always advances
        start = end - config.overlap_tokens;
    }

    if config.overlap_tokens == 0 {
        for window in &mut windows {
            window.overlap = false;
        }
    }

    windows
}
