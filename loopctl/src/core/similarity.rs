//! Repetition detection over recent iteration outputs.

use std::collections::VecDeque;

use similar::TextDiff;

/// Default ring buffer size for recent output summaries.
pub const DEFAULT_WINDOW: usize = 5;
/// Default pairwise similarity that every pair must exceed.
pub const DEFAULT_THRESHOLD: f64 = 0.9;
/// Summaries are truncated to this many characters before storage.
pub const SUMMARY_MAX_CHARS: usize = 1000;

/// Normalized similarity ratio in `[0, 1]` for two strings.
pub trait Similarity {
    fn ratio(&self, a: &str, b: &str) -> f64;
}

/// Character-level diff ratio (`2 * matches / total`).
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffRatio;

impl Similarity for DiffRatio {
    fn ratio(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        f64::from(TextDiff::from_chars(a, b).ratio()).clamp(0.0, 1.0)
    }
}

/// Push `summary` into a bounded ring buffer, evicting the oldest entries.
pub fn push_summary(buffer: &mut VecDeque<String>, summary: &str, window: usize) {
    let trimmed: String = summary.trim().chars().take(SUMMARY_MAX_CHARS).collect();
    buffer.push_back(trimmed);
    while buffer.len() > window.max(1) {
        buffer.pop_front();
    }
}

/// Minimum pairwise similarity across the buffer, or `None` if fewer than two entries.
pub fn min_pairwise<S: Similarity>(similarity: &S, buffer: &VecDeque<String>) -> Option<f64> {
    let items: Vec<&String> = buffer.iter().collect();
    let mut min: Option<f64> = None;
    for (i, a) in items.iter().enumerate() {
        for b in &items[i + 1..] {
            let r = similarity.ratio(a, b);
            min = Some(min.map_or(r, |m| m.min(r)));
        }
    }
    min
}

/// True when the buffer is full and every pair exceeds `threshold`.
pub fn is_stagnant<S: Similarity>(
    similarity: &S,
    buffer: &VecDeque<String>,
    window: usize,
    threshold: f64,
) -> bool {
    if window < 2 || buffer.len() < window {
        return false;
    }
    min_pairwise(similarity, buffer).is_some_and(|m| m > threshold)
}
