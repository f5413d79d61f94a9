//! Recursive character text splitter.
//!
//! Splits on the coarsest separator present (paragraphs, then lines, then
//! sentences, then words, then characters) and greedily merges the pieces
//! back into chunks of at most `chunk_size` characters. Consecutive chunks
//! share up to `chunk_overlap` characters of trailing context.

use std::collections::VecDeque;

pub const PROSE_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " ", ""];
pub const CODE_SEPARATORS: &[&str] = &["\n\n\n", "\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: &'static [&'static str],
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            separators: PROSE_SEPARATORS,
        }
    }

    pub fn with_separators(mut self, separators: &'static [&'static str]) -> Self {
        self.separators = separators;
        self
    }

    /// Returns trimmed, non-empty chunks in document order.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, self.separators)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let idx = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(idx).copied().unwrap_or("");
        let rest = separators.get(idx + 1..).unwrap_or(&[]);

        let pieces: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<String> = Vec::new();
        for piece in pieces {
            if char_len(&piece) <= self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting, separator));
                fitting.clear();
            }
            if rest.is_empty() {
                chunks.extend(hard_split(&piece, self.chunk_size));
            } else {
                chunks.extend(self.split_with(&piece, rest));
            }
        }
        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting, separator));
        }
        chunks
    }

    fn merge(&self, splits: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut out = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for split in splits {
            let len = char_len(split);
            let joined_len = |window: &VecDeque<&str>, total: usize| {
                if window.is_empty() {
                    len
                } else {
                    total + sep_len + len
                }
            };
            if joined_len(&window, total) > self.chunk_size && !window.is_empty() {
                push_chunk(&mut out, &window, separator);
                while !window.is_empty()
                    && (total > self.chunk_overlap || joined_len(&window, total) > self.chunk_size)
                {
                    if let Some(front) = window.pop_front() {
                        total -= char_len(front);
                        if !window.is_empty() {
                            total -= sep_len;
                        }
                    }
                }
            }
            if !window.is_empty() {
                total += sep_len;
            }
            total += len;
            window.push_back(split);
        }
        push_chunk(&mut out, &window, separator);
        out
    }
}

fn push_chunk(out: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect::<String>())
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// True when the text carries at least one letter or digit.
pub fn contains_text(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}
