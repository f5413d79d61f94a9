use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::warn;

use super::splitter::{contains_text, TextSplitter};
use super::{chunk_metadata, Parser};
use crate::models::{Metadata, ParsedChunk, ParserConfig};

pub(super) const EXTENSIONS: &[&str] = &[".pdf"];

/// Text-layer PDF parser. Scanned PDFs without a text layer produce no
/// chunks.
pub struct PdfParser {
    splitter: TextSplitter,
}

impl PdfParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            splitter: TextSplitter::new(config.chunk_size, config.chunk_overlap),
        }
    }
}

/// Normalizes extracted PDF text: joins words hyphenated across lines,
/// strips trailing spaces, and collapses runs of blank lines.
fn clean_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0usize;
    let mut carry_hyphen = false;
    for line in raw.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        if !out.is_empty() && !carry_hyphen {
            out.push('\n');
        }
        if carry_hyphen {
            out.push_str(line.trim_start());
        } else {
            out.push_str(line);
        }
        carry_hyphen = line.ends_with('-')
            && line
                .chars()
                .rev()
                .nth(1)
                .map(char::is_alphabetic)
                .unwrap_or(false);
        if carry_hyphen {
            out.pop();
        }
    }
    out.trim().to_string()
}

#[async_trait]
impl Parser for PdfParser {
    fn name(&self) -> &str {
        "PdfParserFast"
    }

    async fn get_chunks(&self, filepath: &Path, metadata: &Metadata) -> Result<Vec<ParsedChunk>> {
        let bytes = tokio::fs::read(filepath)
            .await
            .with_context(|| format!("failed to read {}", filepath.display()))?;

        let extracted =
            tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes)).await;
        let raw = match extracted {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(file = %filepath.display(), error = %e, "PDF extraction failed; skipping");
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!(file = %filepath.display(), error = %e, "PDF extraction aborted; skipping");
                return Ok(Vec::new());
            }
        };

        let text = clean_text(&raw);
        Ok(self
            .splitter
            .split(&text)
            .into_iter()
            .filter(|c| contains_text(c))
            .map(|c| ParsedChunk::new(c, chunk_metadata(metadata, "text")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text() {
        let raw = "  Intro para-\ngraph line   \n\n\n\nSecond block\nstill second\n";
        assert_eq!(clean_text(raw), "Intro paragraph line\n\nSecond block\nstill second");
    }

    #[tokio::test]
    async fn test_invalid_pdf_yields_no_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        let chunks = PdfParser::new(&ParserConfig::default())
            .get_chunks(&path, &Metadata::new())
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_missing_pdf_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = PdfParser::new(&ParserConfig::default())
            .get_chunks(&dir.path().join("gone.pdf"), &Metadata::new())
            .await;
        assert!(result.is_err());
    }
}
