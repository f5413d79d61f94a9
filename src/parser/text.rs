use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use super::splitter::{contains_text, TextSplitter};
use super::{chunk_metadata, read_text, Parser};
use crate::models::{Metadata, ParsedChunk, ParserConfig};

pub(super) const EXTENSIONS: &[&str] = &[".txt"];

pub struct TextParser {
    splitter: TextSplitter,
}

impl TextParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            splitter: TextSplitter::new(config.chunk_size, config.chunk_overlap),
        }
    }
}

#[async_trait]
impl Parser for TextParser {
    fn name(&self) -> &str {
        "TextParser"
    }

    async fn get_chunks(&self, filepath: &Path, metadata: &Metadata) -> Result<Vec<ParsedChunk>> {
        let content = read_text(filepath).await?;
        Ok(self
            .splitter
            .split(&content)
            .into_iter()
            .filter(|c| contains_text(c))
            .map(|c| ParsedChunk::new(c, chunk_metadata(metadata, "text")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_chunks_carry_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "First note.\n\n----\n\nSecond note.").unwrap();

        let config = ParserConfig {
            chunk_size: 14,
            chunk_overlap: 0,
            ..ParserConfig::default()
        };
        let mut base = Metadata::new();
        base.insert("source".into(), "unit".into());
        let chunks = TextParser::new(&config).get_chunks(&path, &base).await.unwrap();

        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["First note.", "Second note."]);
        assert_eq!(chunks[0].meta_str("type"), Some("text"));
        assert_eq!(chunks[0].meta_str("source"), Some("unit"));
    }

    #[tokio::test]
    async fn test_empty_file_has_no_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "").unwrap();
        let chunks = TextParser::new(&ParserConfig::default())
            .get_chunks(&path, &Metadata::new())
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = TextParser::new(&ParserConfig::default())
            .get_chunks(&dir.path().join("gone.txt"), &Metadata::new())
            .await;
        assert!(result.is_err());
    }
}
