//! Parsers turn one staged file into text chunks.
//!
//! A [`ParserRegistry`] maps file extensions to parsers. Registration
//! order is precedence order: the first parser registered for an
//! extension wins unless the collection's [`ParserConfig::parser_map`]
//! names another one.
//!
//! # Built-in parsers
//!
//! | Name | Extensions | Chunk `type` |
//! |------|------------|--------------|
//! | `MarkdownParser` | `.md`, `.markdown` | `markdown` |
//! | `TextParser` | `.txt` | `text` |
//! | `PdfParserFast` | `.pdf` | `text` |
//! | `OfficeParser` | `.docx`, `.pptx`, `.xlsx` | `text` / `table` |
//! | `CodeParser` | common source extensions | `code` |
//!
//! Unparsable or empty input yields no chunks; only I/O failures on the
//! staged file are errors.

mod code;
mod markdown;
mod office;
mod pdf;
pub mod splitter;
mod text;

pub use code::CodeParser;
pub use markdown::MarkdownParser;
pub use office::OfficeParser;
pub use pdf::PdfParser;
pub use text::TextParser;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::Error;
use crate::models::{ComponentInfo, Metadata, ParsedChunk, ParserConfig};

#[async_trait]
pub trait Parser: Send + Sync {
    fn name(&self) -> &str;

    /// Reads `filepath` and returns its chunks. Each chunk's metadata
    /// starts from `metadata` and adds parser-specific keys.
    async fn get_chunks(&self, filepath: &Path, metadata: &Metadata) -> Result<Vec<ParsedChunk>>;
}

pub type ParserFactory = Arc<dyn Fn(&ParserConfig) -> Box<dyn Parser> + Send + Sync>;

struct Registration {
    name: String,
    description: String,
    extensions: Vec<String>,
    factory: ParserFactory,
}

#[derive(Default)]
pub struct ParserRegistry {
    entries: Vec<Registration>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, &str, &[&str], ParserFactory); 5] = [
            (
                "MarkdownParser",
                "Splits Markdown on headings, then by size",
                markdown::EXTENSIONS,
                factory(MarkdownParser::new),
            ),
            (
                "TextParser",
                "Splits plain text files by size",
                text::EXTENSIONS,
                factory(TextParser::new),
            ),
            (
                "PdfParserFast",
                "Extracts the text layer of PDF files",
                pdf::EXTENSIONS,
                factory(PdfParser::new),
            ),
            (
                "OfficeParser",
                "Extracts text from Word, PowerPoint and Excel (OOXML) files",
                office::EXTENSIONS,
                factory(OfficeParser::new),
            ),
            (
                "CodeParser",
                "Splits source code on blank-line blocks",
                code::EXTENSIONS,
                factory(CodeParser::new),
            ),
        ];
        for (name, description, extensions, factory) in builtins {
            registry.entries.push(Registration {
                name: name.to_string(),
                description: description.to_string(),
                extensions: extensions.iter().map(|e| e.to_string()).collect(),
                factory,
            });
        }
        registry
    }

    /// Registers a parser for `extensions` (lowercase, with the dot).
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        extensions: &[&str],
        factory: ParserFactory,
    ) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Error::config(format!("a parser named '{}' is already registered", name)));
        }
        self.entries.push(Registration {
            name,
            description: description.into(),
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            factory,
        });
        Ok(())
    }

    /// Picks the parser for `file_extension`.
    ///
    /// Returns `Ok(None)` when nothing handles the extension; an override
    /// naming an unregistered parser is a configuration error.
    pub fn resolve(
        &self,
        file_extension: &str,
        parser_config: &ParserConfig,
    ) -> Result<Option<Box<dyn Parser>>> {
        let ext = file_extension.to_ascii_lowercase();
        if let Some(name) = parser_config.parser_map.get(&ext) {
            let entry = self
                .entries
                .iter()
                .find(|e| &e.name == name)
                .ok_or_else(|| Error::config(format!("no parser registered with name '{}'", name)))?;
            debug!(extension = %ext, parser = %name, "using parser from parser_map");
            return Ok(Some((entry.factory)(parser_config)));
        }

        match self.entries.iter().find(|e| e.extensions.contains(&ext)) {
            Some(entry) => {
                debug!(extension = %ext, parser = %entry.name, "using default parser");
                Ok(Some((entry.factory)(parser_config)))
            }
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Vec<ComponentInfo> {
        self.entries
            .iter()
            .map(|e| ComponentInfo {
                name: e.name.clone(),
                description: e.description.clone(),
            })
            .collect()
    }
}

/// Wraps a parser constructor as a registry factory.
pub fn factory<P, F>(build: F) -> ParserFactory
where
    P: Parser + 'static,
    F: Fn(&ParserConfig) -> P + Send + Sync + 'static,
{
    Arc::new(move |config: &ParserConfig| Box::new(build(config)) as Box<dyn Parser>)
}

/// Reads a staged file as text, replacing invalid UTF-8.
pub(crate) async fn read_text(filepath: &Path) -> Result<String> {
    let bytes = tokio::fs::read(filepath)
        .await
        .with_context(|| format!("failed to read {}", filepath.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Clones `base` and tags it with the chunk `type`.
pub(crate) fn chunk_metadata(base: &Metadata, chunk_type: &str) -> Metadata {
    let mut metadata = base.clone();
    metadata.insert("type".to_string(), chunk_type.into());
    metadata
}
