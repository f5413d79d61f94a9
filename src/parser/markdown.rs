use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use super::splitter::{contains_text, TextSplitter};
use super::{chunk_metadata, read_text, Parser};
use crate::models::{Metadata, ParsedChunk, ParserConfig};

pub(super) const EXTENSIONS: &[&str] = &[".md", ".markdown"];

/// Heading-aware Markdown parser.
///
/// The document is cut at ATX headings (`#` .. `######`, outside fenced
/// code blocks); consecutive headings with no body between them stay
/// together. Each section is then size-split, and every chunk records
/// its heading trail under `headers` (`"Guide > Install"`).
///
/// `additional_config.max_heading_level` (1..=6, default 6) limits which
/// headings start a section; deeper ones stay in their parent's body.
pub struct MarkdownParser {
    splitter: TextSplitter,
    max_heading_level: usize,
}

impl MarkdownParser {
    pub fn new(config: &ParserConfig) -> Self {
        let max_heading_level = config
            .additional_config
            .get("max_heading_level")
            .and_then(|v| v.as_u64())
            .map_or(6, |l| l.clamp(1, 6) as usize);
        Self {
            splitter: TextSplitter::new(config.chunk_size, config.chunk_overlap),
            max_heading_level,
        }
    }
}

struct Section {
    headers: Vec<String>,
    text: String,
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t')) {
        return None;
    }
    Some((level, rest.trim().trim_end_matches('#').trim()))
}

fn sections(content: &str, max_level: usize) -> Vec<Section> {
    let mut out = Vec::new();
    let mut trail: Vec<(usize, String)> = Vec::new();
    let mut current = String::new();
    let mut has_body = false;
    let mut in_fence = false;
    let mut current_headers: Vec<String> = Vec::new();

    for line in content.lines() {
        let fence = line.trim_start().starts_with("```") || line.trim_start().starts_with("~~~");
        if fence {
            in_fence = !in_fence;
        }
        if !in_fence && !fence {
            if let Some((level, title)) = heading(line).filter(|(l, _)| *l <= max_level) {
                if has_body {
                    out.push(Section {
                        headers: current_headers.clone(),
                        text: std::mem::take(&mut current),
                    });
                    has_body = false;
                }
                trail.retain(|(l, _)| *l < level);
                trail.push((level, title.to_string()));
                current_headers = trail.iter().map(|(_, t)| t.clone()).collect();
                current.push_str(line);
                current.push('\n');
                continue;
            }
        }
        if !line.trim().is_empty() {
            has_body = true;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        out.push(Section {
            headers: current_headers,
            text: current,
        });
    }
    out
}

#[async_trait]
impl Parser for MarkdownParser {
    fn name(&self) -> &str {
        "MarkdownParser"
    }

    async fn get_chunks(&self, filepath: &Path, metadata: &Metadata) -> Result<Vec<ParsedChunk>> {
        let content = read_text(filepath).await?;
        let mut chunks = Vec::new();
        for section in sections(&content, self.max_heading_level) {
            for piece in self.splitter.split(&section.text) {
                if !contains_text(&piece) {
                    continue;
                }
                let mut meta = chunk_metadata(metadata, "markdown");
                if !section.headers.is_empty() {
                    meta.insert("headers".to_string(), section.headers.join(" > ").into());
                }
                chunks.push(ParsedChunk::new(piece, meta));
            }
        }
        Ok(chunks)
    }
}
