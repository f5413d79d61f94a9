//! OOXML (docx / pptx / xlsx) text extraction.
//!
//! Archives are read from memory with every XML entry capped at
//! [`MAX_XML_ENTRY_BYTES`] of decompressed data. Extraction failures are
//! logged and produce no chunks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::events::Event;
use std::io::{Cursor, Read};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use super::splitter::{contains_text, TextSplitter};
use super::{chunk_metadata, Parser};
use crate::loader::file_extension;
use crate::models::{Metadata, ParsedChunk, ParserConfig};

pub(super) const EXTENSIONS: &[&str] = &[".docx", ".pptx", ".xlsx"];

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Decompressed size cap per ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
enum OfficeError {
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("invalid XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZIP entry {0} exceeds size limit ({1} bytes)")]
    TooLarge(String, u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Docx,
    Pptx,
    Xlsx,
}

impl Format {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            ".docx" => Some(Format::Docx),
            ".pptx" => Some(Format::Pptx),
            ".xlsx" => Some(Format::Xlsx),
            _ => None,
        }
    }

    fn chunk_type(self) -> &'static str {
        match self {
            Format::Xlsx => "table",
            Format::Docx | Format::Pptx => "text",
        }
    }
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn read_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, OfficeError> {
    let entry = archive.by_name(name)?;
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(OfficeError::TooLarge(name.to_string(), MAX_XML_ENTRY_BYTES));
    }
    Ok(out)
}

/// Entries named `<prefix><n>.xml`, in numeric order.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Collects the text of every `text_tag` element, emitting a newline at
/// the end of every `break_tag` element.
fn collect_text(xml: &[u8], text_tag: &[u8], break_tag: &[u8]) -> Result<String, OfficeError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == text_tag => in_text = true,
            Event::Text(t) if in_text => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Event::End(e) => {
                let name = e.local_name();
                if name.as_ref() == text_tag {
                    in_text = false;
                } else if name.as_ref() == break_tag && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, OfficeError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let xml = read_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text(&xml, b"t", b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, OfficeError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_entry_bounded(&mut archive, &name)?;
        let text = collect_text(&xml, b"t", b"p")?;
        if !text.trim().is_empty() {
            slides.push(text.trim().to_string());
        }
    }
    Ok(slides.join("\n\n"))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, OfficeError> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Event::Text(t) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(t.unescape().unwrap_or_default().as_ref());
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One line per row, cells separated by ` | `.
fn extract_sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, OfficeError> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared_cell = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().any(|a| {
                        a.map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Event::Text(t) if in_value => {
                let raw = t.unescape().unwrap_or_default();
                let value = raw.trim();
                if !value.is_empty() {
                    let text = if shared_cell {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(text) = text {
                        row.push(text);
                        cells += 1;
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                        row.clear();
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" | "));
    }
    Ok(rows.join("\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, OfficeError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let shared = read_shared_strings(&mut archive)?;
    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry_bounded(&mut archive, &name)?;
        let text = extract_sheet_rows(&xml, &shared)?;
        if !text.is_empty() {
            sheets.push(text);
        }
    }
    Ok(sheets.join("\n\n"))
}

fn extract(bytes: &[u8], format: Format) -> Result<String, OfficeError> {
    match format {
        Format::Docx => extract_docx(bytes),
        Format::Pptx => extract_pptx(bytes),
        Format::Xlsx => extract_xlsx(bytes),
    }
}

pub struct OfficeParser {
    splitter: TextSplitter,
}

impl OfficeParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            splitter: TextSplitter::new(config.chunk_size, config.chunk_overlap),
        }
    }
}

#[async_trait]
impl Parser for OfficeParser {
    fn name(&self) -> &str {
        "OfficeParser"
    }

    async fn get_chunks(&self, filepath: &Path, metadata: &Metadata) -> Result<Vec<ParsedChunk>> {
        let Some(format) = Format::from_extension(&file_extension(filepath)) else {
            warn!(file = %filepath.display(), "not an OOXML file; skipping");
            return Ok(Vec::new());
        };
        let bytes = tokio::fs::read(filepath)
            .await
            .with_context(|| format!("failed to read {}", filepath.display()))?;

        let text = match tokio::task::spawn_blocking(move || extract(&bytes, format)).await? {
            Ok(text) => text,
            Err(e) => {
                warn!(file = %filepath.display(), error = %e, "OOXML extraction failed; skipping");
                return Ok(Vec::new());
            }
        };

        Ok(self
            .splitter
            .split(&text)
            .into_iter()
            .filter(|c| contains_text(c))
            .map(|c| ParsedChunk::new(c, chunk_metadata(metadata, format.chunk_type())))
            .collect())
    }
}
