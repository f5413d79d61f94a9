use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use super::splitter::{contains_text, TextSplitter, CODE_SEPARATORS};
use super::{chunk_metadata, read_text, Parser};
use crate::loader::file_extension;
use crate::models::{Metadata, ParsedChunk, ParserConfig};

pub(super) const EXTENSIONS: &[&str] = &[
    ".rs", ".py", ".js", ".jsx", ".ts", ".tsx", ".go", ".java", ".kt", ".c", ".h", ".cpp",
    ".hpp", ".cs", ".rb", ".php", ".swift", ".scala", ".sh", ".sql",
];

fn language(ext: &str) -> &'static str {
    match ext {
        ".rs" => "rust",
        ".py" => "python",
        ".js" | ".jsx" => "javascript",
        ".ts" | ".tsx" => "typescript",
        ".go" => "go",
        ".java" => "java",
        ".kt" => "kotlin",
        ".c" | ".h" => "c",
        ".cpp" | ".hpp" => "cpp",
        ".cs" => "csharp",
        ".rb" => "ruby",
        ".php" => "php",
        ".swift" => "swift",
        ".scala" => "scala",
        ".sh" => "shell",
        ".sql" => "sql",
        _ => "unknown",
    }
}

/// Source code parser: keeps blank-line separated blocks together where
/// they fit and records the `language`.
pub struct CodeParser {
    splitter: TextSplitter,
}

impl CodeParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            splitter: TextSplitter::new(config.chunk_size, config.chunk_overlap)
                .with_separators(CODE_SEPARATORS),
        }
    }
}

#[async_trait]
impl Parser for CodeParser {
    fn name(&self) -> &str {
        "CodeParser"
    }

    async fn get_chunks(&self, filepath: &Path, metadata: &Metadata) -> Result<Vec<ParsedChunk>> {
        let content = read_text(filepath).await?;
        let language = language(&file_extension(filepath));
        Ok(self
            .splitter
            .split(&content)
            .into_iter()
            .filter(|c| contains_text(c))
            .map(|c| {
                let mut meta = chunk_metadata(metadata, "code");
                meta.insert("language".to_string(), language.into());
                ParsedChunk::new(c, meta)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_code_blocks_and_language() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lib.rs");
        std::fs::write(
            &path,
            "fn one() -> u32 {\n    1\n}\n\nfn two() -> u32 {\n    2\n}\n",
        )
        .unwrap();
        let config = ParserConfig {
            chunk_size: 30,
            chunk_overlap: 0,
            ..ParserConfig::default()
        };
        let chunks = CodeParser::new(&config)
            .get_chunks(&path, &Metadata::new())
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.starts_with("fn one()"));
        assert!(chunks[1].content.starts_with("fn two()"));
        assert_eq!(chunks[1].meta_str("language"), Some("rust"));
        assert_eq!(chunks[1].meta_str("type"), Some("code"));
    }
}
