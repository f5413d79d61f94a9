//! Binary document formats through the parser registry and the pipeline.

use std::fs;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

use ragsync::indexer::{get_data_point_fqn_to_hash_map, Components, Indexer};
use ragsync::loader::Fingerprint;
use ragsync::metadata_store::SqliteMetadataStore;
use ragsync::models::{
    AssociateDataSource, CreateCollection, DataIngestionMode, DataSource, EmbedderConfig,
    IngestDataToCollection, Metadata, ParserConfig,
};
use ragsync::parser::ParserRegistry;
use ragsync::vector_db::MemoryVectorDb;

/// Minimal single-page PDF whose text layer is `phrase`, with a correct
/// xref table so pdf-extract can parse it.
fn minimal_pdf_with_phrase(phrase: &str) -> Vec<u8> {
    let stream = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            stream.len(),
            stream
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// Minimal docx (ZIP) holding only `word/document.xml` with one paragraph.
fn minimal_docx_with_text(phrase: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file(
            "word/document.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

async fn chunks_of(name: &str, bytes: &[u8]) -> Vec<String> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(name);
    fs::write(&path, bytes).unwrap();
    let ext = format!(".{}", name.rsplit('.').next().unwrap());

    let registry = ParserRegistry::with_builtins();
    let parser = registry
        .resolve(&ext, &ParserConfig::default())
        .unwrap()
        .unwrap();
    parser
        .get_chunks(&path, &Metadata::new())
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.content)
        .collect()
}

#[tokio::test]
async fn test_pdf_text_layer_is_chunked() {
    let chunks = chunks_of("report.pdf", &minimal_pdf_with_phrase("quarterly audit phrase")).await;
    assert!(
        chunks.iter().any(|c| c.contains("quarterly audit phrase")),
        "chunks: {:?}",
        chunks
    );
}

#[tokio::test]
async fn test_docx_text_is_chunked() {
    let chunks = chunks_of("memo.docx", &minimal_docx_with_text("office memo phrase")).await;
    assert!(
        chunks.iter().any(|c| c.contains("office memo phrase")),
        "chunks: {:?}",
        chunks
    );
}

#[tokio::test]
async fn test_mixed_formats_ingest_into_one_collection() {
    let dir = TempDir::new().unwrap();
    let source_dir = dir.path().join("files");
    fs::create_dir_all(&source_dir).unwrap();
    fs::write(
        source_dir.join("report.pdf"),
        minimal_pdf_with_phrase("quarterly audit phrase"),
    )
    .unwrap();
    fs::write(
        source_dir.join("memo.docx"),
        minimal_docx_with_text("office memo phrase"),
    )
    .unwrap();
    fs::write(source_dir.join("notes.md"), "# Notes\n\nPlain markdown.\n").unwrap();

    let store = SqliteMetadataStore::open(&dir.path().join("meta.sqlite"))
        .await
        .unwrap();
    let indexer = Indexer::new(
        Arc::new(store),
        Arc::new(MemoryVectorDb::new()),
        Components::builtin(Fingerprint::Sha256),
    );
    let source = DataSource::new("localdir", source_dir.to_string_lossy());
    indexer.create_data_source(source.clone()).await.unwrap();
    indexer
        .create_collection(CreateCollection {
            name: "files".into(),
            description: None,
            embedder_config: EmbedderConfig::new("hashing"),
            associated_data_sources: vec![AssociateDataSource {
                data_source_fqn: source.fqn(),
                parser_config: ParserConfig::default(),
            }],
        })
        .await
        .unwrap();

    indexer
        .ingest_data(IngestDataToCollection {
            collection_name: "files".into(),
            data_source_fqn: None,
            data_ingestion_mode: DataIngestionMode::Full,
            raise_error_on_failure: true,
            batch_size: 2,
        })
        .await
        .unwrap();

    let vectors = indexer
        .vector_db()
        .list_data_point_vectors("files", &source.fqn(), 100)
        .await
        .unwrap();
    let map = get_data_point_fqn_to_hash_map(&vectors);
    for name in ["memo.docx", "notes.md", "report.pdf"] {
        assert!(
            map.contains_key(&format!("{}::{}", source.fqn(), name)),
            "{} was not ingested; have {:?}",
            name,
            map.keys().collect::<Vec<_>>()
        );
    }
}
