use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::{DataLoader, DirectoryWalk, Fingerprint, LoadedBatches, Snapshot};
use crate::error::Error;
use crate::models::{DataIngestionMode, DataSource, Metadata};

/// Fetches a web resource into the staging directory, then traverses it.
///
/// HTML pages are converted to Markdown and staged as `<name>.md`; any
/// other body is staged as-is, named after the URL path with an
/// extension taken from the path or the content type.
pub struct WebLoader {
    fingerprint: Fingerprint,
    timeout: Duration,
}

impl WebLoader {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            timeout: Duration::from_secs(30),
        }
    }

    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<()> {
        let unavailable = |msg: String| Error::SourceUnavailable(msg);

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable(format!("failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(unavailable(format!(
                "failed to fetch {} - status code {}",
                url,
                response.status()
            ))
            .into());
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(format!("failed to read body of {}: {}", url, e)))?;

        let head = String::from_utf8_lossy(&body[..100.min(body.len())]).to_ascii_lowercase();
        let is_html = content_type.contains("text/html") || head.contains("<html");
        let (stem, path_ext) = name_from_url(url);

        std::fs::create_dir_all(dest_dir)?;
        let target = if is_html {
            let markdown = html2md::parse_html(&String::from_utf8_lossy(&body));
            let target = dest_dir.join(format!("{}.md", stem));
            std::fs::write(&target, markdown)?;
            target
        } else {
            let ext = path_ext
                .or_else(|| extension_for_content_type(&content_type))
                .unwrap_or_else(|| "bin".to_string());
            let target = dest_dir.join(format!("{}.{}", stem, ext));
            std::fs::write(&target, &body)?;
            target
        };
        info!(%url, staged = %target.display(), %content_type, "fetched web resource");
        Ok(())
    }
}

/// File stem and optional extension from the last URL path segment.
fn name_from_url(url: &str) -> (String, Option<String>) {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    let last = path
        .split_once('/')
        .map(|(_, p)| p.rsplit('/').find(|s| !s.is_empty()).unwrap_or(""))
        .unwrap_or("");

    let (stem, ext) = match last.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() && !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()) => {
            (s, Some(e.to_ascii_lowercase()))
        }
        _ => (last, None),
    };

    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let stem = stem.trim_start_matches('_');
    let stem = if stem.is_empty() { "index".to_string() } else { stem.to_string() };
    (stem, ext)
}

fn extension_for_content_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    let ext = match mime {
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "application/json" => "json",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "pptx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        _ => return None,
    };
    Some(ext.to_string())
}

#[async_trait]
impl DataLoader for WebLoader {
    fn description(&self) -> &str {
        "Fetches a web page or document over HTTP(S); HTML is converted to Markdown"
    }

    async fn load_filtered_data(
        &self,
        data_source: &DataSource,
        dest_dir: &Path,
        previous_snapshot: &Snapshot,
        batch_size: usize,
        mode: DataIngestionMode,
    ) -> Result<LoadedBatches> {
        let url = data_source.uri.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::config(format!("web data source uri must be an http(s) URL: {}", url)));
        }

        self.fetch(url, dest_dir)
            .await
            .with_context(|| format!("loading web data source {}", data_source.fqn()))?;

        let mut point_metadata = Metadata::new();
        point_metadata.insert("url".to_string(), url.into());

        let walk = DirectoryWalk::new(
            dest_dir,
            data_source.fqn(),
            previous_snapshot,
            mode,
            self.fingerprint,
        )
        .with_point_metadata(point_metadata);
        Ok(LoadedBatches::new(walk, batch_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_url() {
        assert_eq!(name_from_url("https://example.com"), ("index".to_string(), None));
        assert_eq!(name_from_url("https://example.com/"), ("index".to_string(), None));
        assert_eq!(
            name_from_url("https://example.com/docs/guide.PDF?dl=1"),
            ("guide".to_string(), Some("pdf".to_string()))
        );
        assert_eq!(
            name_from_url("https://example.com/blog/hello world/"),
            ("hello_world".to_string(), None)
        );
        assert_eq!(name_from_url("https://example.com/.well-known").0, "well-known");
    }

    #[test]
    fn test_extension_for_content_type() {
        assert_eq!(
            extension_for_content_type("application/pdf; charset=binary").as_deref(),
            Some("pdf")
        );
        assert_eq!(extension_for_content_type("image/png"), None);
    }

    #[tokio::test]
    async fn test_non_http_uri_is_config_error() {
        let loader = WebLoader::new(Fingerprint::Sha256);
        let dest = tempfile::TempDir::new().unwrap();
        let ds = DataSource::new("web", "ftp://example.com/file");
        let err = loader.load_full_data(&ds, dest.path(), 10).await.err().unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    }
}
