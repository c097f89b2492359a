//! Content fetchers for cataloged documentation sources.
//!
//! Websites are fetched over HTTP and reduced to readable text with
//! `scraper`; GitHub files come from the raw content host; local files are
//! read from disk. The MCP layer stores the result in the cache keyed by
//! document name, with the content length as the accounted size.

use reqwest::Client;
use rmcp::model::{Content, IntoContents};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const GITHUB_RAW_BASE: &str = "https://raw.githubusercontent.com";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("document not found at its source")]
    NotFound,

    #[error("failed to read local file: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a cataloged document lives.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocSource {
    Website { url: String },
    GitHub {
        repo: String,
        path: String,
        branch: String,
    },
    LocalFile { path: String },
}

/// Fetched document text, as served to MCP clients and stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocContent {
    pub content: String,
}

impl IntoContents for DocContent {
    fn into_contents(self) -> Vec<Content> {
        vec![Content::text(self.content)]
    }
}

pub struct DocFetcher {
    client: Client,
    github_base: String,
}

impl Default for DocFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DocFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            github_base: GITHUB_RAW_BASE.to_string(),
        }
    }

    /// Points GitHub fetches at an alternate host (mock servers in tests).
    pub fn new_with_github_base(base: &str) -> Self {
        Self {
            client: Client::new(),
            github_base: base.to_string(),
        }
    }

    pub async fn fetch(&self, source: &DocSource) -> Result<DocContent, FetchError> {
        match source {
            DocSource::Website { url } => self.fetch_website(url).await,
            DocSource::GitHub { repo, path, branch } => {
                self.fetch_github(repo, path, branch).await
            }
            DocSource::LocalFile { path } => {
                let content = tokio::fs::read_to_string(path).await?;
                Ok(DocContent { content })
            }
        }
    }

    async fn fetch_website(&self, url: &str) -> Result<DocContent, FetchError> {
        let url = Url::parse(url)?;
        tracing::debug!(%url, "fetching documentation page");
        let response = self
            .client
            .get(url.clone())
            .header("Accept", "text/html")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::NotFound);
        }
        let html = response.text().await?;
        let content = extract_readable_text(&html)
            .unwrap_or_else(|| format!("Documentation available at {}", url));
        Ok(DocContent { content })
    }

    async fn fetch_github(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<DocContent, FetchError> {
        let raw = format!(
            "{}/{}/{}/{}",
            self.github_base,
            repo,
            branch,
            path.trim_start_matches('/')
        );
        let url = Url::parse(&raw)?;
        tracing::debug!(%url, "fetching raw GitHub file");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::NotFound);
        }
        let content = response.text().await?;
        Ok(DocContent { content })
    }
}

/// Pulls the readable text out of an HTML page, preferring the main content
/// containers over the full body.
fn extract_readable_text(html: &str) -> Option<String> {
    use scraper::{Html, Selector};

    let document = Html::parse_document(html);
    for container in ["main", "article", "#content", "body"] {
        let selector = Selector::parse(container).ok()?;
        if let Some(node) = document.select(&selector).next() {
            let words: Vec<&str> = node
                .text()
                .flat_map(|chunk| chunk.split_whitespace())
                .collect();
            if !words.is_empty() {
                return Some(words.join(" "));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::io::Write;

    #[tokio::test]
    async fn test_fetch_website_extracts_main_content() {
        let mock_body = r#"<!DOCTYPE html><html><body>
            <nav>ignore this chrome</nav>
            <main>
                <h1>Tokio timers</h1>
                <p>Waits until duration has elapsed.</p>
            </main>
            </body></html>"#;

        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/docs/tokio/timers.html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(mock_body)
            .create();

        let fetcher = DocFetcher::new();
        let source = DocSource::Website {
            url: format!("{}/docs/tokio/timers.html", server.url()),
        };

        let result = fetcher.fetch(&source).await;
        m.assert();

        let doc = result.unwrap();
        assert!(doc.content.contains("Tokio timers"));
        assert!(doc.content.contains("Waits until duration has elapsed."));
        assert!(!doc.content.contains("ignore this chrome"));
    }

    #[tokio::test]
    async fn test_fetch_website_not_found() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/missing.html")
            .with_status(404)
            .create();

        let fetcher = DocFetcher::new();
        let source = DocSource::Website {
            url: format!("{}/missing.html", server.url()),
        };

        let result = fetcher.fetch(&source).await;
        m.assert();

        match result {
            Err(FetchError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_website_rejects_invalid_url() {
        let fetcher = DocFetcher::new();
        let source = DocSource::Website {
            url: "not a url".to_string(),
        };
        match fetcher.fetch(&source).await {
            Err(FetchError::Url(_)) => (),
            other => panic!("expected Url error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_github_raw_file() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/tokio-rs/tokio/master/README.md")
            .with_status(200)
            .with_body("# Tokio\nA runtime for writing reliable async applications")
            .create();

        let fetcher = DocFetcher::new_with_github_base(&server.url());
        let source = DocSource::GitHub {
            repo: "tokio-rs/tokio".to_string(),
            path: "README.md".to_string(),
            branch: "master".to_string(),
        };

        let result = fetcher.fetch(&source).await;
        m.assert();
        assert!(result.unwrap().content.contains("# Tokio"));
    }

    #[tokio::test]
    async fn test_fetch_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "local reference notes").unwrap();

        let fetcher = DocFetcher::new();
        let source = DocSource::LocalFile {
            path: file.path().to_string_lossy().into_owned(),
        };

        let doc = fetcher.fetch(&source).await.unwrap();
        assert!(doc.content.contains("local reference notes"));
    }

    #[tokio::test]
    async fn test_fetch_local_file_missing() {
        let fetcher = DocFetcher::new();
        let source = DocSource::LocalFile {
            path: "/nonexistent/path/to/doc.md".to_string(),
        };
        match fetcher.fetch(&source).await {
            Err(FetchError::Io(_)) => (),
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_readable_text_falls_back_to_body() {
        let html = r#"<html><body><p>plain body text</p></body></html>"#;
        let text = extract_readable_text(html).unwrap();
        assert_eq!(text, "plain body text");
    }
}
