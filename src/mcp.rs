//! MCP service exposing the documentation catalog.
//!
//! [`CatalogService`] wires the collaborators together: tool calls look up
//! metadata in the [`CatalogStore`], serve content from the [`CacheManager`]
//! (fetching and caching on a miss), and register a connection with the
//! [`ResourceManager`] for the lifetime of each request.

use rmcp::model::{
    Content, Implementation, IntoContents, ListPromptsResult, PaginatedRequestParam,
    ProtocolVersion, ServerCapabilities,
};
use rmcp::service::RequestContext;
use rmcp::{Error as McpError, RoleServer, ServerHandler, model::ServerInfo, schemars, tool};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::cache::CacheManager;
use crate::catalog::{CatalogStore, DocRecord};
use crate::fetcher::{DocContent, DocFetcher, DocSource, FetchError};
use crate::resources::ResourceManager;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("document '{0}' is not in the catalog")]
    UnknownDocument(String),

    #[error("invalid document source: {0}")]
    InvalidSource(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to sample resource metrics: {0}")]
    Metrics(#[from] crate::resources::SampleError),

    #[error("failed to persist catalog: {0}")]
    Persist(std::io::Error),
}

impl IntoContents for ServiceError {
    fn into_contents(self) -> Vec<Content> {
        vec![Content::text(self.to_string())]
    }
}

/// MCP server handler for the documentation catalog.
#[derive(Clone)]
pub struct CatalogService {
    catalog: Arc<CatalogStore>,
    cache: Arc<CacheManager<DocContent>>,
    resources: Arc<ResourceManager>,
    fetcher: Arc<DocFetcher>,
    request_seq: Arc<AtomicU64>,
}

#[tool(tool_box)]
impl CatalogService {
    pub fn new(
        catalog: Arc<CatalogStore>,
        cache: Arc<CacheManager<DocContent>>,
        resources: Arc<ResourceManager>,
    ) -> Self {
        Self::with_fetcher(catalog, cache, resources, Arc::new(DocFetcher::new()))
    }

    pub fn with_fetcher(
        catalog: Arc<CatalogStore>,
        cache: Arc<CacheManager<DocContent>>,
        resources: Arc<ResourceManager>,
        fetcher: Arc<DocFetcher>,
    ) -> Self {
        Self {
            catalog,
            cache,
            resources,
            fetcher,
            request_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers a connection for the request's lifetime; the returned id is
    /// marked idle when the request finishes and reclaimed later by the
    /// idle-cleanup pass.
    async fn begin_request(&self) -> String {
        let id = format!("mcp-req-{}", self.request_seq.fetch_add(1, Ordering::Relaxed));
        self.resources.register_connection(id.clone(), true).await;
        id
    }

    async fn end_request(&self, id: &str) {
        self.resources.update_connection(id, false).await;
    }

    async fn lookup(&self, name: &str) -> Result<DocContent, ServiceError> {
        if let Some(content) = self.cache.get_with_stats(name).await {
            tracing::debug!(name, "cache hit");
            return Ok(content);
        }
        tracing::info!(name, "cache miss, fetching from source");
        let record = self
            .catalog
            .get(name)
            .await
            .ok_or_else(|| ServiceError::UnknownDocument(name.to_string()))?;
        let content = self.fetcher.fetch(&record.source).await?;
        let size = content.content.len() as u64;
        if !self.cache.set(name, content.clone(), size).await {
            tracing::warn!(name, size, "document exceeds the cache limit, serving uncached");
        }
        Ok(content)
    }

    #[tool(description = "Fetch a cataloged document's content, serving from cache when possible")]
    async fn get_documentation(
        &self,
        #[tool(param)]
        #[schemars(description = "Name of the cataloged document")]
        name: String,
    ) -> Result<DocContent, ServiceError> {
        let request = self.begin_request().await;
        let result = self.lookup(&name).await;
        self.end_request(&request).await;
        result
    }

    #[tool(description = "Search the catalog by name, tag, or description")]
    async fn search_documentation(
        &self,
        #[tool(param)]
        #[schemars(description = "Search query, matched case-insensitively")]
        query: String,
    ) -> DocContent {
        let request = self.begin_request().await;
        let results = self.catalog.search(&query).await;
        self.end_request(&request).await;
        DocContent {
            content: render_records(&results),
        }
    }

    #[tool(description = "List cataloged documents, optionally limited to one category")]
    async fn list_documentation(
        &self,
        #[tool(param)]
        #[schemars(description = "Category to list; empty lists every category")]
        category: String,
    ) -> DocContent {
        let request = self.begin_request().await;
        let filter = (!category.is_empty()).then_some(category.as_str());
        let records = self.catalog.list(filter).await;
        self.end_request(&request).await;
        DocContent {
            content: render_records(&records),
        }
    }

    #[tool(description = "Add a document to the catalog")]
    async fn add_documentation(
        &self,
        #[tool(param)]
        #[schemars(description = "Unique document name")]
        name: String,

        #[tool(param)]
        #[schemars(description = "Source kind: 'website', 'github', or 'file'")]
        kind: String,

        #[tool(param)]
        #[schemars(
            description = "Source location: a URL for websites, 'owner/repo@branch:path' for GitHub, a path for files"
        )]
        location: String,

        #[tool(param)]
        #[schemars(description = "Category the document belongs to")]
        category: String,

        #[tool(param)]
        #[schemars(description = "Comma-separated tags")]
        tags: String,

        #[tool(param)]
        #[schemars(description = "Short description of the document")]
        description: String,
    ) -> Result<DocContent, ServiceError> {
        let request = self.begin_request().await;
        let result = async {
            let source = parse_source(&kind, &location)?;
            self.catalog
                .add(DocRecord {
                    name: name.clone(),
                    source,
                    category,
                    tags: tags
                        .split(',')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_string)
                        .collect(),
                    description,
                })
                .await;
            self.catalog.save().await.map_err(ServiceError::Persist)?;
            Ok(DocContent {
                content: format!("Added '{}' to the catalog", name),
            })
        }
        .await;
        self.end_request(&request).await;
        result
    }

    #[tool(description = "Remove a document from the catalog and the cache")]
    async fn remove_documentation(
        &self,
        #[tool(param)]
        #[schemars(description = "Name of the document to remove")]
        name: String,
    ) -> Result<DocContent, ServiceError> {
        let request = self.begin_request().await;
        let result = async {
            let removed = self.catalog.remove(&name).await;
            if !removed {
                return Err(ServiceError::UnknownDocument(name.clone()));
            }
            self.cache.delete(&name).await;
            self.catalog.save().await.map_err(ServiceError::Persist)?;
            Ok(DocContent {
                content: format!("Removed '{}' from the catalog", name),
            })
        }
        .await;
        self.end_request(&request).await;
        result
    }

    #[tool(description = "Report cache hit/miss statistics and capacity usage")]
    async fn cache_stats(&self) -> Result<DocContent, ServiceError> {
        let stats = self.cache.get_stats().await;
        let content = serde_json::to_string_pretty(&stats)
            .unwrap_or_else(|err| format!("failed to render stats: {err}"));
        Ok(DocContent { content })
    }

    #[tool(description = "Report a point-in-time process resource snapshot")]
    async fn resource_metrics(&self) -> Result<DocContent, ServiceError> {
        let metrics = self.resources.get_metrics().await?;
        let content = serde_json::to_string_pretty(&metrics)
            .unwrap_or_else(|err| format!("failed to render metrics: {err}"));
        Ok(DocContent { content })
    }

    /// Persists the catalog and tears down both managers.
    pub async fn shutdown(&self) {
        if let Err(err) = self.catalog.save().await {
            tracing::warn!(%err, "failed to save catalog on shutdown");
        }
        self.cache.destroy().await;
        self.resources.destroy().await;
        tracing::info!("catalog service shut down");
    }
}

fn render_records(records: &[DocRecord]) -> String {
    if records.is_empty() {
        return "No matching documents".to_string();
    }
    records
        .iter()
        .map(|record| {
            format!(
                "{} [{}] ({}) - {}",
                record.name,
                record.category,
                record.tags.join(", "),
                record.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_source(kind: &str, location: &str) -> Result<DocSource, ServiceError> {
    match kind {
        "website" => Ok(DocSource::Website {
            url: location.to_string(),
        }),
        "file" => Ok(DocSource::LocalFile {
            path: location.to_string(),
        }),
        "github" => {
            let (repo_branch, path) = location.split_once(':').ok_or_else(|| {
                ServiceError::InvalidSource(format!(
                    "expected 'owner/repo@branch:path', got '{location}'"
                ))
            })?;
            let (repo, branch) = match repo_branch.split_once('@') {
                Some((repo, branch)) => (repo, branch),
                None => (repo_branch, "main"),
            };
            Ok(DocSource::GitHub {
                repo: repo.to_string(),
                path: path.to_string(),
                branch: branch.to_string(),
            })
        }
        other => Err(ServiceError::InvalidSource(format!(
            "unknown source kind '{other}'"
        ))),
    }
}

#[tool(tool_box)]
impl ServerHandler for CatalogService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server catalogs reference documentation from websites, GitHub, and \
                local files. Use 'add_documentation' to register a document, \
                'get_documentation' to fetch its content (cached for repeat access), and \
                'search_documentation' or 'list_documentation' to explore the catalog."
                    .to_string(),
            ),
        }
    }

    async fn list_prompts(
        &self,
        _request: PaginatedRequestParam,
        _: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult {
            next_cursor: None,
            prompts: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::resources::Thresholds;
    use mockito::Server;
    use std::time::Duration;
    use tempfile::tempdir;

    fn service(catalog_dir: std::path::PathBuf) -> CatalogService {
        let catalog = Arc::new(CatalogStore::new(catalog_dir));
        let cache = Arc::new(
            CacheManager::new(CacheConfig {
                max_size: 1024 * 1024,
                max_age: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(60),
            })
            .unwrap(),
        );
        let resources = Arc::new(ResourceManager::new(Thresholds::default()).unwrap());
        CatalogService::new(catalog, cache, resources)
    }

    #[tokio::test]
    async fn test_get_documentation_fetches_once_then_serves_cached() {
        let mock_body = r#"<html><body><main>Runtime reference page</main></body></html>"#;
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/tokio.html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(mock_body)
            .expect(1)
            .create();

        let dir = tempdir().unwrap();
        let service = service(dir.path().to_path_buf());
        service
            .catalog
            .add(DocRecord {
                name: "tokio".to_string(),
                source: DocSource::Website {
                    url: format!("{}/tokio.html", server.url()),
                },
                category: "async".to_string(),
                tags: vec!["runtime".to_string()],
                description: "async runtime".to_string(),
            })
            .await;

        let first = service.get_documentation("tokio".to_string()).await.unwrap();
        let second = service.get_documentation("tokio".to_string()).await.unwrap();
        m.assert();

        assert_eq!(first, second);
        assert!(first.content.contains("Runtime reference page"));
        let stats = service.cache.get_stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_documentation_unknown_name() {
        let dir = tempdir().unwrap();
        let service = service(dir.path().to_path_buf());
        match service.get_documentation("ghost".to_string()).await {
            Err(ServiceError::UnknownDocument(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected UnknownDocument, got {:?}", other.map(|d| d.content)),
        }
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_leave_idle_connections_behind() {
        let dir = tempdir().unwrap();
        let service = service(dir.path().to_path_buf());
        let _ = service.search_documentation("anything".to_string()).await;
        let _ = service.list_documentation(String::new()).await;

        let counts = service.resources.connection_counts().await;
        assert_eq!(counts.active, 0);
        assert_eq!(counts.idle, 2);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_then_search_and_list() {
        let dir = tempdir().unwrap();
        let service = service(dir.path().to_path_buf());
        service
            .add_documentation(
                "tokio".to_string(),
                "website".to_string(),
                "https://tokio.rs".to_string(),
                "async".to_string(),
                "runtime, scheduler".to_string(),
                "async runtime for Rust".to_string(),
            )
            .await
            .unwrap();

        let results = service.search_documentation("runtime".to_string()).await;
        assert!(results.content.contains("tokio"));
        let listing = service.list_documentation("async".to_string()).await;
        assert!(listing.content.contains("tokio"));
        let empty = service.list_documentation("databases".to_string()).await;
        assert_eq!(empty.content, "No matching documents");

        // add_documentation persists, so a fresh store sees the record.
        let reloaded = CatalogStore::new(dir.path().to_path_buf());
        reloaded.load().await.unwrap();
        assert!(reloaded.get("tokio").await.is_some());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_documentation_rejects_bad_kind() {
        let dir = tempdir().unwrap();
        let service = service(dir.path().to_path_buf());
        let result = service
            .add_documentation(
                "x".to_string(),
                "carrier-pigeon".to_string(),
                "somewhere".to_string(),
                "misc".to_string(),
                String::new(),
                String::new(),
            )
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidSource(_))));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_documentation_drops_cache_entry() {
        let dir = tempdir().unwrap();
        let service = service(dir.path().to_path_buf());
        service
            .add_documentation(
                "notes".to_string(),
                "file".to_string(),
                "/tmp/notes.md".to_string(),
                "misc".to_string(),
                String::new(),
                String::new(),
            )
            .await
            .unwrap();
        service
            .cache
            .set(
                "notes",
                DocContent {
                    content: "cached".to_string(),
                },
                6,
            )
            .await;

        service.remove_documentation("notes".to_string()).await.unwrap();
        assert!(!service.cache.has("notes").await);
        assert!(matches!(
            service.remove_documentation("notes".to_string()).await,
            Err(ServiceError::UnknownDocument(_))
        ));
        service.shutdown().await;
    }

    #[test]
    fn test_parse_github_source() {
        let source = parse_source("github", "tokio-rs/tokio@master:README.md").unwrap();
        assert_eq!(
            source,
            DocSource::GitHub {
                repo: "tokio-rs/tokio".to_string(),
                path: "README.md".to_string(),
                branch: "master".to_string(),
            }
        );
        // Branch defaults to main.
        let source = parse_source("github", "tokio-rs/tokio:README.md").unwrap();
        assert!(matches!(source, DocSource::GitHub { branch, .. } if branch == "main"));
        assert!(parse_source("github", "no-path-separator").is_err());
    }
}
