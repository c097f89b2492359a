//! Server startup for the SSE and stdio transports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::ServiceExt;
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::stdio;
use tracing_subscriber::{self, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::{CacheConfig, CacheManager};
use crate::catalog::CatalogStore;
use crate::mcp::CatalogService;
use crate::resources::{ResourceManager, Thresholds};

/// Runtime knobs assembled from the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cache: CacheConfig,
    pub monitor_interval: Duration,
    pub catalog_dir: PathBuf,
}

async fn build_service(config: &ServerConfig) -> Result<CatalogService> {
    let cache = Arc::new(CacheManager::new(config.cache.clone())?);
    let resources = Arc::new(ResourceManager::new(Thresholds::default())?);
    resources.start_monitoring(config.monitor_interval);

    let catalog = Arc::new(CatalogStore::new(config.catalog_dir.clone()));
    catalog.load().await?;

    Ok(CatalogService::new(catalog, cache, resources))
}

pub async fn start_sse_server(addr: &str, config: ServerConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let service = build_service(&config).await?;
    let handler = service.clone();
    let ct = SseServer::serve(addr.parse()?)
        .await?
        .with_service(move || handler.clone());

    tracing::info!(addr, "documentation catalog server listening");
    tokio::signal::ctrl_c().await?;
    ct.cancel();
    service.shutdown().await;
    Ok(())
}

pub async fn start_stdio_server(config: ServerConfig) -> Result<()> {
    // Logs go to stderr so they never interleave with the protocol stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("starting documentation catalog server on stdio");
    let service = build_service(&config).await?;
    let running = service.clone().serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    running.waiting().await?;
    service.shutdown().await;
    Ok(())
}
