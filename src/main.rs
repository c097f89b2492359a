use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use doc_catalog_mcp::cache::CacheConfig;
use doc_catalog_mcp::server::{self, ServerConfig};

#[derive(Parser, Debug)]
#[command(version, about = "Documentation Catalog MCP Server")]
struct Cli {
    /// Type of server to run
    #[arg(short, long, value_enum, default_value_t = ServerType::Sse)]
    server_type: ServerType,

    /// Address for the SSE server
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Directory holding the catalog metadata files
    #[arg(long, default_value = "catalog")]
    catalog_dir: PathBuf,

    /// Maximum total cache size in bytes
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    max_cache_size: u64,

    /// Seconds a cached document stays valid
    #[arg(long, default_value_t = 3600)]
    max_age_secs: u64,

    /// Seconds between background expiry sweeps
    #[arg(long, default_value_t = 300)]
    cleanup_interval_secs: u64,

    /// Seconds between resource monitor samples
    #[arg(long, default_value_t = 30)]
    monitor_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = ServerConfig {
        cache: CacheConfig {
            max_size: cli.max_cache_size,
            max_age: Duration::from_secs(cli.max_age_secs),
            cleanup_interval: Duration::from_secs(cli.cleanup_interval_secs),
        },
        monitor_interval: Duration::from_secs(cli.monitor_interval_secs),
        catalog_dir: cli.catalog_dir,
    };

    match cli.server_type {
        ServerType::Sse => {
            println!("Starting SSE server on {}", cli.address);
            server::start_sse_server(&cli.address, config).await?;
        }
        ServerType::Stdio => {
            server::start_stdio_server(config).await?;
        }
    }

    Ok(())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ServerType {
    /// Start an SSE server
    Sse,
    /// Start a stdio server
    Stdio,
}
