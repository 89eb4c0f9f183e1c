//! RBD API Server
//!
//! This binary serves the RBD REST API. It connects to the storage cluster
//! once at startup and shares the connection across all requests.

use anyhow::{Context, Result};
use clap::Parser;
use rbd_api_cluster::{Cluster, MemoryCluster};
use rbd_api_common::{ClusterBackend, ClusterConfig, Config};
use rbd_api_rest::DocsConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rbd-api-server")]
#[command(about = "HTTP API for RBD images, snapshots and clones")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "RBD_API_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides the configuration file)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Cluster backend: librados or memory (overrides the configuration file)
    #[arg(long)]
    backend: Option<ClusterBackend>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(backend) = args.backend {
        config.cluster.backend = backend;
    }

    info!("Starting RBD API server");
    info!("Cluster backend: {}", config.cluster.backend);

    let cluster = connect_cluster(&config.cluster)?;
    let app = rbd_api_rest::router(cluster, &DocsConfig::from(&config.server));

    let addr = config.server.listen;
    info!("API document at {}", config.server.api_docs_path);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

fn connect_cluster(config: &ClusterConfig) -> Result<Arc<dyn Cluster>> {
    match config.backend {
        ClusterBackend::Memory => {
            info!("Memory pools: {:?}", config.memory_pools);
            Ok(Arc::new(MemoryCluster::with_pools(
                config.memory_pools.iter().cloned(),
            )))
        }
        ClusterBackend::Librados => connect_rados(config),
    }
}

#[cfg(feature = "librbd")]
fn connect_rados(config: &ClusterConfig) -> Result<Arc<dyn Cluster>> {
    info!(
        "Connecting to cluster as client.{} ({})",
        config.client_id,
        config.conf_file.display()
    );

    let cluster = rbd_api_cluster::RadosCluster::connect(&config.conf_file, &config.client_id)
        .context("Failed to connect to cluster")?;
    Ok(Arc::new(cluster))
}

#[cfg(not(feature = "librbd"))]
fn connect_rados(_config: &ClusterConfig) -> Result<Arc<dyn Cluster>> {
    anyhow::bail!(
        "librados backend not compiled in; rebuild with `--features librbd` or run with `--backend memory`"
    )
}
