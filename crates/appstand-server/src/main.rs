//! appstand-server - HTTP adapter for the appstand application registry.
//!
//! Assembles the registry core over its backing services, bootstraps the
//! declared spaces and serves the HTTP surface. The current backend
//! profile is in-memory; the core talks to its stores through traits, so
//! swapping in a remote document or object store is an assembly change,
//! not a core change.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use appstand_core::cache::MemoryCache;
use appstand_core::store::{MemoryDocumentStore, MemoryObjectStore};
use appstand_core::Registry;

use appstand_server::config::ServerConfig;
use appstand_server::routes;

/// appstand registry server.
#[derive(Parser, Debug)]
#[command(name = "appstand-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address override.
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default_with_spaces(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let docs = Arc::new(MemoryDocumentStore::new());
    let blobs = Arc::new(MemoryObjectStore::new());
    let cache = Arc::new(MemoryCache::new());

    let spaces = config.space_registry()?;
    spaces
        .bootstrap(docs.as_ref(), blobs.as_ref())
        .await
        .context("bootstrapping spaces")?;

    let registry = Arc::new(
        Registry::new(docs, blobs, cache, spaces).with_ingest_config(config.ingest_config()),
    );

    let app = routes::router(registry);
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(listen = %config.listen, "appstand registry listening");

    axum::serve(listener, app).await.context("serving")
}
