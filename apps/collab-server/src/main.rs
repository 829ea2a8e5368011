//! Collaborative document WebSocket server
//! Serves shared documents, accounts and live subscriptions

use anyhow::Context;
use clap::Parser;
use collaboration::{CollaborationServer, Config, MemoryStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "collab-server")]
#[command(about = "Realtime document server for collaborative editing")]
#[command(version)]
struct Args {
    /// Config file (defaults to ~/.config/collab/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config
    #[arg(long)]
    bind: Option<String>,

    /// Keep documents in memory only
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collab_server=info,collaboration=info")),
        )
        .init();

    let mut config = Config::load_from(args.config).context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if args.in_memory {
        config.storage.in_memory = true;
    }

    let min_password_len = config.auth.min_password_len;
    let server = if config.storage.in_memory {
        info!("Using in-memory storage; documents will not survive a restart");
        CollaborationServer::with_store(Arc::new(MemoryStore::new()), min_password_len)
    } else {
        let path = config.database_path();
        let store = SqliteStore::open_or_create(&path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        info!("Using database at {}", path.display());
        CollaborationServer::with_store(Arc::new(store), min_password_len)
    };

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    Arc::new(server)
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
