//! rundev local proxy.
//!
//! Serves the developer's requests locally and forwards them to the remote
//! daemon; any request that finds the remote tree out of date triggers a
//! patch upload before it is retried.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use rundev_common::ignore::parse_dockerignore;
use rundev_common::FileIgnores;

use rundev::server::{local_router, LocalContext};
use rundev::syncer::{SyncOpts, Syncer};

#[derive(Parser)]
#[command(name = "rundev")]
#[command(author, version, about = "rundev local proxy - request-triggered source sync")]
struct Cli {
    /// Local directory to sync
    #[arg(long, default_value = ".")]
    local_dir: PathBuf,

    /// Network address to start the local proxy server on
    #[arg(long, default_value = "localhost:8080")]
    addr: String,

    /// Base URL of the remote daemon, e.g. http://localhost:8888
    #[arg(long)]
    remote_url: String,

    /// Secret sent with patches; defaults to a fresh per-session token
    #[arg(long)]
    client_secret: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if !cli.local_dir.is_dir() {
        bail!("--local-dir ({}) is not a directory", cli.local_dir.display());
    }

    let ignores = load_dockerignore(&cli.local_dir)?;
    let client_secret = cli
        .client_secret
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let syncer = Arc::new(Syncer::new(SyncOpts {
        local_dir: cli.local_dir,
        remote_url: cli.remote_url.trim_end_matches('/').to_string(),
        client_secret,
        ignores,
    }));
    let router = local_router(LocalContext::new(syncer));

    let listener = TcpListener::bind(&cli.addr)
        .await
        .with_context(|| format!("failed to bind local proxy address {}", cli.addr))?;
    info!(addr = %cli.addr, "local proxy starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("local proxy server failed")?;

    info!("local proxy shut down gracefully, exiting");
    Ok(())
}

/// Reads `<local-dir>/.dockerignore` when present. A missing file is fine;
/// an unparsable one is fatal.
fn load_dockerignore(local_dir: &std::path::Path) -> Result<Option<FileIgnores>> {
    let path = local_dir.join(".dockerignore");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("if there are files you don't want to sync, you can create a .dockerignore file");
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let rules = parse_dockerignore(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    info!(rules = rules.len(), "parsed .dockerignore rules");
    let ignores = FileIgnores::new(&rules).context("failed to compile .dockerignore rules")?;
    Ok(Some(ignores))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install shutdown signal handler");
        return;
    }
    info!("termination signal received");
}
