//! rundev daemon.
//!
//! Runs next to the user application inside the container: gates incoming
//! requests on the sync directory's fingerprint, accepts patches from the
//! local rundev proxy, and supervises the user process.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rundev_common::types::{BuildCmd, Cmd};
use rundev_common::FileIgnores;

use rundevd::server::{daemon_router, DaemonContext, DaemonOpts};

#[derive(Parser)]
#[command(name = "rundevd")]
#[command(author, version, about = "rundev daemon - request-gated sync and process supervision")]
struct Cli {
    /// Directory to sync
    #[arg(long, default_value = ".")]
    sync_dir: PathBuf,

    /// (optional) secret to authenticate patches from the rundev client
    #[arg(long, default_value = "")]
    client_secret: String,

    /// Network address to start the daemon on; the PORT environment
    /// variable overrides this with ":$PORT"
    #[arg(long, default_value = "localhost:8080")]
    addr: String,

    /// (JSON array encoded as string) command to start the user app
    #[arg(long)]
    run_cmd: String,

    /// (JSON encoded [{"c": [...], "on": [...]}]) commands to rebuild the
    /// user app before restarting it
    #[arg(long, default_value = "")]
    build_cmds: String,

    /// (JSON array encoded as string) exclusion rules in dockerignore format
    #[arg(long, default_value = "")]
    ignore_patterns: String,

    /// PORT environment variable passed to the user app
    #[arg(long, default_value = "5555")]
    user_port: u16,

    /// Seconds to wait for the user app to listen on PORT
    #[arg(long, default_value = "4")]
    process_listen_timeout: u64,

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

    info!(pid = std::process::id(), "rundevd starting");

    let opts = resolve_opts(&cli)?;
    let addr = listen_addr(&cli.addr);

    let ctx = DaemonContext::new(opts);
    let router = daemon_router(ctx);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind daemon address {addr}"))?;
    info!(%addr, "daemon server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("daemon server failed")?;

    info!("daemon server shut down gracefully, exiting");
    Ok(())
}

/// Validates flags and decodes the JSON-encoded command configuration,
/// mirroring the checks a broken deploy should fail fast on.
fn resolve_opts(cli: &Cli) -> Result<DaemonOpts> {
    if cli.sync_dir.as_os_str().is_empty() {
        bail!("--sync-dir is empty");
    }
    if !cli.sync_dir.is_dir() {
        bail!("--sync-dir ({}) is not a directory", cli.sync_dir.display());
    }
    if cli.process_listen_timeout == 0 {
        bail!("--process-listen-timeout must be positive");
    }
    if cli.user_port == 0 {
        bail!("--user-port value (0) is invalid");
    }
    if cli.run_cmd.is_empty() {
        bail!("--run-cmd is empty");
    }

    let run_cmd: Cmd = serde_json::from_str(&cli.run_cmd).context("failed to parse --run-cmd")?;
    if run_cmd.is_empty() {
        bail!("--run-cmd was empty (command array parsed into zero elements)");
    }

    let build_cmds: Vec<BuildCmd> = if cli.build_cmds.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&cli.build_cmds).context("failed to parse --build-cmds")?
    };

    let ignores = if cli.ignore_patterns.is_empty() {
        None
    } else {
        let patterns: Vec<String> = serde_json::from_str(&cli.ignore_patterns)
            .context("failed to parse --ignore-patterns")?;
        Some(FileIgnores::new(&patterns).context("failed to compile --ignore-patterns")?)
    };

    Ok(DaemonOpts {
        sync_dir: cli.sync_dir.clone(),
        client_secret: cli.client_secret.clone(),
        run_cmd,
        build_cmds,
        user_port: cli.user_port,
        port_wait_timeout: Duration::from_secs(cli.process_listen_timeout),
        ignores,
    })
}

/// Container platforms hand the listen port down via `PORT`.
fn listen_addr(flag_addr: &str) -> String {
    match std::env::var("PORT") {
        Ok(port) if !port.is_empty() => format!("0.0.0.0:{port}"),
        _ => flag_addr.to_string(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install shutdown signal handler");
        return;
    }
    info!("termination signal received");
}
