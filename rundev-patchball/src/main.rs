//! patchball: renders a JSON diff-op list as a patch tarball on stdout.
//!
//! Handy for inspecting the wire format the client uploads:
//!
//! ```text
//! patchball --ops-file ops.json --dir ./src | tar -tzv
//! ```

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rundev_common::archive::patch_archive;
use rundev_common::ignore::parse_dockerignore;
use rundev_common::{DiffOp, FileIgnores};

#[derive(Parser)]
#[command(name = "patchball")]
#[command(author, version, about = "render a diff-op list as a rundev patch tarball")]
struct Cli {
    /// JSON array file containing diff ops, e.g. [{"type":"add","path":"a"}]
    #[arg(long)]
    ops_file: PathBuf,

    /// Directory to look files up in
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Path to a dockerignore-format rules file
    #[arg(long)]
    dockerignore: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Diagnostics go to stderr; stdout carries the tarball.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ignores = match &cli.dockerignore {
        None => None,
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to open --dockerignore {}", path.display()))?;
            let rules = parse_dockerignore(&content)
                .with_context(|| format!("failed to parse --dockerignore {}", path.display()))?;
            info!(rules = rules.len(), "parsed ignore rules");
            Some(FileIgnores::new(&rules).context("failed to compile ignore rules")?)
        }
    };

    let ops_json = std::fs::read_to_string(&cli.ops_file)
        .with_context(|| format!("failed to open --ops-file {}", cli.ops_file.display()))?;
    let ops: Vec<DiffOp> =
        serde_json::from_str(&ops_json).context("failed to parse --ops-file as diff ops")?;
    for op in &ops {
        info!("{op}");
    }

    let tarball = patch_archive(&cli.dir, &ops, ignores.as_ref())
        .context("error creating patch archive")?;
    info!(bytes = tarball.len(), "patch archive ready");

    std::io::stdout()
        .write_all(&tarball)
        .context("failed to write tarball to stdout")?;
    Ok(())
}
