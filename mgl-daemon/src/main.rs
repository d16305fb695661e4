//! MGL daemon binary.
//!
//! Usage:
//!   mgl-daemon
//!   mgl-daemon --config mgl.toml
//!
//! `MGL_*` environment variables override the file (see
//! `MglConfig::apply_env`); `RUST_LOG` overrides the log level.

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use mgl_core::MglConfig;
use mgl_daemon::{build_engine, Daemon};

fn parse_args() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("MGL memory daemon");
                println!();
                println!("Usage: mgl-daemon [--config <PATH>]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(config_path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match parse_args()? {
        Some(path) => MglConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?,
        None => MglConfig::default(),
    }
    .apply_env();

    mgl_core::logging::init(&config.general);
    info!(
        db = %config.persistence.path.display(),
        embedding = %config.embedding.provider,
        llm = %config.llm.provider,
        "Starting MGL daemon"
    );

    let engine = build_engine(config)?;
    let daemon = Daemon::start(engine);

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown requested");
    daemon.stop().await;
    Ok(())
}
