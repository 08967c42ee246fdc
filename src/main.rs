//! secure-shell-gateway entry point.
//!
//! Reads one JSON request (from `--request` or stdin), prints one JSON response on stdout.
//! Logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use secure_shell_gateway::loader::FileConfigProvider;
use secure_shell_gateway::protocol::{ErrorBody, Request, Response};
use secure_shell_gateway::Gateway;

#[derive(Debug, Parser)]
#[command(name = "secure-shell-gateway", version, about = "Policy-enforcing command gateway")]
struct Cli {
    /// Directory holding gateway.json and the rule files.
    #[arg(long, env = "GATEWAY_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Request JSON. Read from stdin when omitted.
    #[arg(long)]
    request: Option<String>,

    /// Pretty-print the response.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let gateway = Gateway::from_provider(&FileConfigProvider::new(&cli.config_dir))
        .with_context(|| format!("failed to start gateway from {}", cli.config_dir.display()))?;

    let raw = match cli.request {
        Some(raw) => raw,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("failed to read request from stdin")?;
            buf
        }
    };

    let response = match serde_json::from_str::<Request>(&raw) {
        Ok(request) => gateway.handle(request).await,
        Err(err) => {
            tracing::warn!(error = %err, "malformed request");
            Response::error(ErrorBody::new("invalid_request", format!("malformed request: {err}")))
        }
    };
    gateway.shutdown().await;

    let out = if cli.pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    println!("{out}");
    Ok(())
}
