//! The Rune MCP server: wires configuration, the capture/recall pipelines,
//! and the stdio JSON-RPC transport together.

mod mcp;
mod pipelines;

use std::path::PathBuf;

use anyhow::{Context, Result};
use rmcp::service::ServiceExt;
use rmcp::transport::io::stdio;
use rune_config::AppConfig;

pub use mcp::RuneServer;
pub use pipelines::{build_pipelines, Pipelines};

/// Starts the server over stdin/stdout and runs until the client closes the
/// connection. `config_path` defaults to the platform config directory
/// when `None`.
pub async fn run_stdio_server(config_path: Option<PathBuf>) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => AppConfig::default_config_path().context("resolving default config path")?,
    };

    tracing::info!(path = %config_path.display(), "starting Rune MCP server");

    let server = RuneServer::new(config_path).await.context("building Rune MCP server")?;

    let (stdin, stdout) = stdio();
    let service = server
        .serve((stdin, stdout))
        .await
        .context("MCP server failed to start")?;

    service.waiting().await.context("MCP server error")?;
    Ok(())
}
