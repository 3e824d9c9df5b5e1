use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rune_config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "rune", version, about = "Agent-facing organizational memory service")]
struct Cli {
    /// Path to config.json. Defaults to the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the MCP server over stdio (the default action).
    Serve,
    /// Write a default config.json if one doesn't already exist.
    InitConfig,
}

fn resolve_config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => rune_config::AppConfig::default_config_path(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            rune_runtime::run_stdio_server(Some(config_path)).await?;
        }
        Commands::InitConfig => {
            if config_path.exists() {
                println!("config already exists at {}", config_path.display());
            } else {
                AppConfig::default().save_to(&config_path)?;
                println!("wrote default config to {}", config_path.display());
            }
        }
    }

    Ok(())
}
