use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use taskbridge::bridge::config::BridgeConfig;
use taskbridge::bridge::server;

#[derive(Parser)]
#[command(name = "taskbridge")]
#[command(version, about = "Bridge server that queues prompts and orchestrates remote coding agents")]
pub struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = "bridge.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bridge server (the default)
    Serve {
        /// Listen port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Repository working copy (overrides config)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = BridgeConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        repo: None,
        dev: false,
    }) {
        Commands::Serve { port, repo, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(repo) = repo {
                config.repo.path = repo;
            }
            if dev {
                config.server.dev_mode = true;
            }
            server::start_server(config).await
        }
    }
}
