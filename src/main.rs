//! qrlink CLI: link WhatsApp API accounts to a phone by QR code.
//!
//! Subcommands:
//! - `connect` — link a freshly created account
//! - `relink`  — re-link an existing account, showing the current link first
//! - `status`  — one-shot link status check

mod link;
mod logging;
mod render;

use clap::{Parser, Subcommand};
use qrlink_core::config::DEFAULT_CONFIG_PATH;
use qrlink_core::{Config, LinkMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "qrlink",
    version,
    about = "Link WhatsApp API accounts by scanning a rotating QR code"
)]
struct Cli {
    /// Config file path.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    /// Backend base URL (overrides `backend.base_url`).
    #[arg(long, global = true, env = "QRLINK_API_URL")]
    api_url: Option<String>,
    /// API key sent as `X-API-Key` (overrides `backend.api_key`).
    #[arg(long, global = true, env = "QRLINK_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Debug-level logging for qrlink crates.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link a newly created account.
    Connect {
        /// Account token.
        token: String,
        /// Where to save image QR codes.
        #[arg(long, default_value = "qrlink-qr.png")]
        qr_out: PathBuf,
    },
    /// Re-link an existing account.
    Relink {
        /// Account token.
        token: String,
        /// Where to save image QR codes.
        #[arg(long, default_value = "qrlink-qr.png")]
        qr_out: PathBuf,
    },
    /// Show whether an account is linked.
    Status {
        /// Account token.
        token: String,
    },
}

impl Cli {
    /// Load the config file and apply flag / env overrides.
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = Config::load(&self.config)?;
        if let Some(url) = &self.api_url {
            config.backend.base_url = url.clone();
        }
        if let Some(key) = &self.api_key {
            config.backend.api_key = key.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    let _log_guard = logging::init(&config.host.log_dir, cli.verbose)?;

    match cli.command {
        Commands::Connect { token, qr_out } => {
            link::run(&config, &token, LinkMode::Connect, &qr_out).await
        }
        Commands::Relink { token, qr_out } => {
            link::run(&config, &token, LinkMode::Relink, &qr_out).await
        }
        Commands::Status { token } => link::show_status(&config, &token).await,
    }
}
