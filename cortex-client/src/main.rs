//! Cortex client — entry point.
//!
//! ```text
//! cortex-client                      Connect to the configured server
//! cortex-client <server> [--port N]  Connect to another server
//! cortex-client --config <path>      Load a custom config TOML
//! cortex-client --gen-config         Write default config to stdout
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cortex_client::app::ClientApp;
use cortex_client::config::ClientConfig;
use cortex_core::ExitStatus;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cortex-client", about = "Cortex robot operator client")]
struct Cli {
    /// Server host name or address.
    server: Option<String>,

    /// Server UDP port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "cortex-client.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.gen_config {
        return match toml::to_string_pretty(&ClientConfig::default()) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cannot render default config: {e}");
                ExitStatus::Config.into()
            }
        };
    }

    let mut config = ClientConfig::load(&cli.config);
    if let Some(server) = cli.server {
        config.network.server = server;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    // The terminal shows the console, so logs go to a file.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init();
    } else {
        let file = match OpenOptions::new().create(true).append(true).open(&config.logging.file) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("cannot open log file {}: {e}", config.logging.file);
                return ExitStatus::Config.into();
            }
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    }

    info!("cortex-client v{}", env!("CARGO_PKG_VERSION"));
    info!("server: {}", config.server_address());
    info!("layout: {}", config.input.layout);

    let app = ClientApp::new(config);
    match app.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            error!("{fatal}");
            eprintln!("cortex-client: {fatal}");
            fatal.status.into()
        }
    }
}
