//! Cortex server — entry point.
//!
//! ```text
//! cortex-server                  Serve with cortex-server.toml (or defaults)
//! cortex-server --config <path>  Load a custom config TOML
//! cortex-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cortex_core::ExitStatus;
use cortex_server::config::ServerConfig;
use cortex_server::service::CortexServer;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cortex-server", about = "Cortex robot streaming server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "cortex-server.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        return match toml::to_string_pretty(&ServerConfig::default()) {
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

    let config = ServerConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitStatus::Config.into();
    }

    info!("cortex-server v{}", env!("CARGO_PKG_VERSION"));
    info!("UDP port: {}", config.network.port);
    info!("stream: {}x{} @ {} fps", config.stream.width, config.stream.height, config.stream.fps);
    info!("capture devices: {}", config.devices.len());

    let server = CortexServer::new(config);
    let stop = server.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    match server.run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(fatal) => {
            error!("{fatal}");
            fatal.status.into()
        }
    }
}
