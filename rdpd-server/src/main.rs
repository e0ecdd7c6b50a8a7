//! rdpd-server entry point.
//!
//! ```text
//! rdpd-server                  Run in the foreground
//! rdpd-server --config <path>  Load a custom config TOML
//! rdpd-server --port <port>    Override the listen port
//! rdpd-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rdpd_server::config::DaemonConfig;
use rdpd_server::service::RdpService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rdpd-server", about = "RDP protocol listener")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rdpd-server.toml")]
    config: PathBuf,

    /// Listen port, overriding the configuration file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&DaemonConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let mut config = DaemonConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rdpd-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}", config.listen_addr());
    info!("security layer: {:?}", config.rdp.security_layer);
    info!("crypt level: {:?}", config.rdp.crypt_level);

    let service = RdpService::new(config)?;
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
