use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use printcore::browser;
use printcore::config::{self, Config};
use printcore::device::DeviceProvider;
use printcore::device::serial::SerialProvider;
use printcore::device::sim::SimulatedProvider;
use printcore::web::{self, AppStateInner};
use printcore::Daemon;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Degrees per status query for the simulated printer.
const SIM_HEAT_STEP: f64 = 15.0;

#[derive(Debug, Parser)]
#[command(name = "printcore", version, about = "Local control daemon for G-code printers")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// host:port to listen on
    #[arg(long)]
    listen: Option<String>,
    /// Directory holding the UI assets and index.html
    #[arg(long)]
    ui_dir: Option<PathBuf>,
    /// Attach a simulated printer instead of probing serial ports
    #[arg(long)]
    simulate: bool,
    /// Open the UI in the default browser once the server is up
    #[arg(long)]
    open_browser: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("printcore starting...");
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            config::load_config(path).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path.display(), e);
                e
            })?
        }
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(ui_dir) = cli.ui_dir {
        config.server.ui_dir = ui_dir;
    }
    config.validate()?;

    web::check_ui_dir(&config.server.ui_dir).map_err(|e| {
        tracing::error!("Unable to read UI assets: {}", e);
        e
    })?;

    let provider: Arc<dyn DeviceProvider> = if cli.simulate {
        let provider = SimulatedProvider::new(SIM_HEAT_STEP);
        provider.attach("sim0");
        tracing::info!("Using simulated printer sim0");
        Arc::new(provider)
    } else {
        Arc::new(SerialProvider::new(config.discovery.clone()))
    };

    let (daemon, queues) = Daemon::start(&config, provider);
    let (outbound, _) = broadcast::channel(config.channels.capacity);
    tokio::spawn(web::fanout(queues.outbound, outbound.clone()));

    let state = Arc::new(AppStateInner {
        client_in: queues.inbound,
        outbound,
        ui_dir: config.server.ui_dir.clone(),
        listen: config.server.bind_addr(),
    });
    let app = web::api::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr()).await?;
    let local = listener.local_addr()?;
    let url = format!("http://{}", config.server.bind_addr());
    tracing::info!("UI available at {}", url);
    if cli.open_browser {
        tokio::spawn(browser::open_when_ready(local, url));
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Unable to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    daemon.shutdown().await;
    Ok(())
}
