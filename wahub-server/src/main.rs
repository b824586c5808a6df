use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};
use wahub_core::{ConfigStore, HubConfig};

use wahub_server::registry::DeviceRegistry;
use wahub_server::session::SessionContext;
use wahub_server::sidecar::SidecarFactory;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "wahub.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real deployments set the environment directly
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match HubConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if config.http.api_key.is_empty() {
        eprintln!("http.api_key (or API_KEY) must be set; refusing to start without one");
        std::process::exit(1);
    }

    let store = ConfigStore::from_config(&config.storage);
    store.ensure_dirs().await?;
    tracing::info!(
        configs = %store.configs_dir().display(),
        sessions = %store.sessions_dir().display(),
        "Storage ready"
    );

    let factory = Arc::new(SidecarFactory::new(&config.sidecar));
    let ctx = Arc::new(SessionContext::from_config(&config, factory)?);
    let registry = Arc::new(DeviceRegistry::new(ctx));
    registry.restore_from_disk().await?;

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let result = wahub_server::http::start_http_server(
        Arc::clone(&registry),
        config.http.clone(),
        tx.subscribe(),
    )
    .await;

    registry.shutdown_all().await;
    tracing::info!("All sessions stopped");
    result
}
