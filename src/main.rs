use anyhow::Context;
use std::sync::Arc;
use tinyfax_printer::events::UpstreamAction;
use tinyfax_printer::{DaemonConfig, PrinterManager, RusbBus, UpstreamGate};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Optional JSON config; otherwise TF_PRINTER_IP / TF_PRINTER_PORT are used.
const CONFIG_PATH_ENV: &str = "TF_CONFIG";

fn load_config() -> anyhow::Result<DaemonConfig> {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => DaemonConfig::load(&path).with_context(|| format!("Failed to load config from {}", path)),
        Err(_) => DaemonConfig::from_env().context("Invalid printer environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("TinyFax Printer Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    let config = load_config()?;
    let bus = Arc::new(RusbBus::new(&config.usb).context("Failed to initialize USB")?);
    let manager = PrinterManager::new(&config, bus);

    // Stand-in for the upstream bridge: log when it would come up or go down
    let mut counts = manager.subscribe_count();
    let gate_task = tokio::spawn(async move {
        let mut gate = UpstreamGate::new();
        loop {
            let count = match counts.recv().await {
                Ok(count) => count,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            };
            match gate.observe(count) {
                Some(UpstreamAction::Connect) => info!("Printer available ({}), upstream may connect", count),
                Some(UpstreamAction::Disconnect) => warn!("No printer available, upstream should disconnect"),
                None => {}
            }
        }
    });

    manager.connect().await;
    if manager.none_connected() {
        warn!("No printer connected yet; retrying network and waiting for USB hot-plug");
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    info!("TinyFax Printer shutting down...");
    gate_task.abort();
    manager.disconnect().await;
    Ok(())
}
