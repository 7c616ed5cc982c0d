//! Canopy daemon entry point.

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use canopy::{Config, Container};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting canopy container {} with {} role(s) and {} seed(s)",
        cfg.container_name,
        cfg.roles.len(),
        cfg.seeds.len()
    );

    let container = Container::new(cfg)?;
    let addr = container.start().await?;
    info!("Listening on {}", addr);

    // Log liveness changes
    let mut events = container.registry().subscribe();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("Liveness: {:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} liveness events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    events_handle.abort();
    container.shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}
