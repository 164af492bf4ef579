//! Lynk&Co Sync - Main Entry Point
//!
//! Polls the telematics cloud for every vehicle on the configured account
//! and logs each published snapshot.

use anyhow::Context;
use tracing::{error, info};

use lynkco_sync_lib::{logging, Coordinator, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    logging::init();
    info!("Lynk&Co Sync starting...");

    let config = SyncConfig::load().context("failed to load configuration")?;
    info!(
        "Account {} via {}, polling every {}s",
        config.username, config.api_base_url, config.poll_interval_secs
    );

    let coordinator =
        Coordinator::from_config(&config).context("failed to create coordinator")?;

    coordinator.on_snapshot_updated(|snapshot| {
        for status in &snapshot.vehicles {
            let summary = status.summary();
            info!(
                vin = %status.vin,
                name = status.vehicle.display_name(),
                engine_running = ?summary.engine_running,
                doors_locked = ?summary.doors_locked,
                battery_soc = ?summary.battery_state_of_charge,
                ecu_warnings = summary.ecu_warnings,
                "Vehicle status updated"
            );
        }
    });

    if let Err(e) = coordinator.first_refresh().await {
        error!("Initial sync failed: {}", e);
        return Err(e).context("service not ready");
    }
    info!("Initial sync complete: {} vehicle(s)", coordinator.vehicles().len());

    coordinator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Lynk&Co Sync stopped");
    Ok(())
}
