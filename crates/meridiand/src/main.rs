//! meridiand: runs a simulated IP network and reports per-node statistics.

use anyhow::{Context, Result};

use meridian_core::config::MeridianConfig;

mod link;
mod report;
mod simulation;
mod topology;
mod traffic;

use simulation::Simulation;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeridianConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeridianConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeridianConfig::default()
    });
    config.validate().context("invalid configuration")?;
    tracing::info!(
        path = %MeridianConfig::file_path().display(),
        nodes = config.nodes.len(),
        links = config.links.len(),
        flows = config.traffic.len(),
        duration_secs = config.simulation.duration_secs,
        "meridiand starting"
    );

    let mut sim = Simulation::new(&config).context("failed to build simulation")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Run until done or interrupted ────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let interrupted = tokio::select! {
        _ = shutdown_rx.recv() => true,
        result = sim.run() => {
            result.context("simulation aborted")?;
            false
        }
    };
    if interrupted {
        tracing::info!(now_ms = sim.now().as_millis() as u64, "shutting down");
    }

    let report = sim.finish(interrupted);
    report
        .write(&config.simulation.report_path)
        .context("failed to write statistics report")?;

    Ok(())
}
