use anyhow::{Context, Result};
use battery_telemetry_sim::{api, config, persistence::JsonLinesSink, telemetry, SimulationManager};
use config::Config;
use std::sync::Arc;
use telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;

    let manager = SimulationManager::from_config(&cfg);

    if let Some(path) = &cfg.persistence.jsonl_path {
        let sink = JsonLinesSink::open(path).await?;
        manager.attach_sink(Arc::new(sink));
    }

    for battery in cfg.fleet.iter().cloned() {
        let id = manager
            .create(battery)
            .with_context(|| "creating configured fleet")?;
        if cfg.simulation.autostart {
            manager.start(&id)?;
        }
    }
    info!(batteries = manager.len(), autostart = cfg.simulation.autostart, "fleet loaded");

    let app = api::router(manager.clone(), &cfg.server);
    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!("binding to 0.0.0.0, the control API is reachable from the network");
    }

    info!(%addr, "starting battery telemetry simulator");

    // Stop the simulations first so websocket relays see their streams end
    // and the server can drain.
    let server_stop = CancellationToken::new();
    {
        let manager = manager.clone();
        let server_stop = server_stop.clone();
        tokio::spawn(async move {
            telemetry::shutdown_signal().await;
            manager.shutdown().await;
            server_stop.cancel();
        });
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_stop.cancelled().await })
        .await?;

    manager.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
