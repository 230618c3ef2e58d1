//! cstate hub entry point.

mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Uptime reported in heartbeats counts from here.
    let _ = cstate_agent::process_uptime();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting cstate hub");

    let config = config::HubConfig::load()?;
    tracing::info!(bind = %config.bind, port = config.port, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    tracing::info!("hub shut down cleanly");
    Ok(())
}

async fn run(config: config::HubConfig) -> anyhow::Result<()> {
    let hub = cstate_hub::Hub::start(config.server_config()).await?;
    tracing::info!(port = hub.port(), "hub ready");

    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = hub.stopped() => {}
    }
    hub.shutdown();
    Ok(())
}
