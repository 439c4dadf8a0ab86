use anyhow::Result;
use feedloop_engine::EngineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod auth;
mod counter;

const COUNTER_LIMIT: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feedloop=info".parse()?))
        .init();

    info!("Feedloop demo starting...");

    let config = EngineConfig::from_env()?;
    config.log_summary();

    auth::run(&config).await?;

    let counted = counter::run(&config, COUNTER_LIMIT).await?;
    info!(ticks = counted.ticks, "Counter finished");

    Ok(())
}
