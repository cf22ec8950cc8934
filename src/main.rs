use anyhow::Context;
use provider_reconciler::{config, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RECONCILER_CONFIG").ok())
        .unwrap_or_else(|| "reconciler.yaml".to_string());

    let config = config::load(&path).context("Failed to load configuration")?;
    run(config).await
}
