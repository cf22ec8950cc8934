pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod listener;
pub mod operator;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod store;
pub mod vpc;

#[cfg(test)]
mod testing;

pub use operator::*;

use crate::client::HttpVendorClientBuilder;
use crate::config::Config;
use crate::listener::ListenerController;
use crate::store::{FileStore, MemoryStore, StateStore};
use crate::vpc::VpcController;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(config: Config) -> anyhow::Result<()> {
    log::info!(
        "Managing {} resource(s) in {} via {}",
        config.resources.len(),
        config.client.region,
        config.client.url
    );

    match config.state_file.clone() {
        Some(path) => serve(FileStore::open(path).await?, config).await,
        None => {
            log::warn!("No state file configured, state is kept in memory only");
            serve(MemoryStore::default(), config).await
        }
    }
}

async fn serve<S: StateStore>(store: S, config: Config) -> anyhow::Result<()> {
    let client = Arc::new(HttpVendorClientBuilder::from(&config.client).build()?);

    let operator = Operator::new(store, config.resources)
        .register(ListenerController::new(client.clone(), config.retry.clone()))
        .register(VpcController::new(client, config.retry));
    operator.check()?;

    if config.once {
        return operator.reconcile().await;
    }

    log::info!("Starting operator");
    operator
        .run(config.interval.unwrap_or(Duration::from_secs(60)))
        .await;

    Ok(())
}
