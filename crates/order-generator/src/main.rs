//! Order generator: emulates the upstream system by publishing random but
//! structurally valid order documents to the broker topic until
//! interrupted.

use anyhow::{Context, Result};
use app_config::AppConfig;
use kafka_producer::OrderProducer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load().context("failed to load configuration")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!(env = %cfg.env, "starting order generator");

    let producer = OrderProducer::new(&cfg.kafka).context("failed to init producer")?;
    info!("producer init successful");

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("received shutdown signal");
                    ctx.cancel();
                }
                Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
            }
        });
    }

    producer.run(ctx).await
}
