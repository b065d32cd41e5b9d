//! Entry point of the order-ingestion service.
//!
//! Wires the closed ingestion loop (broker consumer, processor with its
//! bounded worker pool, and the acknowledgement path) together with the
//! read side: the durable store, the Redis cache warmed at startup, and
//! the HTTP server. The consumer and the processor never hold each other's
//! handle; they are decoupled by the two channels created here.
//!
//! Shutdown: SIGINT cancels the root token, every task drains and reports
//! completion through the JoinSet barrier, then the broker session and the
//! listener go down with their owners. Exit code is 0 on a clean stop and
//! 1 on any startup failure.

use std::sync::Arc;

use anyhow::{Context, Result};
use app_config::{AppConfig, PoisonAction};
use cache::OrderCache;
use kafka_consumer::KafkaConsumer;
use kafka_producer::DlqProducer;
use postgres::PgStorage;
use processor::{PoisonPolicy, Processor};
use server::Server;
use storage::OrderStorage;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MIGRATIONS_DIR: &str = "migrations";
const STATIC_DIR: &str = "./web";

fn init_logger(env: &str) {
    match env {
        "prod" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load().context("failed to load configuration")?;
    init_logger(&cfg.env);
    info!(env = %cfg.env, "starting order service");

    // Root cancellation signal, cancelled on interrupt.
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

    let storage = Arc::new(
        PgStorage::connect(&cfg.postgres)
            .await
            .context("failed to init storage")?,
    );
    storage
        .run_migrations(MIGRATIONS_DIR)
        .await
        .context("failed to apply migrations")?;
    info!("storage init successful");

    // The order/commit channel pair between consumer and processor.
    // Capacity 1 keeps the back-pressure contract: the consumer cannot
    // outrun the processor and the processor cannot outrun the commits.
    let (order_tx, order_rx) = mpsc::channel(1);
    let (commit_tx, commit_rx) = mpsc::channel(1);

    let poison_policy = match cfg.kafka.consumer.on_poison {
        PoisonAction::Redeliver => PoisonPolicy::Redeliver,
        PoisonAction::Skip => PoisonPolicy::Skip,
        PoisonAction::DeadLetter => {
            let topic = cfg
                .kafka
                .consumer
                .dead_letter_topic
                .clone()
                .context("dead_letter_topic is required when on_poison is dead_letter")?;
            let producer = DlqProducer::new(&cfg.kafka.bootstrap_servers, &topic)
                .context("failed to init dead-letter producer")?;
            PoisonPolicy::DeadLetter(Arc::new(producer))
        }
    };

    let mut tasks = JoinSet::new();

    let processor = Processor::new(storage.clone(), order_rx, commit_tx, poison_policy);
    {
        let ctx = ctx.clone();
        tasks.spawn(async move {
            processor.run(ctx).await;
        });
    }

    let order_cache = Arc::new(
        OrderCache::connect(&cfg.redis)
            .await
            .context("failed to init cache")?,
    );
    info!("cache init successful");

    {
        let cache = order_cache.clone();
        let storage = storage.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => {}
                res = cache.warm(storage.as_ref()) => {
                    // A failed warm-up is not fatal: the cache fills
                    // lazily through the read path.
                    if let Err(err) = res {
                        error!(error = %err, "failed to warm cache");
                    }
                }
            }
        });
    }

    let consumer = KafkaConsumer::new(&cfg.kafka, order_tx, commit_rx)
        .context("failed to init consumer")?;
    info!("consumer init successful, listening for messages");
    {
        let ctx = ctx.clone();
        tasks.spawn(async move {
            if let Err(err) = consumer.run(ctx).await {
                error!(error = %err, "kafka consumer error");
            }
        });
    }

    let cache_handle: Arc<dyn OrderStorage> = order_cache.clone();
    let storage_handle: Arc<dyn OrderStorage> = storage.clone();
    let http_server = Server::new(
        cfg.http_server.clone(),
        cache_handle,
        storage_handle,
        STATIC_DIR.to_string(),
    );
    {
        let ctx = ctx.clone();
        tasks.spawn(async move {
            if let Err(err) = http_server.start(ctx).await {
                error!(error = %err, "http server error");
                std::process::exit(1);
            }
        });
    }

    // Shutdown barrier: every task reports completion before the consumer
    // session handle and the listener are dropped with their owners.
    while let Some(res) = tasks.join_next().await {
        if let Err(err) = res {
            error!(error = %err, "task error");
        }
    }

    info!("application stopped");
    Ok(())
}
