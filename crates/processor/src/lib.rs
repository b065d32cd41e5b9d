//! The ingestion core: turns raw broker messages into durable writes and
//! acknowledgements.
//!
//! Messages arrive on the order channel, accumulate into batches of the
//! pool capacity, and are flushed through the worker pool in parallel.
//! Only messages whose order was persisted are forwarded to the commit
//! channel; everything else stays unacknowledged so the broker re-delivers.

use std::sync::Arc;

use async_trait::async_trait;
use kafka_producer::DlqProducer;
use model::Order;
use rdkafka::message::{Message, OwnedMessage};
use storage::{OrderStorage, StorageError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worker_pool::{Handler, WorkerPool, DEFAULT_CAPACITY};

/// Per-message processing failure.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The broker message carried no payload at all.
    #[error("empty message payload")]
    EmptyPayload,
    /// The payload is not a valid order document.
    #[error("can't decode order payload: {0}")]
    Decode(#[from] serde_json::Error),
    /// The durable write failed; assumed transient.
    #[error("failed to save order: {0}")]
    Store(#[from] StorageError),
}

impl ProcessError {
    /// True for failures that no amount of re-delivery will fix.
    fn is_poison(&self) -> bool {
        matches!(self, ProcessError::EmptyPayload | ProcessError::Decode(_))
    }
}

/// What to do with a message whose payload can never be processed.
#[derive(Clone)]
pub enum PoisonPolicy {
    /// Withhold the acknowledgement; the broker re-delivers indefinitely.
    Redeliver,
    /// Acknowledge so the offset advances past the message.
    Skip,
    /// Publish to the dead-letter topic, acknowledge only if that worked.
    DeadLetter(Arc<DlqProducer>),
}

/// Decodes one broker message and persists the order.
struct OrderHandler<S> {
    store: Arc<S>,
}

#[async_trait]
impl<S: OrderStorage> Handler for OrderHandler<S> {
    type Msg = OwnedMessage;
    type Error = ProcessError;

    async fn handle(
        &self,
        _ctx: &CancellationToken,
        msg: &OwnedMessage,
    ) -> Result<(), ProcessError> {
        let payload = msg.payload().ok_or(ProcessError::EmptyPayload)?;
        let order: Order = serde_json::from_slice(payload)?;

        debug!(order_uid = %order.order_uid, "saving order in database");
        self.store.save_order(&order).await?;
        debug!(order_uid = %order.order_uid, "order saved");
        Ok(())
    }
}

/// Reads messages from the order channel, persists them through the
/// bounded pool, and emits acknowledgements on the commit channel.
///
/// Decoupled from the consumer by construction: both ends only see the
/// channel pair handed over by the composition root.
pub struct Processor<S: OrderStorage + 'static> {
    pool: Arc<WorkerPool<OrderHandler<S>>>,
    order_rx: mpsc::Receiver<OwnedMessage>,
    commit_tx: mpsc::Sender<OwnedMessage>,
    poison_policy: PoisonPolicy,
}

impl<S: OrderStorage + 'static> Processor<S> {
    pub fn new(
        store: Arc<S>,
        order_rx: mpsc::Receiver<OwnedMessage>,
        commit_tx: mpsc::Sender<OwnedMessage>,
        poison_policy: PoisonPolicy,
    ) -> Self {
        Self {
            pool: Arc::new(WorkerPool::new(DEFAULT_CAPACITY, OrderHandler { store })),
            order_rx,
            commit_tx,
            poison_policy,
        }
    }

    /// Accumulation loop. Flushes a full batch immediately; on
    /// cancellation or a closed inbound channel the remainder is flushed
    /// before returning, so no claimed message is silently dropped.
    pub async fn run(self, ctx: CancellationToken) {
        let Self {
            pool,
            mut order_rx,
            commit_tx,
            poison_policy,
        } = self;

        let batch_size = pool.capacity();
        let mut batch: Vec<OwnedMessage> = Vec::with_capacity(batch_size);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    if !batch.is_empty() {
                        flush(&pool, &commit_tx, &poison_policy, &ctx, std::mem::take(&mut batch)).await;
                    }
                    info!("stopping order processing");
                    return;
                }
                maybe = order_rx.recv() => match maybe {
                    Some(msg) => {
                        batch.push(msg);
                        if batch.len() == batch_size {
                            let full = std::mem::replace(
                                &mut batch,
                                Vec::with_capacity(batch_size),
                            );
                            flush(&pool, &commit_tx, &poison_policy, &ctx, full).await;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            flush(&pool, &commit_tx, &poison_policy, &ctx, std::mem::take(&mut batch)).await;
                        }
                        debug!("order channel closed, stopping order processing");
                        return;
                    }
                }
            }
        }
    }
}

/// Runs one batch through the pool in parallel, then drains the pool to
/// prove every handler finished before the next batch starts.
async fn flush<S: OrderStorage + 'static>(
    pool: &Arc<WorkerPool<OrderHandler<S>>>,
    commit_tx: &mpsc::Sender<OwnedMessage>,
    policy: &PoisonPolicy,
    ctx: &CancellationToken,
    batch: Vec<OwnedMessage>,
) {
    pool.fill();

    let mut tasks = JoinSet::new();
    for msg in batch {
        let pool = pool.clone();
        let commit_tx = commit_tx.clone();
        let policy = policy.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            match pool.handle(&ctx, &msg).await {
                Ok(()) => acknowledge(&commit_tx, msg).await,
                Err(err) if err.is_poison() => {
                    handle_poison(&policy, &commit_tx, msg, &err).await
                }
                Err(err) => {
                    // Transient: withheld acknowledgement forces re-delivery.
                    error!(error = %err, "failed to handle order message");
                }
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    pool.drain().await;
}

async fn acknowledge(commit_tx: &mpsc::Sender<OwnedMessage>, msg: OwnedMessage) {
    if commit_tx.send(msg).await.is_err() {
        debug!("commit channel closed, dropping acknowledgement");
    }
}

async fn handle_poison(
    policy: &PoisonPolicy,
    commit_tx: &mpsc::Sender<OwnedMessage>,
    msg: OwnedMessage,
    err: &ProcessError,
) {
    match policy {
        PoisonPolicy::Redeliver => {
            error!(error = %err, offset = msg.offset(), "poison message left for re-delivery");
        }
        PoisonPolicy::Skip => {
            warn!(error = %err, offset = msg.offset(), "skipping poison message");
            acknowledge(commit_tx, msg).await;
        }
        PoisonPolicy::DeadLetter(producer) => {
            match producer.publish(&msg, &err.to_string()).await {
                Ok(()) => {
                    warn!(offset = msg.offset(), "poison message moved to dead-letter topic");
                    acknowledge(commit_tx, msg).await;
                }
                Err(publish_err) => {
                    error!(
                        error = %publish_err,
                        offset = msg.offset(),
                        "failed to dead-letter poison message, leaving it for re-delivery"
                    );
                }
            }
        }
    }
}
