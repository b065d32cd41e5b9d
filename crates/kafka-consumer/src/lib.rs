//! Kafka consumer session for the order pipeline.
//!
//! Drains broker messages into the order channel, receives processed
//! messages back on the commit channel, and advances consumer offsets only
//! for acknowledged work. Offsets are marked per message through a
//! monotone per-partition watermark and committed in batches.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::types::RDKafkaErrorCode;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Number of acknowledged messages after which offsets are committed.
pub const COMMIT_BATCH_SIZE: usize = 100;
/// Commit cadence for low-traffic partitions.
const COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Monotone per-partition acknowledgement watermark.
///
/// Marking a message advances the watermark only forward, so the committed
/// offset can never exceed the highest acknowledged message and a stuck
/// message holds its partition back, as at-least-once delivery requires.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    watermarks: HashMap<(String, i32), i64>,
}

impl OffsetTracker {
    /// Records an acknowledged message. Returns `true` when the partition
    /// watermark actually advanced.
    pub fn mark(&mut self, topic: &str, partition: i32, offset: i64) -> bool {
        match self.watermarks.get_mut(&(topic.to_string(), partition)) {
            Some(current) if *current >= offset => false,
            Some(current) => {
                *current = offset;
                true
            }
            None => {
                self.watermarks.insert((topic.to_string(), partition), offset);
                true
            }
        }
    }

    /// Highest acknowledged offset for the partition, if any.
    pub fn watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        self.watermarks.get(&(topic.to_string(), partition)).copied()
    }
}

/// Wraps the broker session and the channel pair shared with the
/// processor. Neither side holds the other's handle: both only see the
/// channels passed in by the composition root.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    order_tx: mpsc::Sender<OwnedMessage>,
    commit_rx: mpsc::Receiver<OwnedMessage>,
}

impl KafkaConsumer {
    /// Creates the consumer with the required session contract: replay
    /// from the oldest offset when the group has none, read only
    /// broker-committed messages, and manual commit/offset-store control.
    pub fn new(
        cfg: &app_config::Kafka,
        order_tx: mpsc::Sender<OwnedMessage>,
        commit_rx: mpsc::Receiver<OwnedMessage>,
    ) -> Result<Self, KafkaError> {
        if cfg.consumer.enable_auto_commit {
            warn!("enable_auto_commit is ignored: the consumer owns commit timing");
        }

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", cfg.bootstrap_servers.join(","))
            .set("group.id", &cfg.consumer.group_id)
            .set("auto.offset.reset", &cfg.consumer.auto_offset_reset)
            .set("isolation.level", &cfg.consumer.isolation_level)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");
        if let Some(protocol) = &cfg.consumer.security_protocol {
            client_config.set("security.protocol", protocol);
        }

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[&cfg.topic])?;

        Ok(Self {
            consumer,
            order_tx,
            commit_rx,
        })
    }

    /// Runs the session loop until cancellation.
    ///
    /// Four sources are multiplexed: the broker stream (only while no
    /// forward is pending), the order-channel send permit (only while one
    /// is), the commit channel, and the periodic commit ticker. Holding at
    /// most one undelivered message means the session never reads ahead of
    /// the processor, while the loop stays free to mark and commit
    /// acknowledgements even when the forward path is blocked.
    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        let Self {
            consumer,
            order_tx,
            mut commit_rx,
        } = self;

        let mut stream = consumer.stream();
        let mut tracker = OffsetTracker::default();
        let mut pending: Option<OwnedMessage> = None;
        let mut processed = 0usize;
        let mut commit_tick = tokio::time::interval(COMMIT_INTERVAL);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("stopping message processing");
                    commit_marked(&consumer, CommitMode::Sync);
                    return Ok(());
                }
                permit = order_tx.reserve(), if pending.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(msg) = pending.take() {
                                permit.send(msg);
                            }
                        }
                        Err(_) => {
                            info!("order channel closed, exiting session loop");
                            commit_marked(&consumer, CommitMode::Sync);
                            return Ok(());
                        }
                    }
                }
                maybe = stream.next(), if pending.is_none() => {
                    match maybe {
                        Some(Ok(msg)) => {
                            debug!(
                                partition = msg.partition(),
                                offset = msg.offset(),
                                "received message"
                            );
                            pending = Some(msg.detach());
                        }
                        Some(Err(err)) => {
                            error!(error = %err, "error from consumer");
                        }
                        None => {
                            info!("consumer stream closed, exiting session loop");
                            commit_marked(&consumer, CommitMode::Sync);
                            return Ok(());
                        }
                    }
                }
                maybe = commit_rx.recv() => {
                    match maybe {
                        Some(msg) => {
                            if tracker.mark(msg.topic(), msg.partition(), msg.offset()) {
                                if let Err(err) = consumer.store_offset(
                                    msg.topic(),
                                    msg.partition(),
                                    msg.offset(),
                                ) {
                                    error!(error = %err, "can't store offset");
                                    continue;
                                }
                            }
                            processed += 1;
                            if processed >= COMMIT_BATCH_SIZE {
                                info!("committing messages");
                                commit_marked(&consumer, CommitMode::Async);
                                processed = 0;
                            }
                        }
                        None => {
                            info!("commit channel closed, exiting session loop");
                            commit_marked(&consumer, CommitMode::Sync);
                            return Ok(());
                        }
                    }
                }
                _ = commit_tick.tick() => {
                    if processed > 0 {
                        commit_marked(&consumer, CommitMode::Async);
                        processed = 0;
                    }
                }
            }
        }
    }
}

/// Commits all stored offsets. Failures are logged and the session
/// continues; an empty commit is not an error worth reporting.
fn commit_marked(consumer: &StreamConsumer, mode: CommitMode) {
    if let Err(err) = consumer.commit_consumer_state(mode) {
        match err {
            KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset) => {
                debug!("no offsets to commit");
            }
            err => error!(error = %err, "can't commit offsets"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OffsetTracker;

    #[test]
    fn mark_advances_the_watermark() {
        let mut tracker = OffsetTracker::default();

        assert!(tracker.mark("orders", 0, 5));
        assert_eq!(tracker.watermark("orders", 0), Some(5));

        assert!(tracker.mark("orders", 0, 9));
        assert_eq!(tracker.watermark("orders", 0), Some(9));
    }

    #[test]
    fn mark_is_monotone() {
        let mut tracker = OffsetTracker::default();

        assert!(tracker.mark("orders", 0, 9));
        // Out-of-order acknowledgements never move the watermark back.
        assert!(!tracker.mark("orders", 0, 3));
        assert!(!tracker.mark("orders", 0, 9));
        assert_eq!(tracker.watermark("orders", 0), Some(9));
    }

    #[test]
    fn partitions_are_tracked_independently() {
        let mut tracker = OffsetTracker::default();

        assert!(tracker.mark("orders", 0, 100));
        assert!(tracker.mark("orders", 1, 2));
        assert!(tracker.mark("other", 0, 7));

        assert_eq!(tracker.watermark("orders", 0), Some(100));
        assert_eq!(tracker.watermark("orders", 1), Some(2));
        assert_eq!(tracker.watermark("other", 0), Some(7));
        assert_eq!(tracker.watermark("orders", 2), None);
    }
}
