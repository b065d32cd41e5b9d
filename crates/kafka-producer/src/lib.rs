//! Producing side of the pipeline: synthetic order generation, the
//! transactional order producer driven by the generator binary, and the
//! dead-letter producer used by the processor's poison policy.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use fake::faker::address::en::{CityName, StateName, StreetName, ZipCode};
use fake::faker::company::en::{Buzzword, CompanyName};
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::Name;
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use model::{AdditionalData, Delivery, Item, Order, Payment};
use rand::seq::SliceRandom;
use rand::Rng;
use rdkafka::error::KafkaError;
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const TXN_TIMEOUT: Duration = Duration::from_secs(10);
const TXN_COMMIT_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound on the random pause between generated orders.
const MAX_SEND_PAUSE_MS: u64 = 1000;

const DELIVERY_SERVICES: &[&str] = &["meest", "dhl", "fedex", "cdek"];
const PROVIDERS: &[&str] = &["wbpay", "payu", "stripe", "visa", "mastercard"];
const BANKS: &[&str] = &["alpha", "sber", "vtb", "tinkoff"];
const SIZES: &[&str] = &["XS", "S", "M", "L", "XL"];

/// Kafka producer for order messages, keyed by `order_uid`.
///
/// Honours the producer configuration contract: acks, idempotence,
/// retries, and an optional transactional id. When transactional, the
/// send loop commits the open transaction every second and once more on
/// shutdown.
pub struct OrderProducer {
    producer: FutureProducer,
    topic: String,
    transactional: bool,
}

impl OrderProducer {
    pub fn new(cfg: &app_config::Kafka) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", cfg.bootstrap_servers.join(","))
            .set("acks", &cfg.producer.acks)
            .set(
                "enable.idempotence",
                cfg.producer.enable_idempotence.to_string(),
            )
            .set("retries", cfg.producer.retries.to_string())
            .set("message.timeout.ms", "5000");

        let transactional = !cfg.producer.transactional_id.is_empty();
        if transactional {
            client_config.set("transactional.id", &cfg.producer.transactional_id);
        }

        let producer = client_config.create()?;
        Ok(Self {
            producer,
            topic: cfg.topic.clone(),
            transactional,
        })
    }

    /// Serialises the order and publishes it, keyed by its `order_uid`.
    pub async fn send(&self, order: &Order) -> Result<()> {
        let payload =
            serde_json::to_string(order).context("failed to serialize order")?;
        let record = FutureRecord::to(&self.topic)
            .key(&order.order_uid)
            .payload(&payload);

        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(err, _)| anyhow::anyhow!("failed to publish order: {err}"))?;
        Ok(())
    }

    /// Emits generated orders at a random sub-second cadence until the
    /// token is cancelled, committing the producer transaction on a fixed
    /// ticker and once more before returning.
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        if self.transactional {
            self.producer
                .init_transactions(Timeout::After(TXN_TIMEOUT))
                .context("can't init transactions")?;
            self.producer
                .begin_transaction()
                .context("can't begin transaction")?;
        }

        let mut commit_tick = tokio::time::interval(TXN_COMMIT_INTERVAL);

        loop {
            let pause =
                Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_SEND_PAUSE_MS));

            tokio::select! {
                _ = ctx.cancelled() => {
                    if self.transactional {
                        if let Err(err) =
                            self.producer.commit_transaction(Timeout::After(TXN_TIMEOUT))
                        {
                            error!(error = %err, "can't commit final transaction");
                        }
                    }
                    info!("stopping order generator");
                    return Ok(());
                }
                _ = commit_tick.tick() => {
                    if self.transactional {
                        if let Err(err) =
                            self.producer.commit_transaction(Timeout::After(TXN_TIMEOUT))
                        {
                            error!(error = %err, "can't commit transaction");
                        }
                        if let Err(err) = self.producer.begin_transaction() {
                            error!(error = %err, "can't begin transaction");
                        }
                    }
                }
                _ = tokio::time::sleep(pause) => {
                    let order = generate_order();
                    match self.send(&order).await {
                        Ok(()) => info!(order_uid = %order.order_uid, "order published"),
                        Err(err) => error!(error = %err, "failed to publish order"),
                    }
                }
            }
        }
    }
}

/// Message shape published to the dead-letter topic: the untouched payload
/// plus enough coordinates to trace it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub original_message: Vec<u8>,
    pub error: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub partition: i32,
    pub offset: i64,
    pub source_topic: String,
}

/// Producer for messages the processor gave up on.
pub struct DlqProducer {
    producer: FutureProducer,
    topic: String,
}

impl DlqProducer {
    pub fn new(bootstrap_servers: &[String], topic: &str) -> Result<Self, KafkaError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers.join(","))
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    /// Wraps the failed message and publishes it to the dead-letter topic.
    pub async fn publish(&self, source: &OwnedMessage, error: &str) -> Result<()> {
        let dlq = DlqMessage {
            original_message: source.payload().unwrap_or_default().to_vec(),
            error: error.to_string(),
            timestamp: Utc::now(),
            partition: source.partition(),
            offset: source.offset(),
            source_topic: source.topic().to_string(),
        };
        let payload =
            serde_json::to_string(&dlq).context("failed to serialize dead-letter message")?;
        let key = source
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(err, _)| anyhow::anyhow!("failed to publish dead letter: {err}"))?;
        Ok(())
    }
}

/// Generates a structurally valid random order.
///
/// All items share the order's track number; payment totals are derived
/// from the generated items the way real upstream documents are.
pub fn generate_order() -> Order {
    let mut rng = rand::thread_rng();

    let order_uid = Uuid::new_v4().to_string();
    let track_number = format!("WBIL{}", rng.gen_range(10_000_000..100_000_000u64));
    let date_created = Utc::now();

    let item_count = rng.gen_range(1..=3);
    let mut items = Vec::with_capacity(item_count);
    let mut goods_total = 0i64;
    for _ in 0..item_count {
        let price: f64 = rng.gen_range(100..1000) as f64;
        let sale: f64 = rng.gen_range(0..=50) as f64;
        let total_price = price - price * sale / 100.0;
        goods_total += total_price as i64;

        items.push(Item {
            chrt_id: rng.gen_range(1_000_000..10_000_000),
            track_number: track_number.clone(),
            price,
            rid: Uuid::new_v4().to_string(),
            name: Buzzword().fake(),
            sale,
            size: SIZES.choose(&mut rng).unwrap_or(&"M").to_string(),
            total_price,
            nm_id: rng.gen_range(1_000_000..10_000_000),
            brand: CompanyName().fake(),
            status: 202,
        });
    }

    let delivery_cost = rng.gen_range(500..2500i64);
    let payment = Payment {
        transaction: order_uid.clone(),
        request_id: String::new(),
        currency: "USD".to_string(),
        provider: PROVIDERS.choose(&mut rng).unwrap_or(&"wbpay").to_string(),
        amount: goods_total + delivery_cost,
        payment_dt: date_created.timestamp(),
        bank: BANKS.choose(&mut rng).unwrap_or(&"alpha").to_string(),
        delivery_cost,
        goods_total,
        custom_fee: 0,
    };

    Order {
        order_uid: order_uid.clone(),
        track_number,
        customer_id: Uuid::new_v4().to_string(),
        delivery_service: DELIVERY_SERVICES
            .choose(&mut rng)
            .unwrap_or(&"meest")
            .to_string(),
        date_created,
        items,
        delivery: Delivery {
            name: Name().fake(),
            phone: PhoneNumber().fake(),
            zip: ZipCode().fake(),
            city: CityName().fake(),
            address: StreetName().fake(),
            region: StateName().fake(),
            email: SafeEmail().fake(),
        },
        payment,
        additional: AdditionalData {
            entry: "WBIL".to_string(),
            locale: "en".to_string(),
            internal_signature: String::new(),
            shardkey: rng.gen_range(1..10).to_string(),
            sm_id: rng.gen_range(1..100),
            oof_shard: "1".to_string(),
        },
    }
}
