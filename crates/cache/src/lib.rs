//! Redis-backed order cache.
//!
//! Maps `order_uid` to the serialized order document. Entries never
//! expire: the store stays the source of truth and the cache is only a
//! read accelerator, warmed once at startup and refilled lazily on miss.

use anyhow::{Context, Result};
use async_trait::async_trait;
use model::Order;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use storage::{OrderStorage, OrdersSource, StorageError};
use tracing::info;

/// Shared handle to the cache store. Cloning is cheap: the connection
/// manager multiplexes over one reconnecting connection.
#[derive(Clone)]
pub struct OrderCache {
    conn: ConnectionManager,
}

impl OrderCache {
    /// Connects to Redis and verifies the server answers PING.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established or the
    /// ping fails. Callers treat this as fatal at startup.
    pub async fn connect(cfg: &app_config::Redis) -> Result<Self> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}:{}/{}", cfg.host, cfg.port, cfg.db)
        } else {
            format!("redis://:{}@{}:{}/{}", cfg.password, cfg.host, cfg.port, cfg.db)
        };

        let client = redis::Client::open(url).context("invalid redis address")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("can't connect to redis")?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("can't ping redis")?;

        Ok(Self { conn })
    }

    /// Returns the cached order, or [`StorageError::NoOrder`] on a miss.
    pub async fn get(&self, order_uid: &str) -> Result<Order, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(order_uid)
            .await
            .map_err(StorageError::other)?;

        match raw {
            Some(body) => decode_order(&body),
            None => Err(StorageError::NoOrder),
        }
    }

    /// Serialises and writes the order under its `order_uid`, no expiry.
    pub async fn set(&self, order: &Order) -> Result<(), StorageError> {
        let body = encode_order(order)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&order.order_uid, body)
            .await
            .map_err(StorageError::other)?;
        Ok(())
    }

    /// Bulk-populates the cache from the durable store.
    ///
    /// Run once at startup. Failure here is not fatal for the service:
    /// the cache fills lazily through the read path instead.
    pub async fn warm<S: OrdersSource + ?Sized>(&self, source: &S) -> Result<(), StorageError> {
        let orders = source.get_all_orders().await?;
        let total = orders.len();
        for order in &orders {
            self.set(order).await?;
        }
        info!(orders = total, "cache warm-up finished");
        Ok(())
    }
}

#[async_trait]
impl OrderStorage for OrderCache {
    async fn save_order(&self, order: &Order) -> Result<(), StorageError> {
        self.set(order).await
    }

    async fn get_order(&self, order_uid: &str) -> Result<Order, StorageError> {
        self.get(order_uid).await
    }
}

fn encode_order(order: &Order) -> Result<String, StorageError> {
    serde_json::to_string(order).map_err(StorageError::other)
}

fn decode_order(body: &str) -> Result<Order, StorageError> {
    serde_json::from_str(body).map_err(StorageError::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{AdditionalData, Delivery, Item, Payment};

    fn sample_order(uid: &str) -> Order {
        Order {
            order_uid: uid.to_string(),
            track_number: "TRACK123".to_string(),
            customer_id: "cust1".to_string(),
            delivery_service: "meest".to_string(),
            date_created: chrono::Utc::now(),
            items: vec![Item {
                chrt_id: 1,
                track_number: "TRACK123".to_string(),
                price: 100.0,
                rid: "rid1".to_string(),
                name: "Item1".to_string(),
                sale: 0.0,
                size: "L".to_string(),
                total_price: 100.0,
                nm_id: 123,
                brand: "brand".to_string(),
                status: 202,
            }],
            delivery: Delivery {
                name: "Test User".to_string(),
                phone: "+1000000000".to_string(),
                zip: "0000".to_string(),
                city: "Test City".to_string(),
                address: "Street".to_string(),
                region: "Test Region".to_string(),
                email: "test@example.com".to_string(),
            },
            payment: Payment {
                transaction: uid.to_string(),
                request_id: String::new(),
                currency: "USD".to_string(),
                provider: "wbpay".to_string(),
                amount: 100,
                payment_dt: 0,
                bank: "bank".to_string(),
                delivery_cost: 0,
                goods_total: 100,
                custom_fee: 0,
            },
            additional: AdditionalData {
                entry: "WBIL".to_string(),
                locale: "en".to_string(),
                internal_signature: String::new(),
                shardkey: "9".to_string(),
                sm_id: 1,
                oof_shard: "1".to_string(),
            },
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let order = sample_order("order123");
        let body = encode_order(&order).unwrap();
        let decoded = decode_order(&body).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn encoded_body_is_stable() {
        let order = sample_order("order123");
        let first = encode_order(&order).unwrap();
        let second = encode_order(&decode_order(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_order("not json").unwrap_err();
        assert!(!err.is_no_order());
    }
}
