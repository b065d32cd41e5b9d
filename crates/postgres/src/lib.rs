//! PostgreSQL implementation of the durable order store.
//!
//! Orders live in two tables: `orders` holds one row per order with the
//! payment/delivery/ancillary sub-documents as JSONB, `order_items` holds
//! one row per line item keyed back by `order_uid`. Reads are a single
//! inner join that is grouped back into the aggregate in memory.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use model::{Item, Order};
use storage::{OrderStorage, OrdersSource, StorageError};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::info;

const INSERT_ORDER: &str = "\
    INSERT INTO orders (\
        order_uid, track_number, customer_id, delivery_service, date_created, \
        payment_data, delivery_data, additional_data\
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
    ON CONFLICT (order_uid) DO NOTHING";

// NUMERIC columns are bridged through float8 casts: tokio-postgres has no
// stdlib codec for NUMERIC, and the model carries f64 like the wire format.
const SELECT_ORDERS: &str = "\
    SELECT o.order_uid, o.track_number, o.customer_id, o.delivery_service, \
           o.date_created, o.payment_data, o.delivery_data, o.additional_data, \
           i.chrt_id, i.track_number AS item_track_number, i.price::float8 AS price, \
           i.rid, i.name, i.sale::float8 AS sale, i.size, \
           i.total_price::float8 AS total_price, i.nm_id, i.brand, i.status \
    FROM orders o \
    JOIN order_items i ON o.order_uid = i.order_uid";

/// Durable order store backed by a deadpool PostgreSQL pool.
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    /// Connects to PostgreSQL and verifies the connection with a ping.
    ///
    /// # Errors
    /// Returns an error if the pool cannot be built or the database does
    /// not answer. Callers treat this as fatal at startup.
    pub async fn connect(cfg: &app_config::Postgres) -> Result<Self> {
        let dsn = format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable",
            cfg.host, cfg.port, cfg.username, cfg.password, cfg.database
        );
        let pg_config: tokio_postgres::Config =
            dsn.parse().context("failed to parse Postgres DSN")?;

        let mgr = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(mgr)
            .max_size(16)
            .runtime(Runtime::Tokio1)
            .build()
            .context("failed to build database pool")?;

        let conn = pool.get().await.context("can't ping postgres")?;
        conn.simple_query("SELECT 1")
            .await
            .context("can't ping postgres")?;

        Ok(Self { pool })
    }

    /// Applies every `.sql` file from `migrations_dir` in file-name order.
    pub async fn run_migrations(&self, migrations_dir: &str) -> Result<()> {
        let mut entries = tokio::fs::read_dir(migrations_dir)
            .await
            .context("failed to read migrations directory")?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "sql") {
                files.push(path);
            }
        }
        files.sort();

        let conn = self
            .pool
            .get()
            .await
            .context("failed to get connection for migrations")?;
        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            info!(migration = %name, "applying migration");
            let sql = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read migration {name}"))?;
            conn.batch_execute(&sql)
                .await
                .with_context(|| format!("failed to apply migration {name}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStorage for PgStorage {
    /// Atomically persists the order and its items in one transaction.
    ///
    /// The order row uses `ON CONFLICT (order_uid) DO NOTHING`; when the
    /// row already existed the item insert is skipped as well, so a
    /// re-delivered message leaves the stored aggregate untouched.
    async fn save_order(&self, order: &Order) -> Result<(), StorageError> {
        let payment = serde_json::to_value(&order.payment).map_err(StorageError::other)?;
        let delivery = serde_json::to_value(&order.delivery).map_err(StorageError::other)?;
        let additional =
            serde_json::to_value(&order.additional).map_err(StorageError::other)?;

        let mut conn = self.pool.get().await.map_err(StorageError::other)?;
        let tx = conn.transaction().await.map_err(StorageError::other)?;

        let inserted = tx
            .execute(
                INSERT_ORDER,
                &[
                    &order.order_uid,
                    &order.track_number,
                    &order.customer_id,
                    &order.delivery_service,
                    &order.date_created,
                    &payment,
                    &delivery,
                    &additional,
                ],
            )
            .await
            .map_err(StorageError::other)?;

        if inserted > 0 && !order.items.is_empty() {
            insert_items(&tx, &order.order_uid, &order.items).await?;
        }

        tx.commit().await.map_err(StorageError::other)?;
        Ok(())
    }

    /// Returns the order with its items, or [`StorageError::NoOrder`] when
    /// the join yields no rows. An order stored without items is
    /// indistinguishable from a missing one here; callers tolerate that.
    async fn get_order(&self, order_uid: &str) -> Result<Order, StorageError> {
        let query = format!("{SELECT_ORDERS} WHERE o.order_uid = $1");
        let conn = self.pool.get().await.map_err(StorageError::other)?;
        let rows = conn
            .query(query.as_str(), &[&order_uid])
            .await
            .map_err(StorageError::other)?;

        let joined = rows
            .iter()
            .map(JoinedRow::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        collect_orders(joined)?
            .into_iter()
            .next()
            .ok_or(StorageError::NoOrder)
    }
}

#[async_trait]
impl OrdersSource for PgStorage {
    /// Returns every stored order with items, for cache warm-up.
    async fn get_all_orders(&self) -> Result<Vec<Order>, StorageError> {
        let conn = self.pool.get().await.map_err(StorageError::other)?;
        let rows = conn
            .query(SELECT_ORDERS, &[])
            .await
            .map_err(StorageError::other)?;

        let joined = rows
            .iter()
            .map(JoinedRow::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let orders = collect_orders(joined)?;
        if orders.is_empty() {
            return Err(StorageError::NoOrder);
        }
        Ok(orders)
    }
}

/// Single all-or-nothing multi-row insert for the order's items.
async fn insert_items(
    tx: &deadpool_postgres::Transaction<'_>,
    order_uid: &str,
    items: &[Item],
) -> Result<(), StorageError> {
    let mut query = String::from(
        "INSERT INTO order_items (\
         order_uid, chrt_id, track_number, price, rid, name, \
         sale, size, total_price, nm_id, brand, status) VALUES ",
    );
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(items.len() * 12);

    for (i, item) in items.iter().enumerate() {
        let base = i * 12;
        if i > 0 {
            query.push_str(", ");
        }
        query.push_str(&format!(
            "(${}, ${}, ${}, ${}::float8, ${}, ${}, ${}::float8, ${}, ${}::float8, ${}, ${}, ${})",
            base + 1,
            base + 2,
            base + 3,
            base + 4,
            base + 5,
            base + 6,
            base + 7,
            base + 8,
            base + 9,
            base + 10,
            base + 11,
            base + 12,
        ));
        params.push(&order_uid as &(dyn ToSql + Sync));
        params.push(&item.chrt_id);
        params.push(&item.track_number);
        params.push(&item.price);
        params.push(&item.rid);
        params.push(&item.name);
        params.push(&item.sale);
        params.push(&item.size);
        params.push(&item.total_price);
        params.push(&item.nm_id);
        params.push(&item.brand);
        params.push(&item.status);
    }

    tx.execute(query.as_str(), &params)
        .await
        .map_err(StorageError::other)?;
    Ok(())
}

/// One row of the orders/order_items join, decoupled from the driver so the
/// grouping logic stays unit-testable.
struct JoinedRow {
    order_uid: String,
    track_number: String,
    customer_id: String,
    delivery_service: String,
    date_created: DateTime<Utc>,
    payment_data: serde_json::Value,
    delivery_data: serde_json::Value,
    additional_data: serde_json::Value,
    item: Item,
}

impl JoinedRow {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(Self {
            order_uid: row.try_get("order_uid").map_err(StorageError::other)?,
            track_number: row.try_get("track_number").map_err(StorageError::other)?,
            customer_id: row.try_get("customer_id").map_err(StorageError::other)?,
            delivery_service: row
                .try_get("delivery_service")
                .map_err(StorageError::other)?,
            date_created: row.try_get("date_created").map_err(StorageError::other)?,
            payment_data: row.try_get("payment_data").map_err(StorageError::other)?,
            delivery_data: row.try_get("delivery_data").map_err(StorageError::other)?,
            additional_data: row
                .try_get("additional_data")
                .map_err(StorageError::other)?,
            item: Item {
                chrt_id: row.try_get("chrt_id").map_err(StorageError::other)?,
                track_number: row
                    .try_get("item_track_number")
                    .map_err(StorageError::other)?,
                price: row.try_get("price").map_err(StorageError::other)?,
                rid: row.try_get("rid").map_err(StorageError::other)?,
                name: row.try_get("name").map_err(StorageError::other)?,
                sale: row.try_get("sale").map_err(StorageError::other)?,
                size: row.try_get("size").map_err(StorageError::other)?,
                total_price: row.try_get("total_price").map_err(StorageError::other)?,
                nm_id: row.try_get("nm_id").map_err(StorageError::other)?,
                brand: row.try_get("brand").map_err(StorageError::other)?,
                status: row.try_get("status").map_err(StorageError::other)?,
            },
        })
    }

    fn header(&self) -> Result<Order, StorageError> {
        Ok(Order {
            order_uid: self.order_uid.clone(),
            track_number: self.track_number.clone(),
            customer_id: self.customer_id.clone(),
            delivery_service: self.delivery_service.clone(),
            date_created: self.date_created,
            items: Vec::new(),
            payment: serde_json::from_value(self.payment_data.clone())
                .map_err(StorageError::other)?,
            delivery: serde_json::from_value(self.delivery_data.clone())
                .map_err(StorageError::other)?,
            additional: serde_json::from_value(self.additional_data.clone())
                .map_err(StorageError::other)?,
        })
    }
}

/// Groups joined rows by `order_uid`: the first row of each order
/// materialises the header, every row contributes its item.
fn collect_orders(rows: Vec<JoinedRow>) -> Result<Vec<Order>, StorageError> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut orders: Vec<Order> = Vec::new();

    for row in rows {
        let slot = match index.get(&row.order_uid) {
            Some(&i) => i,
            None => {
                orders.push(row.header()?);
                index.insert(row.order_uid.clone(), orders.len() - 1);
                orders.len() - 1
            }
        };
        orders[slot].items.push(row.item);
    }

    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use model::{AdditionalData, Delivery, Payment};

    fn sample_row(order_uid: &str, chrt_id: i32) -> JoinedRow {
        let payment = Payment {
            transaction: order_uid.to_string(),
            request_id: String::new(),
            currency: "USD".to_string(),
            provider: "wbpay".to_string(),
            amount: 1817,
            payment_dt: 1637907727,
            bank: "alpha".to_string(),
            delivery_cost: 1500,
            goods_total: 317,
            custom_fee: 0,
        };
        let delivery = Delivery {
            name: "Test Testov".to_string(),
            phone: "+9720000000".to_string(),
            zip: "2639809".to_string(),
            city: "Kiryat Mozkin".to_string(),
            address: "Ploshad Mira 15".to_string(),
            region: "Kraiot".to_string(),
            email: "test@gmail.com".to_string(),
        };
        let additional = AdditionalData {
            entry: "WBIL".to_string(),
            locale: "en".to_string(),
            internal_signature: String::new(),
            shardkey: "9".to_string(),
            sm_id: 99,
            oof_shard: "1".to_string(),
        };

        JoinedRow {
            order_uid: order_uid.to_string(),
            track_number: "WBILMTESTTRACK".to_string(),
            customer_id: "test".to_string(),
            delivery_service: "meest".to_string(),
            date_created: Utc.with_ymd_and_hms(2021, 11, 26, 6, 22, 19).unwrap(),
            payment_data: serde_json::to_value(&payment).unwrap(),
            delivery_data: serde_json::to_value(&delivery).unwrap(),
            additional_data: serde_json::to_value(&additional).unwrap(),
            item: Item {
                chrt_id,
                track_number: "WBILMTESTTRACK".to_string(),
                price: 453.0,
                rid: "ab4219087a764ae0btest".to_string(),
                name: "Mascaras".to_string(),
                sale: 30.0,
                size: "0".to_string(),
                total_price: 317.0,
                nm_id: 2389212,
                brand: "Vivienne Sabo".to_string(),
                status: 202,
            },
        }
    }

    #[test]
    fn groups_multiple_items_under_one_order() {
        let rows = vec![sample_row("order-1", 1), sample_row("order-1", 2)];
        let orders = collect_orders(rows).unwrap();

        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_uid, "order-1");
        assert_eq!(orders[0].items.len(), 2);
        assert_eq!(orders[0].items[0].chrt_id, 1);
        assert_eq!(orders[0].items[1].chrt_id, 2);
        assert_eq!(orders[0].payment.amount, 1817);
    }

    #[test]
    fn groups_interleaved_orders() {
        let rows = vec![
            sample_row("order-1", 1),
            sample_row("order-2", 10),
            sample_row("order-1", 2),
        ];
        let orders = collect_orders(rows).unwrap();

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].items.len(), 2);
        assert_eq!(orders[1].order_uid, "order-2");
        assert_eq!(orders[1].items.len(), 1);
    }

    #[test]
    fn zero_rows_yield_no_orders() {
        assert!(collect_orders(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn header_rehydrates_sub_documents() {
        let order = sample_row("order-1", 1).header().unwrap();
        assert_eq!(order.delivery.city, "Kiryat Mozkin");
        assert_eq!(order.additional.shardkey, "9");
        assert!(order.items.is_empty());
    }
}
