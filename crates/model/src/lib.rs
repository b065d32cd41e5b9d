use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery — recipient and destination details for an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub name: String,
    pub phone: String,
    pub zip: String,
    pub city: String,
    pub address: String,
    pub region: String,
    pub email: String,
}

/// Payment — transaction details for an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    pub transaction: String,
    pub request_id: String,
    pub currency: String,
    pub provider: String,
    pub amount: i64,
    pub payment_dt: i64,
    pub bank: String,
    pub delivery_cost: i64,
    pub goods_total: i64,
    pub custom_fee: i64,
}

/// AdditionalData — ancillary order metadata. Flattened into the order
/// document on the wire, stored as one JSONB sub-document in the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdditionalData {
    pub entry: String,
    pub locale: String,
    pub internal_signature: String,
    pub shardkey: String,
    pub sm_id: i32,
    pub oof_shard: String,
}

/// Item — a single order line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub chrt_id: i32,
    pub track_number: String,
    pub price: f64,
    pub rid: String,
    pub name: String,
    pub sale: f64,
    pub size: String,
    pub total_price: f64,
    pub nm_id: i32,
    pub brand: String,
    pub status: i32,
}

/// Order — the root aggregate, identified by `order_uid` everywhere:
/// broker message key, cache key and database primary key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_uid: String,
    pub track_number: String,
    pub customer_id: String,
    pub delivery_service: String,
    pub date_created: DateTime<Utc>,
    pub items: Vec<Item>,
    pub delivery: Delivery,
    pub payment: Payment,
    #[serde(flatten)]
    pub additional: AdditionalData,
}

#[cfg(test)]
mod tests {
    use super::Order;
    use chrono::{TimeZone, Utc};

    const CANONICAL: &str = r#"
    {
       "order_uid": "b563feb7b2b84b6test",
       "track_number": "WBILMTESTTRACK",
       "entry": "WBIL",
       "delivery": {
          "name": "Test Testov",
          "phone": "+9720000000",
          "zip": "2639809",
          "city": "Kiryat Mozkin",
          "address": "Ploshad Mira 15",
          "region": "Kraiot",
          "email": "test@gmail.com"
       },
       "payment": {
          "transaction": "b563feb7b2b84b6test",
          "request_id": "",
          "currency": "USD",
          "provider": "wbpay",
          "amount": 1817,
          "payment_dt": 1637907727,
          "bank": "alpha",
          "delivery_cost": 1500,
          "goods_total": 317,
          "custom_fee": 0
       },
       "items": [
          {
             "chrt_id": 9934930,
             "track_number": "WBILMTESTTRACK",
             "price": 453,
             "rid": "ab4219087a764ae0btest",
             "name": "Mascaras",
             "sale": 30,
             "size": "0",
             "total_price": 317,
             "nm_id": 2389212,
             "brand": "Vivienne Sabo",
             "status": 202
          }
       ],
       "locale": "en",
       "internal_signature": "",
       "customer_id": "test",
       "delivery_service": "meest",
       "shardkey": "9",
       "sm_id": 99,
       "date_created": "2021-11-26T06:22:19Z",
       "oof_shard": "1"
    }
    "#;

    #[test]
    fn deserialize_canonical_order() {
        let order: Order = serde_json::from_str(CANONICAL).unwrap();
        assert_eq!(order.order_uid, "b563feb7b2b84b6test");
        assert_eq!(order.customer_id, "test");
        assert_eq!(order.additional.entry, "WBIL");
        assert_eq!(order.additional.sm_id, 99);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].chrt_id, 9934930);
        assert_eq!(order.items[0].total_price, 317.0);
        assert_eq!(order.payment.amount, 1817);

        let expected = Utc.with_ymd_and_hms(2021, 11, 26, 6, 22, 19).unwrap();
        assert_eq!(order.date_created, expected);
    }

    #[test]
    fn flattened_metadata_stays_on_the_top_level() {
        let order: Order = serde_json::from_str(CANONICAL).unwrap();
        let value = serde_json::to_value(&order).unwrap();

        assert_eq!(value["locale"], "en");
        assert_eq!(value["oof_shard"], "1");
        assert!(value.get("additional").is_none());
    }

    #[test]
    fn round_trip_preserves_sub_documents() {
        let order: Order = serde_json::from_str(CANONICAL).unwrap();
        let encoded = serde_json::to_string(&order).unwrap();
        let decoded: Order = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, order);
    }
}
