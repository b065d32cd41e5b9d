use std::time::Duration;

use app_config::{AppConfig, PoisonAction};

const SAMPLE: &str = r#"
env: "local"

postgres:
  username: "orders_user"
  password: "securepassword"
  host: "localhost"
  port: 5432
  database: "orders_db"

redis:
  host: "localhost"
  port: 6379
  db: 0

kafka:
  bootstrap_servers:
    - "localhost:9092"
  topic: "orders"
  producer:
    acks: "all"
    enable_idempotence: true
    retries: 5
    transactional_id: "order-generator"
  consumer:
    group_id: "orders_group"

http_server:
  address: "localhost:8082"
  timeout: "4s"
"#;

#[test]
fn load_sample_config() {
    let path = std::env::temp_dir().join("order-pipeline-config-test.yaml");
    std::fs::write(&path, SAMPLE).unwrap();
    std::env::set_var("CONFIG_PATH", &path);

    let cfg = AppConfig::load().unwrap();

    assert_eq!(cfg.env, "local");
    assert_eq!(cfg.postgres.host, "localhost");
    assert_eq!(cfg.postgres.port, 5432);
    assert_eq!(cfg.redis.db, 0);
    assert_eq!(cfg.kafka.bootstrap_servers, vec!["localhost:9092"]);
    assert_eq!(cfg.kafka.producer.acks, "all");
    assert!(cfg.kafka.producer.enable_idempotence);

    // Defaults for the knobs the sample file leaves out.
    assert_eq!(cfg.kafka.consumer.auto_offset_reset, "earliest");
    assert!(!cfg.kafka.consumer.enable_auto_commit);
    assert_eq!(cfg.kafka.consumer.isolation_level, "read_committed");
    assert_eq!(cfg.kafka.consumer.on_poison, PoisonAction::Redeliver);
    assert_eq!(cfg.http_server.timeout, Duration::from_secs(4));
    assert_eq!(cfg.http_server.idle_timeout, Duration::from_secs(60));
}
