use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// `AppConfig` holds all configuration parameters required by the service.
///
/// Configuration is loaded from a YAML file pointed at by the required
/// `CONFIG_PATH` environment variable; individual values can be overridden
/// through environment variables (separator `__`, e.g.
/// `POSTGRES__PASSWORD`). A `.env` file is honoured when present.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Deployment environment name ("local", "dev", "prod"). Drives logger setup.
    pub env: String,
    pub postgres: Postgres,
    pub redis: Redis,
    pub kafka: Kafka,
    pub http_server: HttpServer,
}

/// PostgreSQL connection parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Postgres {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

/// Redis connection parameters for the order cache.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Redis {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: String,
}

/// Kafka parameters shared by the consumer side and the producer side.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Kafka {
    pub bootstrap_servers: Vec<String>,
    pub topic: String,
    pub producer: Producer,
    pub consumer: Consumer,
}

/// Producer settings, used by the order generator and the dead-letter
/// producer.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Producer {
    pub acks: String,
    #[serde(default)]
    pub enable_idempotence: bool,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub transactional_id: String,
}

/// What to do with a message whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoisonAction {
    /// Leave the offset unadvanced so the broker re-delivers. The original
    /// contract; loops forever on a truly poisoned message.
    #[default]
    Redeliver,
    /// Acknowledge the message so the offset moves past it.
    Skip,
    /// Publish the raw message to `dead_letter_topic`, then acknowledge.
    DeadLetter,
}

/// Consumer settings. `enable_auto_commit` is carried for the config
/// contract but the pipeline requires manual commits; a `true` here is
/// overridden with a warning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Consumer {
    pub group_id: String,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default)]
    pub enable_auto_commit: bool,
    #[serde(default)]
    pub security_protocol: Option<String>,
    #[serde(default = "default_isolation_level")]
    pub isolation_level: String,
    #[serde(default)]
    pub on_poison: PoisonAction,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
}

/// Embedded HTTP server parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HttpServer {
    pub address: String,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default = "default_idle_timeout", deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_isolation_level() -> String {
    "read_committed".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(4)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Custom deserializer for duration fields.
/// Accepts human-readable formats like "4s", "1m".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from the YAML file named by `CONFIG_PATH`, with
    /// environment-variable overrides layered on top.
    ///
    /// # Errors
    /// Returns an error if `CONFIG_PATH` is unset, the file is missing, or
    /// the merged configuration fails to parse. Callers treat any of these
    /// as fatal at startup.
    pub fn load() -> Result<Self> {
        // Load from a .env file when running outside of Docker.
        dotenvy::dotenv().ok();

        let config_path =
            std::env::var("CONFIG_PATH").context("CONFIG_PATH is not set")?;
        if !Path::new(&config_path).exists() {
            bail!("config file does not exist: {config_path}");
        }

        let settings = config::Config::builder()
            .add_source(config::File::new(&config_path, config::FileFormat::Yaml))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("failed to read configuration")?;

        settings
            .try_deserialize()
            .context("failed to parse configuration")
    }
}
