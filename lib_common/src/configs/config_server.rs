use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::{read_config_file, ConfigError};
use crate::core::RetryPolicy;
use crate::pipeline::WriteBufferConfig;
use crate::storage::InfluxConfig;

/// Default JSON config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "server_ingest.conf";

/// InfluxDB Cloud endpoint used when no host is configured.
pub const DEFAULT_INFLUX_HOST: &str = "https://us-east-1-1.aws.cloud2.influxdata.com";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Sensor ingest server: buffers readings into InfluxDB and serves the dashboard API", version)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[clap(long, env = "SENSORHUB_PORT", help = "Port to listen on.")]
    pub port: Option<u16>,

    #[clap(long, env = "SENSORHUB_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SENSORHUB_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SENSORHUB_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SENSORHUB_STORE", help = "Time-series backend: influx or memory.")]
    pub store: Option<String>,

    #[clap(long, env = "SENSORHUB_INFLUX_HOST", help = "InfluxDB base URL.")]
    pub influx_host: Option<String>,

    #[clap(long, env = "SENSORHUB_INFLUX_ORG", help = "InfluxDB organisation.")]
    pub influx_org: Option<String>,

    #[clap(long, env = "SENSORHUB_INFLUX_BUCKET", help = "InfluxDB bucket (database).")]
    pub influx_bucket: Option<String>,

    #[clap(long, env = "SENSORHUB_INFLUX_TOKEN", help = "InfluxDB API token.")]
    pub influx_token: Option<String>,

    #[clap(long, env = "SENSORHUB_DEFAULT_USER", help = "User readings are stored under when the request names no known user.")]
    pub default_user: Option<String>,

    #[clap(long, env = "SENSORHUB_KNOWN_USERS", value_delimiter = ',', help = "Comma separated users accepted from the X-Sensor-User header.")]
    pub known_users: Option<Vec<String>>,

    #[clap(long, env = "SENSORHUB_DEFAULT_DEVICE", help = "Device shown by /api/dashboard.")]
    pub default_device: Option<String>,

    #[clap(long, env = "SENSORHUB_QUERY_WINDOW_MINUTES", help = "Default query window in minutes.")]
    pub query_window_minutes: Option<u64>,

    #[clap(long, env = "SENSORHUB_BATCH_SIZE", help = "Readings per store write.")]
    pub batch_size: Option<usize>,

    #[clap(long, env = "SENSORHUB_FLUSH_INTERVAL_MS", help = "Flush period of the write buffer in milliseconds.")]
    pub flush_interval_ms: Option<u64>,

    #[clap(long, env = "SENSORHUB_QUEUE_CAPACITY", help = "Capacity of the write queue.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "SENSORHUB_ENQUEUE_TIMEOUT_MS", help = "How long a request waits for room in a full queue before 503.")]
    pub enqueue_timeout_ms: Option<u64>,

    #[clap(long, env = "SENSORHUB_WRITE_ATTEMPTS", help = "Store write attempts per flush.")]
    pub write_attempts: Option<usize>,

    #[clap(long, env = "SENSORHUB_RETRY_BASE_MS", help = "First retry delay of a failed flush in milliseconds.")]
    pub retry_base_ms: Option<u64>,

    #[clap(long, env = "SENSORHUB_RETRY_MAX_MS", help = "Retry delay cap in milliseconds.")]
    pub retry_max_ms: Option<u64>,

    #[clap(long, env = "SENSORHUB_MAX_PENDING", help = "Readings held while the store is failing before the oldest are dropped.")]
    pub max_pending: Option<usize>,

    #[clap(long, env = "SENSORHUB_DEDUPE_CAPACITY", help = "Idempotency keys remembered for duplicate suppression.")]
    pub dedupe_capacity: Option<usize>,
}

impl ServerConfig {
    /// Built-in defaults. Influx credentials have none.
    pub fn defaults() -> Self {
        ServerConfig {
            port: Some(5001),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            store: Some("influx".to_string()),
            influx_host: Some(DEFAULT_INFLUX_HOST.to_string()),
            default_user: Some("default".to_string()),
            known_users: Some(Vec::new()),
            default_device: Some("eui-323932326d306512".to_string()),
            query_window_minutes: Some(120),
            batch_size: Some(500),
            flush_interval_ms: Some(1000),
            queue_capacity: Some(10_000),
            enqueue_timeout_ms: Some(2000),
            write_attempts: Some(5),
            retry_base_ms: Some(500),
            retry_max_ms: Some(30_000),
            max_pending: Some(50_000),
            dedupe_capacity: Some(4096),
            ..Default::default()
        }
    }

    // Merge two configs, where 'other' overrides 'self' for Some values
    fn merge(self, other: ServerConfig) -> ServerConfig {
        ServerConfig {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            store: other.store.or(self.store),
            influx_host: other.influx_host.or(self.influx_host),
            influx_org: other.influx_org.or(self.influx_org),
            influx_bucket: other.influx_bucket.or(self.influx_bucket),
            influx_token: other.influx_token.or(self.influx_token),
            default_user: other.default_user.or(self.default_user),
            known_users: other.known_users.or(self.known_users),
            default_device: other.default_device.or(self.default_device),
            query_window_minutes: other.query_window_minutes.or(self.query_window_minutes),
            batch_size: other.batch_size.or(self.batch_size),
            flush_interval_ms: other.flush_interval_ms.or(self.flush_interval_ms),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            enqueue_timeout_ms: other.enqueue_timeout_ms.or(self.enqueue_timeout_ms),
            write_attempts: other.write_attempts.or(self.write_attempts),
            retry_base_ms: other.retry_base_ms.or(self.retry_base_ms),
            retry_max_ms: other.retry_max_ms.or(self.retry_max_ms),
            max_pending: other.max_pending.or(self.max_pending),
            dedupe_capacity: other.dedupe_capacity.or(self.dedupe_capacity),
        }
    }

    /// Layers defaults, the JSON file and `cli` (already parsed, env included)
    /// and resolves the result.
    pub fn load(cli: ServerConfig) -> Result<ServerSettings, ConfigError> {
        let path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut merged = Self::defaults();
        if let Some(file_config) = read_config_file::<ServerConfig>(&path)? {
            merged = merged.merge(file_config);
        }
        merged.merge(cli).resolve()
    }

    /// Turns a merged config into settings. Unset values take the defaults.
    pub fn resolve(self) -> Result<ServerSettings, ConfigError> {
        let d = Self::defaults().merge(self);

        let store = match d.store.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("memory") => StoreBackend::Memory,
            Some("influx") | None => {
                let host = d
                    .influx_host
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_INFLUX_HOST.to_string());
                let org = d.influx_org.filter(|s| !s.is_empty()).ok_or(ConfigError::Missing("influxOrg"))?;
                let bucket = d
                    .influx_bucket
                    .filter(|s| !s.is_empty())
                    .ok_or(ConfigError::Missing("influxBucket"))?;
                let token = d
                    .influx_token
                    .filter(|s| !s.is_empty())
                    .ok_or(ConfigError::Missing("influxToken"))?;
                StoreBackend::Influx(InfluxConfig::new(&host, &org, &bucket, &token))
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    field: "store",
                    value: other.to_string(),
                })
            }
        };

        let batch_size = d.batch_size.unwrap_or(500);
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batchSize",
                value: "0".to_string(),
            });
        }

        let retry = RetryPolicy::new(
            Duration::from_millis(d.retry_base_ms.unwrap_or(500)),
            Duration::from_millis(d.retry_max_ms.unwrap_or(30_000)),
        )
        .with_max_attempts(d.write_attempts.unwrap_or(5));

        Ok(ServerSettings {
            port: d.port.unwrap_or(5001),
            log_dir: d.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: d.log_level.unwrap_or_else(|| "info".to_string()),
            store,
            default_user: d.default_user.unwrap_or_else(|| "default".to_string()),
            known_users: d.known_users.unwrap_or_default(),
            default_device: d.default_device.unwrap_or_default(),
            query_window: Duration::from_secs(d.query_window_minutes.unwrap_or(120).max(1).saturating_mul(60)),
            write_buffer: WriteBufferConfig {
                batch_size,
                flush_interval: Duration::from_millis(d.flush_interval_ms.unwrap_or(1000).max(1)),
                queue_capacity: d.queue_capacity.unwrap_or(10_000).max(1),
                enqueue_timeout: Duration::from_millis(d.enqueue_timeout_ms.unwrap_or(2000)),
                retry,
                max_pending: d.max_pending.unwrap_or(50_000).max(batch_size),
                dedupe_capacity: d.dedupe_capacity.unwrap_or(4096),
            },
        })
    }
}

/// Where readings are stored.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// InfluxDB over HTTP.
    Influx(InfluxConfig),
    /// Process memory; for trying things out.
    Memory,
}

/// Resolved `server_ingest` settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub store: StoreBackend,
    pub default_user: String,
    pub known_users: Vec<String>,
    pub default_device: String,
    pub query_window: Duration,
    pub write_buffer: WriteBufferConfig,
}
