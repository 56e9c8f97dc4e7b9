use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::{read_config_file, ConfigError};
use crate::core::RetryPolicy;
use crate::ingestors::SerialDeviceConfig;

/// Default JSON config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "serial_reader.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Reads sensor lines from USB serial ports and forwards them to the ingest server", version)]
#[serde(rename_all = "camelCase")]
pub struct ReaderConfig {
    #[clap(long, env = "READER_URL", help = "Ingest server write URL.")]
    pub url: Option<String>,

    #[clap(long, env = "READER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "READER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "READER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "READER_PORTS", value_delimiter = ',', help = "Comma separated serial ports. Empty means every USB port found at startup.")]
    pub ports: Option<Vec<String>>,

    #[clap(long, env = "READER_BAUD_RATE", help = "Serial baud rate.")]
    pub baud_rate: Option<u32>,

    #[clap(long, env = "READER_MAX_LINE_LENGTH", help = "Longest accepted line in bytes.")]
    pub max_line_length: Option<usize>,

    #[clap(long, env = "READER_RECONNECT_BASE_MS", help = "First reconnect delay in milliseconds.")]
    pub reconnect_base_ms: Option<u64>,

    #[clap(long, env = "READER_RECONNECT_MAX_MS", help = "Reconnect delay cap in milliseconds.")]
    pub reconnect_max_ms: Option<u64>,

    #[clap(long, env = "READER_IDLE_TIMEOUT_SECS", help = "Seconds without data before reconnecting (0 disables).")]
    pub idle_timeout_secs: Option<u64>,

    #[clap(long, env = "READER_QUEUE_CAPACITY", help = "Lines buffered between the ports and the forwarder.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "READER_FORWARD_ATTEMPTS", help = "Delivery attempts per line.")]
    pub forward_attempts: Option<usize>,

    #[clap(long, env = "READER_FORWARD_RETRY_BASE_MS", help = "First delivery retry delay in milliseconds.")]
    pub forward_retry_base_ms: Option<u64>,

    #[clap(long, env = "READER_FORWARD_RETRY_MAX_MS", help = "Delivery retry delay cap in milliseconds.")]
    pub forward_retry_max_ms: Option<u64>,

    #[clap(long, env = "READER_REQUEST_TIMEOUT_MS", help = "Timeout of one delivery request in milliseconds.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "READER_TRANSPORT_RETRIES", help = "Quick resends inside one delivery attempt after a connection error or 5xx.")]
    pub transport_retries: Option<u32>,

    #[clap(long, env = "READER_USER", help = "User sent in the X-Sensor-User header.")]
    pub user: Option<String>,

    #[clap(long, env = "READER_PORT_LINGER_SECS", help = "Seconds a dropped port stays reserved for its device.")]
    pub port_linger_secs: Option<u64>,
}

impl ReaderConfig {
    pub fn defaults() -> Self {
        ReaderConfig {
            url: Some("http://localhost:5001/write".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ports: Some(Vec::new()),
            baud_rate: Some(9600),
            max_line_length: Some(256),
            reconnect_base_ms: Some(5000),
            reconnect_max_ms: Some(60_000),
            idle_timeout_secs: Some(0),
            queue_capacity: Some(1024),
            forward_attempts: Some(5),
            forward_retry_base_ms: Some(500),
            forward_retry_max_ms: Some(30_000),
            request_timeout_ms: Some(10_000),
            transport_retries: Some(2),
            port_linger_secs: Some(10),
            ..Default::default()
        }
    }

    // Merge two configs, where 'other' overrides 'self' for Some values
    fn merge(self, other: ReaderConfig) -> ReaderConfig {
        ReaderConfig {
            url: other.url.or(self.url),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            ports: other.ports.or(self.ports),
            baud_rate: other.baud_rate.or(self.baud_rate),
            max_line_length: other.max_line_length.or(self.max_line_length),
            reconnect_base_ms: other.reconnect_base_ms.or(self.reconnect_base_ms),
            reconnect_max_ms: other.reconnect_max_ms.or(self.reconnect_max_ms),
            idle_timeout_secs: other.idle_timeout_secs.or(self.idle_timeout_secs),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            forward_attempts: other.forward_attempts.or(self.forward_attempts),
            forward_retry_base_ms: other.forward_retry_base_ms.or(self.forward_retry_base_ms),
            forward_retry_max_ms: other.forward_retry_max_ms.or(self.forward_retry_max_ms),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            transport_retries: other.transport_retries.or(self.transport_retries),
            user: other.user.or(self.user),
            port_linger_secs: other.port_linger_secs.or(self.port_linger_secs),
        }
    }

    /// Layers defaults, the JSON file and `cli`, then resolves.
    pub fn load(cli: ReaderConfig) -> Result<ReaderSettings, ConfigError> {
        let path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut merged = Self::defaults();
        if let Some(file_config) = read_config_file::<ReaderConfig>(&path)? {
            merged = merged.merge(file_config);
        }
        merged.merge(cli).resolve()
    }

    pub fn resolve(self) -> Result<ReaderSettings, ConfigError> {
        let d = Self::defaults().merge(self);

        let url = d.url.unwrap_or_default();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid { field: "url", value: url });
        }

        let baud_rate = d.baud_rate.unwrap_or(9600);
        if baud_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "baudRate",
                value: "0".to_string(),
            });
        }

        let ports: Vec<String> = d
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let device = SerialDeviceConfig {
            name: String::new(),
            port: None,
            baud_rate,
            max_line_length: d.max_line_length.unwrap_or(256).max(1),
            reconnect_delay: Duration::from_millis(d.reconnect_base_ms.unwrap_or(5000)),
            reconnect_max_delay: Duration::from_millis(d.reconnect_max_ms.unwrap_or(60_000)),
            idle_timeout: match d.idle_timeout_secs.unwrap_or(0) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };

        Ok(ReaderSettings {
            url,
            log_dir: d.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: d.log_level.unwrap_or_else(|| "info".to_string()),
            ports,
            device,
            queue_capacity: d.queue_capacity.unwrap_or(1024).max(1),
            forward_policy: RetryPolicy::new(
                Duration::from_millis(d.forward_retry_base_ms.unwrap_or(500)),
                Duration::from_millis(d.forward_retry_max_ms.unwrap_or(30_000)),
            )
            .with_max_attempts(d.forward_attempts.unwrap_or(5)),
            request_timeout: Duration::from_millis(d.request_timeout_ms.unwrap_or(10_000)),
            transport_retries: d.transport_retries.unwrap_or(2),
            user: d.user.filter(|u| !u.trim().is_empty()),
            port_linger: Duration::from_secs(d.port_linger_secs.unwrap_or(10)),
        })
    }
}

/// Resolved `serial_reader` settings.
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub url: String,
    pub log_dir: PathBuf,
    pub log_level: String,
    /// Explicit ports; empty means discover.
    pub ports: Vec<String>,
    /// Template for every device; name and port are filled per device.
    pub device: SerialDeviceConfig,
    pub queue_capacity: usize,
    pub forward_policy: RetryPolicy,
    pub request_timeout: Duration,
    /// Resends left to the HTTP client's retry middleware per attempt.
    pub transport_retries: u32,
    pub user: Option<String>,
    pub port_linger: Duration,
}

impl ReaderSettings {
    /// One device config per explicit port, or `discovered` unpinned devices.
    pub fn device_configs(&self, discovered: usize) -> Vec<SerialDeviceConfig> {
        if self.ports.is_empty() {
            (0..discovered.max(1))
                .map(|i| SerialDeviceConfig {
                    name: format!("serial-{}", i),
                    port: None,
                    ..self.device.clone()
                })
                .collect()
        } else {
            self.ports
                .iter()
                .enumerate()
                .map(|(i, port)| SerialDeviceConfig {
                    name: format!("serial-{}", i),
                    port: Some(port.clone()),
                    ..self.device.clone()
                })
                .collect()
        }
    }
}
