//! Replication configuration, loadable from TOML or JSON.

use crate::broker::BrokerEndpoint;
use crate::compression::CompressionConfig;
use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use sysinfo::System;
use tracing::warn;

/// Queue bound used when total system memory cannot be determined.
const FALLBACK_QUEUE_LIMIT_BYTES: u64 = 256 * 1024 * 1024;

/// Broker connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address.
    pub endpoint: BrokerEndpoint,
    /// Fan-out topic the master publishes operations on.
    pub topic: String,
    /// Maximum payload of one initial-load message (bytes).
    pub initial_load_chunk_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: BrokerEndpoint::default(),
            topic: "opsync-operations".to_string(),
            initial_load_chunk_bytes: 1024 * 1024,
        }
    }
}

/// Outbound batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// How long an open batch may wait for more operations (ms).
    pub transmission_delay_ms: u64,
    /// Serialized batch size that forces an immediate flush (bytes).
    pub trigger_size_bytes: usize,
    /// Log throughput every this many submitted operations.
    pub stats_log_interval: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            transmission_delay_ms: 100,
            trigger_size_bytes: 1024 * 1024,
            stats_log_interval: 10_000,
        }
    }
}

impl BatchingConfig {
    /// Transmission delay as a duration.
    pub fn transmission_delay(&self) -> Duration {
        Duration::from_millis(self.transmission_delay_ms)
    }
}

/// Outbound send queue and sender loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendQueueConfig {
    /// Byte budget of queued and in-flight jobs. `None` uses a quarter of system memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queued_bytes: Option<u64>,
    /// Delay before retrying a failed publish (ms).
    pub retry_interval_ms: u64,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            max_queued_bytes: None,
            retry_interval_ms: 5000,
        }
    }
}

impl SendQueueConfig {
    /// Retry interval as a duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Effective byte budget.
    pub fn resolved_limit_bytes(&self) -> u64 {
        if let Some(limit) = self.max_queued_bytes {
            return limit;
        }
        let mut system = System::new();
        system.refresh_memory();
        match system.total_memory() {
            0 => {
                warn!(
                    fallback_bytes = FALLBACK_QUEUE_LIMIT_BYTES,
                    "total memory unknown, using fallback send queue limit"
                );
                FALLBACK_QUEUE_LIMIT_BYTES
            }
            total => total / 4,
        }
    }
}

/// Replica-side receiving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Interval of the warning logged while the broker connection is not yet obtained (ms).
    pub connection_watchdog_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            connection_watchdog_ms: 10_000,
        }
    }
}

impl ReceiverConfig {
    /// Watchdog interval as a duration.
    pub fn connection_watchdog(&self) -> Duration {
        Duration::from_millis(self.connection_watchdog_ms)
    }
}

/// Top-level replication configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Version this instance reports when registering with a master.
    pub server_version: String,
    /// Broker connectivity.
    pub broker: BrokerConfig,
    /// Outbound batching.
    pub batching: BatchingConfig,
    /// Outbound send queue.
    pub send_queue: SendQueueConfig,
    /// Block compression.
    pub compression: CompressionConfig,
    /// Replica-side receiving.
    pub receiver: ReceiverConfig,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            broker: BrokerConfig::default(),
            batching: BatchingConfig::default(),
            send_queue: SendQueueConfig::default(),
            compression: CompressionConfig::default(),
            receiver: ReceiverConfig::default(),
        }
    }
}

impl ReplConfig {
    /// Load a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ReplError::Config {
                msg: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| ReplError::Config {
                msg: e.to_string(),
            })?,
            _ => {
                return Err(ReplError::Config {
                    msg: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(ReplError::Config {
                msg: msg.to_string(),
            })
        };
        if self.broker.topic.is_empty() {
            return invalid("broker.topic must not be empty");
        }
        if self.broker.initial_load_chunk_bytes == 0 {
            return invalid("broker.initial_load_chunk_bytes must be positive");
        }
        if self.batching.trigger_size_bytes == 0 {
            return invalid("batching.trigger_size_bytes must be positive");
        }
        if self.batching.stats_log_interval == 0 {
            return invalid("batching.stats_log_interval must be positive");
        }
        if self.send_queue.max_queued_bytes == Some(0) {
            return invalid("send_queue.max_queued_bytes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionAlgo;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_values() {
        let config = ReplConfig::default();
        assert_eq!(config.batching.transmission_delay(), Duration::from_millis(100));
        assert_eq!(config.batching.trigger_size_bytes, 1024 * 1024);
        assert_eq!(config.batching.stats_log_interval, 10_000);
        assert_eq!(config.send_queue.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.receiver.connection_watchdog(), Duration::from_secs(10));
        assert_eq!(config.compression.algo, CompressionAlgo::Lz4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_queue_limit_wins() {
        let config = SendQueueConfig {
            max_queued_bytes: Some(4096),
            ..Default::default()
        };
        assert_eq!(config.resolved_limit_bytes(), 4096);
    }

    #[test]
    fn test_default_queue_limit_is_positive() {
        assert!(SendQueueConfig::default().resolved_limit_bytes() > 0);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
server_version = "2.1"

[broker]
topic = "races"

[broker.endpoint]
host = "mq.internal"
port = 5673

[batching]
transmission_delay_ms = 250

[compression]
algo = "zstd"
"#
        )
        .unwrap();

        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_version, "2.1");
        assert_eq!(config.broker.topic, "races");
        assert_eq!(config.broker.endpoint, BrokerEndpoint::new("mq.internal", 5673));
        assert_eq!(config.batching.transmission_delay_ms, 250);
        assert_eq!(config.batching.trigger_size_bytes, 1024 * 1024);
        assert_eq!(config.compression.algo, CompressionAlgo::Zstd);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"send_queue": {{"max_queued_bytes": 1048576, "retry_interval_ms": 50}}}}"#
        )
        .unwrap();

        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.send_queue.max_queued_bytes, Some(1_048_576));
        assert_eq!(config.send_queue.retry_interval_ms, 50);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        let err = ReplConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ReplError::Config { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ReplConfig::default();
        config.batching.trigger_size_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = ReplConfig::default();
        config.broker.topic.clear();
        assert!(config.validate().is_err());
    }
}
