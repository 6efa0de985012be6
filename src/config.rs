//! Configuration management for Courier Server

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub presence: PresenceConfig,
    pub fanout: FanoutConfig,
    pub calls: CallsConfig,
    pub admin: AdminConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
    /// How often due scheduled messages are promoted to live messages.
    pub scheduler_interval_ms: u64,
    pub session_ttl_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// A user with no heartbeat for this long is moved to `offline`.
    pub liveness_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub typing_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Per-topic buffer. A subscriber further behind than this loses the
    /// oldest events and is told to resync.
    pub topic_capacity: usize,
    /// Frames queued per WebSocket before its forwarders start dropping and
    /// ask the client to resync.
    #[serde(default = "default_socket_buffer")]
    pub socket_buffer: usize,
}

fn default_socket_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    pub ring_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub master_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_message_chars: usize,
    pub max_page_size: i64,
    pub max_emoji_bytes: usize,
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            Ok(config)
        }
    }
}

impl PresenceConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9443,
            },
            storage: StorageConfig {
                database_path: "./data/courier.db".to_string(),
                scheduler_interval_ms: 1000,
                session_ttl_hours: 24 * 30,
            },
            presence: PresenceConfig {
                liveness_timeout_secs: 45,
                sweep_interval_secs: 5,
                typing_ttl_ms: 3000,
            },
            fanout: FanoutConfig {
                topic_capacity: 256,
                socket_buffer: default_socket_buffer(),
            },
            calls: CallsConfig { ring_timeout_secs: 45 },
            admin: AdminConfig {
                master_key: "CHANGE-THIS-ADMIN-KEY-IMMEDIATELY".to_string(),
            },
            limits: LimitsConfig {
                max_message_chars: 4096,
                max_page_size: 200,
                max_emoji_bytes: 32,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_toml() {
        let content = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&content).unwrap();
        assert_eq!(parsed.presence.typing_ttl(), Duration::from_secs(3));
        assert_eq!(parsed.fanout.topic_capacity, 256);
    }
}
