use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the scheduler maps a unit of work onto the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// One tokio task per unit of work.
    #[default]
    Task,
    /// One blocking-pool OS thread per unit of work.
    Thread,
}

/// Per-connection handler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Simulated I/O latency before the request is read.
    pub io_delay: Duration,
    pub read_buffer_size: usize,
    pub read_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            io_delay: Duration::from_millis(100),
            read_buffer_size: 1024,
            read_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// 0 asks the OS for an ephemeral port.
    pub port: u16,
    pub spawn_mode: SpawnMode,
    pub handler: HandlerConfig,
    /// Upper bound on the graceful drain before in-flight work is aborted.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            spawn_mode: SpawnMode::default(),
            handler: HandlerConfig::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn with_port(port: u16) -> Self {
        ServerConfig {
            port,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.spawn_mode, SpawnMode::Task);
        assert_eq!(cfg.handler.io_delay, Duration::from_millis(100));
        assert_eq!(cfg.handler.read_buffer_size, 1024);
        assert!(cfg.host.is_loopback());
    }

    #[test]
    fn test_spawn_mode_serializes_lowercase() {
        let json = serde_json::to_string(&SpawnMode::Thread).unwrap();
        assert_eq!(json, "\"thread\"");
        let back: SpawnMode = serde_json::from_str("\"task\"").unwrap();
        assert_eq!(back, SpawnMode::Task);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "host": "0.0.0.0",
            "port": 9000,
            "spawn_mode": "thread",
            "handler": {
                "io_delay": { "secs": 0, "nanos": 50000000 },
                "read_buffer_size": 512,
                "read_timeout": { "secs": 1, "nanos": 0 }
            },
            "drain_timeout": { "secs": 2, "nanos": 0 }
        }"#;
        let cfg: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.spawn_mode, SpawnMode::Thread);
        assert_eq!(cfg.handler.io_delay, Duration::from_millis(50));
        assert_eq!(cfg.drain_timeout, Duration::from_secs(2));
    }
}
