//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker threads are never fewer than this, whatever the config says.
pub const MIN_WORKER_THREADS: usize = 2;

/// Root configuration for the TLS echo server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener, worker pool and admission settings.
    pub server: ListenerConfig,

    /// Certificate and key material.
    pub tls: TlsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// How a session answers the bytes it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Every chunk is written back as soon as it is read.
    Echo,
    /// Chunks are accumulated per client and flushed once, on close.
    #[default]
    Aggregate,
}

impl std::str::FromStr for PipelineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "echo" => Ok(PipelineMode::Echo),
            "aggregate" => Ok(PipelineMode::Aggregate),
            other => Err(format!("unknown pipeline mode '{}'", other)),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// IP address to bind (e.g., "0.0.0.0").
    pub bind_ip: String,

    /// TCP port. `0` picks an ephemeral port on first start.
    pub port: u16,

    /// Requested reactor worker threads (floored to [`MIN_WORKER_THREADS`]).
    pub worker_threads: usize,

    /// Active connection ceiling above which the acceptor goes deaf.
    pub max_connections: usize,

    /// Cool-down spent in the deaf state, in seconds.
    pub connection_timeout_secs: u64,

    /// Echo every chunk or aggregate until close.
    pub pipeline: PipelineMode,

    /// Upper bound for a single read snapshot, in bytes.
    pub read_buffer_size: usize,
}

impl ListenerConfig {
    /// Worker count after applying the floor.
    pub fn effective_worker_threads(&self) -> usize {
        self.worker_threads.max(MIN_WORKER_THREADS)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            port: 8443,
            worker_threads: 4,
            max_connections: 10_000,
            connection_timeout_secs: 5,
            pipeline: PipelineMode::default(),
            read_buffer_size: 16 * 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Optional CA bundle (PEM) used to verify client certificates.
    pub client_ca_path: Option<String>,

    /// Reject clients that present no certificate. Only meaningful with `client_ca_path`.
    pub require_client_cert: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "certs/server.crt".to_string(),
            key_path: "certs/server.key".to_string(),
            client_ca_path: None,
            require_client_cert: false,
        }
    }
}

/// Timeout configuration for session stages. Zero disables a timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TLS handshake deadline in seconds.
    pub handshake_secs: u64,

    /// Maximum time a session may wait for its next chunk, in seconds.
    pub idle_secs: u64,

    /// How long `shutdown` waits for sessions to drain, in seconds.
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Option<Duration> {
        non_zero_secs(self.handshake_secs)
    }

    pub fn idle(&self) -> Option<Duration> {
        non_zero_secs(self.idle_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: 10,
            idle_secs: 0,
            shutdown_grace_secs: 5,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
