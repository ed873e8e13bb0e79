//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber for the binary
//! - Define the event sink the connection engine reports through
//! - Map sink calls to structured `tracing` events
//!
//! # Design Decisions
//! - Sink methods return nothing; the engine never branches on logging
//! - JSON format for production, pretty format for development
//! - Log level configurable via config and `RUST_LOG`

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};
use crate::net::connection::ClientId;

/// Server-wide lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Started { workers: usize, address: SocketAddr },
    Listening,
    Deaf { active_connections: usize, cool_down: Duration },
    ShuttingDown,
    Stopped { purged: usize },
}

/// Events in the life of one client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Accepted { peer: Option<SocketAddr> },
    HandshakeSucceeded,
    ChunkReceived { bytes: usize },
    Flushed { bytes: usize },
    IdleTimeout,
    Closed,
}

/// Where in the engine an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    Accept,
    Handshake,
    Read,
    Write,
    Teardown,
    Shutdown,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorStage::Accept => "accept",
            ErrorStage::Handshake => "handshake",
            ErrorStage::Read => "read",
            ErrorStage::Write => "write",
            ErrorStage::Teardown => "teardown",
            ErrorStage::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// An error reported to the sink: an OS error code when there is one, and a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub stage: ErrorStage,
    pub client: Option<ClientId>,
    pub code: Option<i32>,
    pub message: String,
}

impl ErrorEvent {
    pub fn io(stage: ErrorStage, client: Option<ClientId>, error: &io::Error) -> Self {
        Self {
            stage,
            client,
            code: error.raw_os_error(),
            message: error.to_string(),
        }
    }

    pub fn message(stage: ErrorStage, client: Option<ClientId>, message: impl Into<String>) -> Self {
        Self {
            stage,
            client,
            code: None,
            message: message.into(),
        }
    }
}

/// Receiver of everything the connection engine reports.
pub trait EventSink: Send + Sync + 'static {
    fn server_event(&self, event: ServerEvent);

    fn client_event(&self, client: ClientId, event: ClientEvent);

    fn error_event(&self, event: ErrorEvent);

    /// Raw bytes read from a client.
    fn received(&self, client: ClientId, content: &[u8]);

    /// Raw bytes written to a client.
    fn sent(&self, client: ClientId, content: &[u8]);
}

/// Default sink: every call becomes a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Started { workers, address } => {
                tracing::info!(workers, address = %address, "Server started")
            }
            ServerEvent::Listening => tracing::info!("Listening state"),
            ServerEvent::Deaf {
                active_connections,
                cool_down,
            } => tracing::warn!(
                active_connections,
                cool_down = ?cool_down,
                "Max connections reached, deaf state"
            ),
            ServerEvent::ShuttingDown => tracing::info!("Shutting down"),
            ServerEvent::Stopped { purged } => tracing::info!(purged, "Shutdown complete"),
        }
    }

    fn client_event(&self, client: ClientId, event: ClientEvent) {
        match event {
            ClientEvent::Accepted { peer } => {
                tracing::info!(client_id = %client, peer = ?peer, "Client accepted, handshake pending")
            }
            ClientEvent::HandshakeSucceeded => {
                tracing::info!(client_id = %client, "Handshake successful")
            }
            ClientEvent::ChunkReceived { bytes } => {
                tracing::debug!(client_id = %client, bytes, "Message received")
            }
            ClientEvent::Flushed { bytes } => {
                tracing::debug!(client_id = %client, bytes, "Bytes sent to client")
            }
            ClientEvent::IdleTimeout => tracing::info!(client_id = %client, "Idle timeout"),
            ClientEvent::Closed => tracing::info!(client_id = %client, "Connection closed"),
        }
    }

    fn error_event(&self, event: ErrorEvent) {
        match event.client {
            Some(client) => tracing::error!(
                stage = %event.stage,
                client_id = %client,
                code = event.code,
                error = %event.message,
                "Client error"
            ),
            None => tracing::error!(
                stage = %event.stage,
                code = event.code,
                error = %event.message,
                "Server error"
            ),
        }
    }

    fn received(&self, client: ClientId, content: &[u8]) {
        tracing::trace!(client_id = %client, content = %String::from_utf8_lossy(content), "recv");
    }

    fn sent(&self, client: ClientId, content: &[u8]) {
        tracing::trace!(client_id = %client, content = %String::from_utf8_lossy(content), "send");
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level.
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tls_echo_server={}", config.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}
