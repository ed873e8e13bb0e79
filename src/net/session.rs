//! Per-connection session: transport ownership, lifecycle and teardown.
//!
//! # Lifecycle
//! ```text
//! accepted (id registered)
//!     → handshake.rs  ── failure ──┐
//!     → pipeline.rs (I/O FSM)      │
//!     → teardown ◀─────────────────┘
//! ```
//!
//! One task owns a session from accept to teardown, so its stages never run
//! concurrently and teardown runs exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{PipelineMode, ServerConfig};
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{ClientId, Registry};
use crate::net::handshake::{self, Handshake};
use crate::net::pipeline;
use crate::observability::{metrics, ClientEvent, ErrorEvent, ErrorStage, EventSink};

/// The socket underneath a session.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Shut down both directions of the connection. Closing happens on drop.
    fn shutdown_both(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn shutdown_both(&mut self) -> io::Result<()> {
        SockRef::from(&*self).shutdown(std::net::Shutdown::Both)
    }
}

/// Per-session knobs derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub mode: PipelineMode,
    pub read_buffer_size: usize,
    pub handshake_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            mode: config.server.pipeline,
            read_buffer_size: config.server.read_buffer_size,
            handshake_timeout: config.timeouts.handshake(),
            idle_timeout: config.timeouts.idle(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Everything a session task shares with the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<Registry>,
    pub sink: Arc<dyn EventSink>,
    pub settings: SessionSettings,
    pub shutdown: ShutdownSignal,
}

/// One accepted connection and the identifier it was registered under.
pub struct Session<T> {
    id: ClientId,
    peer: Option<SocketAddr>,
    transport: T,
}

impl<T: Transport + 'static> Session<T> {
    /// Wrap an accepted transport. `id` must already be registered.
    pub fn new(id: ClientId, peer: Option<SocketAddr>, transport: T) -> Self {
        Self { id, peer, transport }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Handshake, run the I/O pipeline, tear down.
    pub async fn serve<H: Handshake>(mut self, handshake: Arc<H>, ctx: SessionContext) {
        let id = self.id;
        let established =
            match handshake::perform(handshake.as_ref(), &mut self.transport, id, &ctx).await {
                Some(stream) => {
                    let reason = pipeline::run(stream, id, &ctx).await;
                    tracing::debug!(client_id = %id, reason = ?reason, "Pipeline finished");
                    true
                }
                None => false,
            };
        self.teardown(established, &ctx);
    }

    /// Release the identifier, shut the transport down and close it, and
    /// uncount the connection if its handshake completed. Every step runs
    /// regardless of how the previous one went.
    fn teardown(self, established: bool, ctx: &SessionContext) {
        let Session { id, mut transport, .. } = self;

        let was_registered = ctx.registry.release(id);
        debug_assert!(was_registered, "client {} was not registered at teardown", id);
        if !was_registered {
            ctx.sink.error_event(ErrorEvent::message(
                ErrorStage::Teardown,
                Some(id),
                "identifier missing from the active set",
            ));
        }

        if let Err(e) = transport.shutdown_both() {
            ctx.sink
                .error_event(ErrorEvent::io(ErrorStage::Teardown, Some(id), &e));
        }
        drop(transport);

        if established {
            let active = ctx.registry.connection_closed();
            metrics::set_active_connections(active);
        }

        ctx.sink.client_event(id, ClientEvent::Closed);
    }
}
