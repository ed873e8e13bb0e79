//! TCP acceptor with coarse admission control.
//!
//! # Responsibilities
//! - Bind the listening socket
//! - Accept incoming TCP connections and register a client ID for each
//! - Go deaf for a cool-down when the active connection count passes the ceiling
//! - Survive accept errors without consuming identifiers
//!
//! The ceiling is compared against an approximate counter, so a burst can
//! overshoot it briefly. The deaf state exists to stop unbounded growth,
//! not to enforce an exact capacity.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpSocket};

use crate::lifecycle::ShutdownSignal;
use crate::net::handshake::Handshake;
use crate::net::session::{Session, SessionContext};
use crate::observability::{metrics, ClientEvent, ErrorEvent, ErrorStage, ServerEvent};

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_RETRY_BASE_MS: u64 = 5;
const ACCEPT_RETRY_MAX_MS: u64 = 1_000;

/// Admission state of the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    /// Accepts are armed.
    Listening,
    /// Accepts are withheld until the cool-down timer fires.
    Deaf,
}

impl AdmissionState {
    /// State to enter at the top of a re-arm.
    pub fn evaluate(active_connections: usize, ceiling: usize) -> Self {
        if active_connections > ceiling {
            AdmissionState::Deaf
        } else {
            AdmissionState::Listening
        }
    }
}

/// Pause before re-arming after `failures` consecutive accept errors.
///
/// Starts at 5ms and doubles per failure up to 1s, plus up to a tenth of jitter.
fn accept_retry_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    let step = ACCEPT_RETRY_BASE_MS
        .checked_shl(shift)
        .map_or(ACCEPT_RETRY_MAX_MS, |ms| ms.min(ACCEPT_RETRY_MAX_MS));
    let spread = rand::thread_rng().gen_range(0..=step / 10);
    Duration::from_millis(step + spread)
}

/// Bind a listening socket with `SO_REUSEADDR`, so a restarted server can
/// take the same port back while old connections sit in TIME_WAIT.
///
/// Must be called from within a tokio runtime.
pub fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// The accept loop.
pub struct Acceptor<H> {
    listener: TcpListener,
    handshake: Arc<H>,
    ctx: SessionContext,
    ceiling: usize,
    cool_down: Duration,
}

impl<H: Handshake> Acceptor<H> {
    pub fn new(
        listener: TcpListener,
        handshake: Arc<H>,
        ctx: SessionContext,
        ceiling: usize,
        cool_down: Duration,
    ) -> Self {
        Self {
            listener,
            handshake,
            ctx,
            ceiling,
            cool_down,
        }
    }

    /// Get the local address this acceptor is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown. The listening socket is closed on return.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let registry = Arc::clone(&self.ctx.registry);
        let sink = Arc::clone(&self.ctx.sink);
        let mut state = AdmissionState::Listening;
        let mut consecutive_failures = 0u32;

        sink.server_event(ServerEvent::Listening);

        loop {
            let active = registry.active_connections();
            match (state, AdmissionState::evaluate(active, self.ceiling)) {
                (_, AdmissionState::Deaf) => {
                    state = AdmissionState::Deaf;
                    metrics::record_deaf();
                    sink.server_event(ServerEvent::Deaf {
                        active_connections: active,
                        cool_down: self.cool_down,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(self.cool_down) => continue,
                        _ = shutdown.wait() => break,
                    }
                }
                (AdmissionState::Deaf, AdmissionState::Listening) => {
                    state = AdmissionState::Listening;
                    sink.server_event(ServerEvent::Listening);
                }
                (AdmissionState::Listening, AdmissionState::Listening) => {}
            }

            // Draw the next identifier while the accept is pending.
            let candidate = {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.allocate() })
            };

            tokio::select! {
                biased;

                _ = shutdown.wait() => {
                    candidate.abort();
                    break;
                }

                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        consecutive_failures = 0;
                        let drawn = match candidate.await {
                            Ok(id) => id,
                            Err(_) => registry.allocate(),
                        };
                        let id = registry.claim(drawn);

                        metrics::record_accepted();
                        sink.client_event(id, ClientEvent::Accepted { peer: Some(peer) });
                        if let Err(e) = stream.set_nodelay(true) {
                            sink.error_event(ErrorEvent::io(ErrorStage::Accept, Some(id), &e));
                        }

                        let session = Session::new(id, Some(peer), stream);
                        tokio::spawn(session.serve(Arc::clone(&self.handshake), self.ctx.clone()));
                    }
                    Err(e) => {
                        candidate.abort();
                        sink.error_event(ErrorEvent::io(ErrorStage::Accept, None, &e));
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        tokio::select! {
                            _ = tokio::time::sleep(accept_retry_delay(consecutive_failures)) => {}
                            _ = shutdown.wait() => break,
                        }
                    }
                }
            }
        }

        tracing::debug!("Acceptor stopped");
    }
}
