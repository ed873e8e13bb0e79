//! TLS handshake stage.
//!
//! The handshake borrows the session's transport, so the raw socket stays
//! with the session for teardown whether the handshake succeeds or not.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::net::connection::ClientId;
use crate::net::session::{SessionContext, Transport};
use crate::observability::{metrics, ClientEvent, ErrorEvent, ErrorStage};

/// A bidirectional byte stream the pipeline can drive.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> Stream for S {}

/// Established stream layered over a borrowed transport.
pub type BoxedStream<'a> = Box<dyn Stream + 'a>;

pub type HandshakeFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedStream<'a>>> + Send + 'a>>;

/// Server side of a connection-establishing handshake.
pub trait Handshake: Send + Sync + 'static {
    fn accept<'a, T>(&'a self, transport: &'a mut T) -> HandshakeFuture<'a>
    where
        T: Transport + 'a;
}

/// rustls server handshake.
#[derive(Clone)]
pub struct TlsHandshake {
    acceptor: TlsAcceptor,
}

impl TlsHandshake {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

impl Handshake for TlsHandshake {
    fn accept<'a, T>(&'a self, transport: &'a mut T) -> HandshakeFuture<'a>
    where
        T: Transport + 'a,
    {
        Box::pin(async move {
            let stream = self.acceptor.accept(transport).await?;
            Ok(Box::new(stream) as BoxedStream<'a>)
        })
    }
}

/// Drive the handshake for one session.
///
/// On success the session is counted as an active connection and the
/// established stream is returned. On failure, including the configured
/// deadline passing or shutdown starting, it is reported and `None` is
/// returned; the caller tears the session down without touching the counter.
pub async fn perform<'a, H, T>(
    handshake: &'a H,
    transport: &'a mut T,
    id: ClientId,
    ctx: &SessionContext,
) -> Option<BoxedStream<'a>>
where
    H: Handshake,
    T: Transport + 'a,
{
    let mut shutdown = ctx.shutdown.clone();
    let deadline = async {
        match ctx.settings.handshake_timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        result = handshake.accept(transport) => result,
        _ = deadline => Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")),
        _ = shutdown.wait() => Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "shutdown during handshake",
        )),
    };

    match result {
        Ok(stream) => {
            let active = ctx.registry.connection_opened();
            metrics::set_active_connections(active);
            ctx.sink.client_event(id, ClientEvent::HandshakeSucceeded);
            Some(stream)
        }
        Err(e) => {
            metrics::record_handshake_failure();
            ctx.sink
                .error_event(ErrorEvent::io(ErrorStage::Handshake, Some(id), &e));
            None
        }
    }
}
