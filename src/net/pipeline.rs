//! Per-session I/O pipeline.
//!
//! ```text
//! WaitReadable → Reading → Processing ─┬─▶ WaitReadable
//!      │                               └─▶ Writing ─┬─▶ WaitReadable
//!      │                                            └─▶ Closing
//!      └─ error / idle timeout / shutdown ─────────────▶ Closing
//! ```
//!
//! In echo mode every chunk is written back as soon as it is read. In
//! aggregate mode chunks accumulate in the registry and are flushed in one
//! write once the peer stops sending.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::PipelineMode;
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::ClientId;
use crate::net::session::SessionContext;
use crate::observability::{metrics, ClientEvent, ErrorEvent, ErrorStage};

/// Upper bound on sending close_notify after the final flush.
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a pipeline stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer finished sending and everything owed to it was written.
    PeerClosed,
    ReadFailed,
    WriteFailed,
    IdleTimeout,
    Shutdown,
}

#[derive(Debug)]
enum State {
    WaitReadable,
    Reading { available: usize },
    Processing { chunk: Vec<u8>, end_of_stream: bool },
    Writing { payload: Vec<u8>, close_after: bool },
    Closing(CloseReason),
}

enum Readiness {
    Ready(usize),
    EndOfStream,
    Failed(io::Error),
    TimedOut,
    Shutdown,
}

/// Drive one established session until it closes.
pub async fn run<S>(stream: S, id: ClientId, ctx: &SessionContext) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(ctx.settings.read_buffer_size, stream);
    let mut shutdown = ctx.shutdown.clone();
    let mut state = State::WaitReadable;

    loop {
        state = match state {
            State::WaitReadable => {
                match wait_readable(&mut reader, ctx.settings.idle_timeout, &mut shutdown).await {
                    Readiness::Ready(available) => State::Reading { available },
                    Readiness::EndOfStream => State::Processing {
                        chunk: Vec::new(),
                        end_of_stream: true,
                    },
                    Readiness::Failed(e) => {
                        ctx.sink
                            .error_event(ErrorEvent::io(ErrorStage::Read, Some(id), &e));
                        State::Closing(CloseReason::ReadFailed)
                    }
                    Readiness::TimedOut => {
                        ctx.sink.client_event(id, ClientEvent::IdleTimeout);
                        State::Closing(CloseReason::IdleTimeout)
                    }
                    Readiness::Shutdown => State::Closing(CloseReason::Shutdown),
                }
            }
            State::Reading { available } => {
                let chunk = reader.buffer()[..available].to_vec();
                reader.consume(available);

                metrics::record_bytes_received(chunk.len());
                ctx.sink
                    .client_event(id, ClientEvent::ChunkReceived { bytes: chunk.len() });
                ctx.sink.received(id, &chunk);
                State::Processing {
                    chunk,
                    end_of_stream: false,
                }
            }
            State::Processing {
                chunk,
                end_of_stream,
            } => process(ctx, id, chunk, end_of_stream),
            State::Writing {
                payload,
                close_after,
            } => match write_payload(&mut reader, &payload).await {
                Ok(()) => {
                    metrics::record_bytes_sent(payload.len());
                    ctx.sink
                        .client_event(id, ClientEvent::Flushed { bytes: payload.len() });
                    ctx.sink.sent(id, &payload);
                    if close_after {
                        ctx.registry.clear_message(id);
                        State::Closing(CloseReason::PeerClosed)
                    } else {
                        State::WaitReadable
                    }
                }
                Err(e) => {
                    ctx.sink
                        .error_event(ErrorEvent::io(ErrorStage::Write, Some(id), &e));
                    State::Closing(CloseReason::WriteFailed)
                }
            },
            State::Closing(reason) => {
                if reason == CloseReason::PeerClosed {
                    send_close_notify(&mut reader, id).await;
                }
                return reason;
            }
        };
    }
}

/// Decide what follows a read.
fn process(ctx: &SessionContext, id: ClientId, chunk: Vec<u8>, end_of_stream: bool) -> State {
    match ctx.settings.mode {
        PipelineMode::Echo => {
            if !chunk.is_empty() {
                State::Writing {
                    payload: chunk,
                    close_after: end_of_stream,
                }
            } else if end_of_stream {
                State::Closing(CloseReason::PeerClosed)
            } else {
                State::WaitReadable
            }
        }
        PipelineMode::Aggregate => {
            if !chunk.is_empty() {
                ctx.registry.append_message(id, &chunk);
            }
            if !end_of_stream {
                return State::WaitReadable;
            }
            let payload = ctx.registry.pending_message(id);
            if payload.is_empty() {
                State::Closing(CloseReason::PeerClosed)
            } else {
                State::Writing {
                    payload,
                    close_after: true,
                }
            }
        }
    }
}

/// Wait until decrypted bytes are buffered, the peer stops sending, or the
/// session has to stop. A wakeup that yields no plaintext (a TLS record
/// still incomplete, say) keeps waiting.
async fn wait_readable<S>(
    reader: &mut BufReader<S>,
    idle_timeout: Option<Duration>,
    shutdown: &mut ShutdownSignal,
) -> Readiness
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let fill = async {
        match reader.fill_buf().await {
            Ok(buf) if buf.is_empty() => Readiness::EndOfStream,
            Ok(buf) => Readiness::Ready(buf.len()),
            Err(e) if is_connection_down(&e) => Readiness::EndOfStream,
            Err(e) => Readiness::Failed(e),
        }
    };
    let idle = async {
        match idle_timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        readiness = fill => readiness,
        _ = idle => Readiness::TimedOut,
        _ = shutdown.wait() => Readiness::Shutdown,
    }
}

/// Read failures treated like an end-of-stream: the peer went away without a
/// TLS close_notify, or the socket no longer permits reading.
fn is_connection_down(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::PermissionDenied
    )
}

async fn write_payload<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn send_close_notify<W: AsyncWrite + Unpin>(writer: &mut W, id: ClientId) {
    match tokio::time::timeout(CLOSE_NOTIFY_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(client_id = %id, error = %e, "close_notify failed"),
        Err(_) => tracing::debug!(client_id = %id, "close_notify timed out"),
    }
}
