//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, admission control, id registration)
//!     → session.rs (one task per connection)
//!         → handshake.rs (TLS handshake)
//!         → pipeline.rs (read / process / write state machine)
//!         → teardown (id release, socket shutdown and close)
//!
//! Shared across sessions:
//!     connection.rs (client ids, active set, counter, message buffers)
//! ```
//!
//! # Design Decisions
//! - A session's stages run in sequence inside one task
//! - Shared state lives only in the registry
//! - The connection counter is a back-pressure hint, not an accounting primitive

pub mod connection;
pub mod handshake;
pub mod listener;
pub mod pipeline;
pub mod session;
pub mod tls;

pub use connection::{ClientId, Registry};
pub use handshake::{Handshake, TlsHandshake};
pub use listener::AdmissionState;
pub use pipeline::CloseReason;
pub use session::{Session, SessionContext, SessionSettings, Transport};
