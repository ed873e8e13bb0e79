//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (server.rs):
//!     Load TLS material → Build reactor → Bind listener → Spawn acceptor
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Acceptor stops, sessions close → Drain registry → Stop reactor
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: TLS context first, listener last
//! - Ordered shutdown: stop accept, drain, stop workers
//! - Drain has a deadline: leftover sessions are purged

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
