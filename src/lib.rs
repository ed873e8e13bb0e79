//! TLS-terminating echo server library.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;

pub use config::ServerConfig;
pub use lifecycle::Shutdown;
pub use server::{ServerError, TlsServer};
