//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connection engine produces:
//!     → logging.rs (EventSink calls → structured tracing events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log output (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging for machine parsing
//! - Client ID flows through every per-session event
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use logging::{ClientEvent, ErrorEvent, ErrorStage, EventSink, ServerEvent, TracingSink};
