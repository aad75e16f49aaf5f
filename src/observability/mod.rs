//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (connection_id, peer_addr, side, state)
//!
//! Consumers:
//!     → logging.rs (fmt layer on stderr, filtered by RUST_LOG)
//! ```
//!
//! # Design Decisions
//! - stdin carries the configuration record, so logs go to stderr
//! - Connection id flows through every per-connection event

pub mod logging;
