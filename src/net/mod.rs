//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, keepalive)
//!     → tls.rs (acceptor built once at startup)
//!     → resolver.rs (reverse lookup of the peer address)
//!     → local.rs (connect to the local peer, announce with credentials)
//!     → Hand off to the relay
//! ```
//!
//! # Design Decisions
//! - TLS parsing happens only in this process
//! - Socket option failures are soft, bind failures are fatal
//! - Lookups are cancellable by dropping their request handle

pub mod listener;
pub mod local;
pub mod resolver;
pub mod tls;
