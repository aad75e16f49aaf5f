//! Relay subsystem.
//!
//! # Data Flow
//! ```text
//! TLS port accept
//!     → reactor.rs (register Connection, spawn handshake helper)
//!     → connection.rs (SslConnecting → HostnameLookup → LocalConnecting
//!                      → Established → ShuttingDown)
//!     → transport.rs (reader/writer helpers once both sides are open)
//!     → event.rs (helpers report back to the loop by connection id)
//!     → registry.rs (retire on EOF/error/timeout, bulk drain on shutdown)
//! ```
//!
//! # Design Decisions
//! - One event loop owns every connection; helpers never touch state
//! - The local peer sees `<ip>^<host>\r\n` before any relayed byte
//! - A reader only reads once its destination has room, so slow peers pause
//!   their source rather than lose bytes

pub mod connection;
pub mod event;
pub mod reactor;
pub mod registry;
pub mod transport;

pub use connection::{Connection, ConnectionId, ConnectionState, PeerIdentity};
pub use reactor::{Reactor, RelaySettings};
pub use registry::Registry;
