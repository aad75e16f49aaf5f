//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! owning process writes a fixed-size record to our stdin
//!     → loader.rs (blocking read_exact, decode fields)
//!     → validation.rs (semantic checks)
//!     → RelayConfig (validated, immutable)
//!     → consumed once at startup by tls/listener/reactor setup
//! ```
//!
//! # Design Decisions
//! - Config is read exactly once, before the runtime starts
//! - The record layout is fixed; a short read is fatal
//! - Validation separates decoding from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{read_config, ConfigError};
pub use schema::{RelayConfig, RECORD_LEN};
