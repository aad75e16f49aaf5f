//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM → graceful shutdown
//!     SIGUSR1 → owning process exited
//!
//! Supervisor (supervisor.rs):
//!     parent death detected → owning process exited
//!
//! Shutdown (shutdown.rs):
//!     first trigger wins → reactor stops accepting → flush → exit
//! ```
//!
//! # Design Decisions
//! - The supervision strategy is probed at runtime, best first
//! - A vanished owner gets no further local writes
//! - Shutdown has a grace period: pending flushes are abandoned after it

pub mod shutdown;
pub mod signals;
pub mod supervisor;

pub use shutdown::{Shutdown, ShutdownKind};
pub use signals::Signals;
pub use supervisor::{supervise, ParentWatch};
