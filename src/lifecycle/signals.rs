//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGTERM and SIGUSR1
//! - Translate them into a shutdown kind
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGUSR1 doubles as the parent-death signal armed by the supervisor

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::lifecycle::ShutdownKind;

pub struct Signals {
    terminate: Signal,
    parent_exited: Signal,
}

impl Signals {
    /// Install the handlers. Must be called from within the runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            parent_exited: signal(SignalKind::user_defined1())?,
        })
    }

    /// Wait for the next shutdown-worthy signal.
    pub async fn recv(&mut self) -> ShutdownKind {
        tokio::select! {
            _ = self.terminate.recv() => {
                tracing::info!("Received SIGTERM");
                ShutdownKind::Graceful
            }
            _ = self.parent_exited.recv() => {
                tracing::error!("Parent process exited unexpectedly, shutting down");
                ShutdownKind::ParentExited
            }
        }
    }
}
