//! Shutdown coordination for the relay.

use tokio::sync::broadcast;

/// Why the relay is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Asked to stop: flush both sides of every connection.
    Graceful,
    /// The owning process is gone: nothing more is written locally.
    ParentExited,
}

impl ShutdownKind {
    /// Whether pending writes to local peers are still flushed.
    pub fn flushes_local(self) -> bool {
        matches!(self, ShutdownKind::Graceful)
    }
}

/// Coordinator for shutdown.
///
/// Provides a broadcast channel that the event loop subscribes to.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<ShutdownKind>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownKind> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self, kind: ShutdownKind) {
        let _ = self.tx.send(kind);
    }

    /// Resolve with the first trigger seen by `rx`.
    ///
    /// A coordinator dropped without triggering counts as graceful.
    pub async fn requested(mut rx: broadcast::Receiver<ShutdownKind>) -> ShutdownKind {
        loop {
            match rx.recv().await {
                Ok(kind) => return kind,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return ShutdownKind::Graceful,
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
