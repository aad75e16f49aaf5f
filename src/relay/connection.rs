//! Connection state machine and ownership slots.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and event routing
//! - Enforce the fixed state sequence
//! - Own both transports and any in-flight lookup; dropping a connection
//!   releases all of them

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::net::resolver::{LookupError, LookupRequest};
use crate::relay::event::{LocalStream, RemoteStream};
use crate::relay::transport::{Task, Transport};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state.
///
/// ```text
/// SslConnecting → HostnameLookup → LocalConnecting → Established
///       └──────────────┴──────────────────┴──────────────┴──→ ShuttingDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Remote socket accepted, TLS handshake running.
    SslConnecting,
    /// Handshake done, reverse lookup running.
    HostnameLookup,
    /// Lookup done, connecting to the local peer.
    LocalConnecting,
    /// Both sides wired, bytes flowing.
    Established,
    /// Terminal.
    ShuttingDown,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (SslConnecting, HostnameLookup)
            | (HostnameLookup, LocalConnecting)
            | (LocalConnecting, Established) => true,
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Who the remote peer is, as reported to the local peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub ip: String,
    pub host: String,
}

impl PeerIdentity {
    /// Resolution is advisory: on failure the numeric address stands in for
    /// the hostname.
    pub fn from_lookup(peer: SocketAddr, lookup: Result<String, LookupError>) -> Self {
        let ip = peer.ip().to_canonical().to_string();
        let host = lookup.unwrap_or_else(|_| ip.clone());
        Self { ip, host }
    }

    /// The single metadata line the local peer reads before any payload.
    pub fn handshake_line(&self) -> String {
        format!("{}^{}\r\n", self.ip, self.host)
    }
}

/// Ownership slot for one side of a connection.
#[derive(Debug, Default)]
pub enum Slot<S> {
    /// Not created yet, or already released.
    #[default]
    Empty,
    /// Handshake or connect in progress on a helper task.
    Opening(Task),
    /// Open but not relaying yet.
    Idle(S),
    /// Relaying.
    Wired(Transport),
}

impl<S> Slot<S>
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    /// Take the stream out of an idle slot, leaving it empty.
    pub fn take_idle(&mut self) -> Option<S> {
        match std::mem::take(self) {
            Slot::Idle(stream) => Some(stream),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Flush pending writes and shut the stream down. Anything still opening
    /// is cancelled.
    pub fn close_gracefully(self) -> Option<JoinHandle<()>> {
        match self {
            Slot::Empty | Slot::Opening(_) => None,
            Slot::Idle(mut stream) => Some(tokio::spawn(async move {
                if let Err(e) = stream.shutdown().await {
                    tracing::debug!(error = %e, "Shutdown of idle stream failed");
                }
            })),
            Slot::Wired(transport) => transport.flush_and_close(),
        }
    }
}

/// One relayed client.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    peer: SocketAddr,
    identity: Option<PeerIdentity>,
    pub remote: Slot<RemoteStream>,
    pub local: Slot<LocalStream>,
    pub lookup: Option<LookupRequest>,
}

impl Connection {
    /// A freshly accepted connection, about to start its TLS handshake.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            state: ConnectionState::SslConnecting,
            peer,
            identity: None,
            remote: Slot::Empty,
            local: Slot::Empty,
            lookup: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn identity(&self) -> Option<&PeerIdentity> {
        self.identity.as_ref()
    }

    /// Record the peer identity. Only the first call has any effect.
    pub fn set_identity(&mut self, identity: PeerIdentity) -> bool {
        if self.identity.is_some() {
            return false;
        }
        self.identity = Some(identity);
        true
    }

    pub fn advance(&mut self, next: ConnectionState) -> Result<(), TransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(TransitionError { from: self.state, to: next });
        }
        tracing::debug!(connection_id = %self.id, from = ?self.state, to = ?next, "State change");
        self.state = next;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::trace!(connection_id = %self.id, state = ?self.state, "Connection destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ORDER: [ConnectionState; 5] = [SslConnecting, HostnameLookup, LocalConnecting, Established, ShuttingDown];

    fn peer() -> SocketAddr {
        "203.0.113.7:40000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id2 > id1);
    }

    #[test]
    fn happy_path_visits_every_state_in_order() {
        let mut conn = Connection::new(peer());
        for next in &ORDER[1..] {
            conn.advance(*next).unwrap();
        }
        assert_eq!(conn.state(), ShuttingDown);
    }

    #[test]
    fn no_state_is_skipped_or_revisited() {
        for (i, from) in ORDER.iter().enumerate() {
            for (j, to) in ORDER.iter().enumerate() {
                let allowed = from.can_advance_to(*to);
                let expected = (j == i + 1) || (*to == ShuttingDown && *from != ShuttingDown);
                assert_eq!(allowed, expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn illegal_transition_leaves_state_alone() {
        let mut conn = Connection::new(peer());
        let err = conn.advance(Established).unwrap_err();
        assert_eq!(err, TransitionError { from: SslConnecting, to: Established });
        assert_eq!(conn.state(), SslConnecting);
    }

    #[test]
    fn identity_is_set_once() {
        let mut conn = Connection::new(peer());
        assert!(conn.set_identity(PeerIdentity::from_lookup(peer(), Ok("first.example".into()))));
        assert!(!conn.set_identity(PeerIdentity::from_lookup(peer(), Ok("second.example".into()))));
        assert_eq!(conn.identity().unwrap().host, "first.example");
    }

    #[test]
    fn failed_lookup_falls_back_to_numeric_address() {
        let identity = PeerIdentity::from_lookup(peer(), Err(LookupError::NotFound));
        assert_eq!(identity.handshake_line(), "203.0.113.7^203.0.113.7\r\n");
    }

    #[test]
    fn handshake_line_puts_ip_first() {
        let identity = PeerIdentity::from_lookup(peer(), Ok("10.0.0.5".into()));
        assert_eq!(identity.handshake_line(), "203.0.113.7^10.0.0.5\r\n");
    }

    #[test]
    fn mapped_ipv6_peer_is_reported_as_ipv4() {
        let mapped: SocketAddr = "[::ffff:203.0.113.7]:40000".parse().unwrap();
        let identity = PeerIdentity::from_lookup(mapped, Err(LookupError::Timeout));
        assert_eq!(identity.ip, "203.0.113.7");
    }

    #[tokio::test]
    async fn take_idle_only_takes_idle_streams() {
        let (stream, _other) = tokio::io::duplex(8);
        let mut slot = Slot::Idle(stream);
        assert!(slot.take_idle().is_some());
        assert!(matches!(slot, Slot::Empty));

        let mut opening: Slot<tokio::io::DuplexStream> = Slot::Opening(Task::spawn(async {}));
        assert!(opening.take_idle().is_none());
        assert!(matches!(opening, Slot::Opening(_)));
    }

    /// Writer whose shutdown always fails.
    struct BrokenShutdown;

    impl AsyncWrite for BrokenShutdown {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }
    }

    #[tokio::test]
    async fn failed_idle_shutdown_still_completes() {
        let slot = Slot::Idle(BrokenShutdown);
        let flush = slot.close_gracefully().expect("idle slot has a stream to close");
        flush.await.expect("close task panicked");
    }

    #[test]
    fn empty_slot_has_nothing_to_flush() {
        let empty: Slot<tokio::io::DuplexStream> = Slot::Empty;
        assert!(empty.close_gracefully().is_none());
    }
}
