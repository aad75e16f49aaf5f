//! The event loop.
//!
//! # Responsibilities
//! - Accept remote connections and start their TLS handshakes
//! - Drive each connection through its states as helper events arrive
//! - Route bytes between the two sides of established connections
//! - Retire connections on EOF, error or handshake timeout
//! - Drain everything on shutdown
//!
//! # Design Decisions
//! - All connection state lives in the registry and is only touched here
//! - Helpers report through one bounded channel; events for retired
//!   connections or from a stale state are ignored

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

use crate::config::RelayConfig;
use crate::lifecycle::ShutdownKind;
use crate::net::listener::{set_keepalive, Listener};
use crate::net::local::connect_and_announce;
use crate::net::resolver::{LookupError, LookupRequest, ReverseResolver, LOOKUP_TIMEOUT};
use crate::net::tls::subject_name;
use crate::relay::connection::{Connection, ConnectionId, ConnectionState, PeerIdentity, Slot};
use crate::relay::event::{Event, EventKind, LocalStream, RemoteStream, Side};
use crate::relay::registry::Registry;
use crate::relay::transport::{Chunk, Task, Transport};

/// How long a client gets to complete the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long shutdown waits for pending writes to flush.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Events buffered between helpers and the loop.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// How long accepting stops after a failed accept (e.g. out of descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime knobs for the event loop.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Unix socket of the local peer.
    pub socket_path: PathBuf,
    /// TCP keepalive for remote sockets.
    pub keepalive: Option<Duration>,
    pub handshake_timeout: Duration,
    pub lookup_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl RelaySettings {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            keepalive: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            lookup_timeout: LOOKUP_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            keepalive: config.keepalive(),
            ..Self::new(config.socket_path.clone())
        }
    }
}

/// Single-threaded relay loop.
pub struct Reactor {
    listener: Listener,
    acceptor: TlsAcceptor,
    resolver: Arc<dyn ReverseResolver>,
    settings: RelaySettings,
    registry: Registry,
    events: mpsc::Sender<Event>,
    inbox: mpsc::Receiver<Event>,
}

impl Reactor {
    pub fn new(
        listener: Listener,
        acceptor: TlsAcceptor,
        resolver: Arc<dyn ReverseResolver>,
        settings: RelaySettings,
    ) -> Self {
        let (events, inbox) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            listener,
            acceptor,
            resolver,
            settings,
            registry: Registry::new(),
            events,
            inbox,
        }
    }

    /// Run until `stop` resolves, then shut every connection down.
    pub async fn run<F>(mut self, stop: F) -> ShutdownKind
    where
        F: Future<Output = ShutdownKind>,
    {
        tokio::pin!(stop);

        tracing::info!(
            address = ?self.listener.local_addr().ok(),
            socket = ?self.settings.socket_path,
            "Starting event loop"
        );

        let mut pause = AcceptPause::default();
        let kind = loop {
            tokio::select! {
                kind = &mut stop => break kind,
                accepted = self.listener.accept(), if !pause.is_active() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    Err(e) => {
                        tracing::error!(error = %e, "Accept on TLS port failed");
                        pause.start();
                    }
                },
                () = pause.elapsed(), if pause.is_active() => {}
                Some(event) = self.inbox.recv() => self.dispatch(event),
            }
        };

        tracing::info!(?kind, connections = self.registry.len(), "Shutting down");
        self.shutdown(kind).await;
        kind
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Some(idle) = self.settings.keepalive {
            if let Err(e) = set_keepalive(&stream, idle) {
                tracing::warn!(peer_addr = %peer, error = %e, "Unable to enable keepalive");
            }
        }

        let mut conn = Connection::new(peer);
        let id = conn.id();
        tracing::info!(connection_id = %id, peer_addr = %peer, "New connection on TLS port");

        let acceptor = self.acceptor.clone();
        let events = self.events.clone();
        let limit = self.settings.handshake_timeout;
        conn.remote = Slot::Opening(Task::spawn(async move {
            let kind = match tokio::time::timeout(limit, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => EventKind::RemoteConnected(Box::new(tls)),
                Ok(Err(e)) => EventKind::Error(Side::Remote, e),
                Err(_) => EventKind::Timeout(Side::Remote),
            };
            let _ = events.send(Event::new(id, kind)).await;
        }));

        self.registry.register(conn);
    }

    fn dispatch(&mut self, event: Event) {
        let Event { conn: id, kind } = event;
        if !self.registry.contains(id) {
            tracing::trace!(connection_id = %id, "Event for retired connection ignored");
            return;
        }

        match kind {
            EventKind::RemoteConnected(stream) => self.on_tls_established(id, *stream),
            EventKind::Resolved(result) => self.on_resolved(id, result),
            EventKind::LocalConnected(stream) => self.on_local_connected(id, stream),
            EventKind::Readable(side, chunk) => self.on_readable(id, side, chunk),
            EventKind::Timeout(side) => self.on_timeout(id, side),
            EventKind::Eof(side) => self.on_closed(id, side, None),
            EventKind::Error(side, e) => self.on_closed(id, side, Some(e)),
        }
    }

    fn on_tls_established(&mut self, id: ConnectionId, stream: RemoteStream) {
        let Some(conn) = self.registry.get_mut(id) else { return };
        if conn.advance(ConnectionState::HostnameLookup).is_err() {
            return;
        }

        let (_, session) = stream.get_ref();
        let client_subject = session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(subject_name);
        tracing::info!(
            connection_id = %id,
            protocol = ?session.protocol_version(),
            cipher = ?session.negotiated_cipher_suite().map(|s| s.suite()),
            client_subject = client_subject.as_deref().unwrap_or("none"),
            "TLS handshake completed, resolving remote host name"
        );

        conn.remote = Slot::Idle(stream);

        let events = self.events.clone();
        let ip = conn.peer().ip().to_canonical();
        conn.lookup = Some(LookupRequest::issue(
            self.resolver.as_ref(),
            ip,
            self.settings.lookup_timeout,
            move |result| async move {
                let _ = events.send(Event::new(id, EventKind::Resolved(result))).await;
            },
        ));
    }

    fn on_resolved(&mut self, id: ConnectionId, result: Result<String, LookupError>) {
        let Some(conn) = self.registry.get_mut(id) else { return };
        if conn.advance(ConnectionState::LocalConnecting).is_err() {
            return;
        }
        conn.lookup = None;

        if let Err(e) = &result {
            tracing::debug!(connection_id = %id, error = %e, "Reverse lookup failed, using address");
        }
        let identity = PeerIdentity::from_lookup(conn.peer(), result);
        tracing::info!(
            connection_id = %id,
            host = %identity.host,
            ip = %identity.ip,
            "Resolved host name, opening local connection"
        );
        let line = identity.handshake_line();
        conn.set_identity(identity);

        // The line goes out on the fresh socket before any transport is wired.
        let events = self.events.clone();
        let path = self.settings.socket_path.clone();
        conn.local = Slot::Opening(Task::spawn(async move {
            let kind = match connect_and_announce(&path, line.as_bytes()).await {
                Ok(stream) => EventKind::LocalConnected(stream),
                Err(e) => EventKind::Error(Side::Local, e),
            };
            let _ = events.send(Event::new(id, kind)).await;
        }));
    }

    fn on_local_connected(&mut self, id: ConnectionId, stream: LocalStream) {
        let Some(conn) = self.registry.get_mut(id) else { return };
        if conn.state() != ConnectionState::LocalConnecting {
            return;
        }
        let Some(remote) = conn.remote.take_idle() else {
            tracing::error!(connection_id = %id, "Local connection completed without a pending remote");
            self.retire(id);
            return;
        };
        if conn.advance(ConnectionState::Established).is_err() {
            return;
        }

        tracing::info!(
            connection_id = %id,
            host = conn.identity().map_or("", |identity| identity.host.as_str()),
            "Local connection established, relaying"
        );

        let (remote, local) = Transport::pair(id, remote, stream, self.events.clone());
        conn.remote = Slot::Wired(remote);
        conn.local = Slot::Wired(local);
    }

    fn on_readable(&mut self, id: ConnectionId, side: Side, chunk: Chunk) {
        let Some(conn) = self.registry.get_mut(id) else { return };
        if conn.state() != ConnectionState::Established {
            tracing::debug!(connection_id = %id, %side, len = chunk.len(), "Dropped relay buffer");
            return;
        }

        tracing::trace!(connection_id = %id, %side, to = %side.opposite(), len = chunk.len(), "Relaying");
        chunk.deliver();
    }

    fn on_timeout(&mut self, id: ConnectionId, side: Side) {
        let Some(conn) = self.registry.get_mut(id) else { return };
        if side != Side::Remote || conn.state() != ConnectionState::SslConnecting {
            tracing::trace!(connection_id = %id, %side, "Spurious timeout ignored");
            return;
        }

        tracing::info!(connection_id = %id, peer_addr = %conn.peer(), "TLS handshake timed out");
        let _ = conn.advance(ConnectionState::ShuttingDown);
        // No local transport exists yet.
        conn.remote = Slot::Empty;
        self.retire(id);
    }

    fn on_closed(&mut self, id: ConnectionId, side: Side, error: Option<io::Error>) {
        let Some(conn) = self.registry.get_mut(id) else { return };

        let reason = error.as_ref().map(ToString::to_string);
        match side {
            Side::Local => tracing::info!(
                connection_id = %id,
                state = ?conn.state(),
                reason = reason.as_deref().unwrap_or("eof"),
                "Lost local connection"
            ),
            Side::Remote => tracing::info!(
                connection_id = %id,
                peer_addr = %conn.peer(),
                state = ?conn.state(),
                reason = reason.as_deref().unwrap_or("eof"),
                "Lost TLS connection"
            ),
        }

        let _ = conn.advance(ConnectionState::ShuttingDown);
        match side {
            Side::Local => {
                // Flush what the client is owed and send it a close-notify.
                conn.local = Slot::Empty;
                drop(std::mem::take(&mut conn.remote).close_gracefully());
            }
            Side::Remote => {
                conn.remote = Slot::Empty;
                drop(std::mem::take(&mut conn.local).close_gracefully());
            }
        }

        self.retire(id);
    }

    fn retire(&mut self, id: ConnectionId) {
        self.registry.unregister(id);
    }

    async fn shutdown(&mut self, kind: ShutdownKind) {
        let flush_local = kind.flushes_local();
        let mut flushing = Vec::new();

        self.registry.for_each(|conn| {
            let _ = conn.advance(ConnectionState::ShuttingDown);
            flushing.extend(std::mem::take(&mut conn.remote).close_gracefully());
            if flush_local {
                flushing.extend(std::mem::take(&mut conn.local).close_gracefully());
            }
        });
        self.registry.clear();

        // Chunks already read hold slots in the outboxes being flushed.
        self.inbox.close();
        while let Ok(Event { kind, .. }) = self.inbox.try_recv() {
            if let EventKind::Readable(_, chunk) = kind {
                chunk.deliver();
            }
        }

        if flushing.is_empty() {
            return;
        }
        if tokio::time::timeout(self.settings.shutdown_grace, join_all(flushing))
            .await
            .is_err()
        {
            tracing::warn!("Flush did not finish within the grace period");
        }
    }
}

/// Accepting stops for [`ACCEPT_BACKOFF`] after a failure so a persistent
/// error does not spin the loop.
#[derive(Debug, Default)]
struct AcceptPause {
    until: Option<Instant>,
}

impl AcceptPause {
    fn start(&mut self) {
        self.until = Some(Instant::now() + ACCEPT_BACKOFF);
    }

    fn is_active(&self) -> bool {
        self.until.is_some()
    }

    async fn elapsed(&mut self) {
        if let Some(until) = self.until {
            tokio::time::sleep_until(until).await;
        }
        self.until = None;
    }
}
