//! Events posted by helper tasks back to the event loop.

use std::fmt;
use std::io;

use tokio::net::{TcpStream, UnixStream};

use crate::net::resolver::LookupError;
use crate::relay::connection::ConnectionId;
use crate::relay::transport::Chunk;

/// The remote end of a connection once its TLS handshake has completed.
pub type RemoteStream = tokio_rustls::server::TlsStream<TcpStream>;

/// The trusted plaintext end of a connection.
pub type LocalStream = UnixStream;

/// Which transport of a connection an event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// TLS client on the network.
    Remote,
    /// Local peer on the Unix socket.
    Local,
}

impl Side {
    /// The transport bytes read on this side are written to.
    pub fn opposite(self) -> Side {
        match self {
            Side::Remote => Side::Local,
            Side::Local => Side::Remote,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Remote => f.write_str("remote"),
            Side::Local => f.write_str("local"),
        }
    }
}

/// Something happened to a connection.
#[derive(Debug)]
pub struct Event {
    pub conn: ConnectionId,
    pub kind: EventKind,
}

impl Event {
    pub fn new(conn: ConnectionId, kind: EventKind) -> Self {
        Self { conn, kind }
    }
}

#[derive(Debug)]
pub enum EventKind {
    /// TLS handshake with the remote client finished.
    RemoteConnected(Box<RemoteStream>),
    /// Reverse lookup of the remote address finished.
    Resolved(Result<String, LookupError>),
    /// Connect to the local peer finished.
    LocalConnected(LocalStream),
    /// Bytes read from one side, at most one relay buffer's worth.
    Readable(Side, Chunk),
    /// Orderly close.
    Eof(Side),
    Timeout(Side),
    Error(Side, io::Error),
}
