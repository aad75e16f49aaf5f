//! TLS port listener and socket options.
//!
//! # Responsibilities
//! - Bind to the configured address with `SO_REUSEADDR`
//! - Accept incoming TCP connections
//! - Apply TCP keepalive to accepted sockets

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Pending connection backlog handed to `listen(2)`.
const BACKLOG: i32 = 128;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(SocketAddr, std::io::Error),
    /// Failed to accept connection.
    Accept(std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Bind(_, e) | ListenerError::Accept(e) => Some(e),
        }
    }
}

/// Non-blocking listener for the TLS port.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind a reusable, non-blocking socket to `addr`.
    ///
    /// Must be called from within the runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, ListenerError> {
        let bind_err = |e| ListenerError::Bind(addr, e);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(BACKLOG).map_err(bind_err)?;

        let inner = TcpListener::from_std(socket.into()).map_err(bind_err)?;

        tracing::info!(
            address = %inner.local_addr().unwrap_or(addr),
            "Listener bound"
        );

        Ok(Self { inner })
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        tracing::debug!(peer_addr = %addr, "Connection accepted");
        Ok((stream, addr))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}

/// Enable TCP keepalive with the given idle time.
///
/// The probe interval follows the idle time where the platform lets us set
/// it. Failure is soft: the caller logs and carries on.
pub fn set_keepalive(stream: &TcpStream, idle: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive.with_interval(idle);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_accepts() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, peer) = listener.accept().await.unwrap();
        let client = client.await.unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
        set_keepalive(&stream, Duration::from_secs(300)).unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        let err = Listener::bind(addr).err().unwrap();
        assert!(matches!(err, ListenerError::Bind(a, _) if a == addr));
    }
}
