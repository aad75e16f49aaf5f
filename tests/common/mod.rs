//! Shared utilities for relay integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustls::pki_types::ServerName;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tls_relay::net::listener::Listener;
use tls_relay::net::resolver::{LookupError, ReverseResolver};
use tls_relay::net::tls::{build_acceptor, crypto_provider, TlsSettings};
use tls_relay::{Reactor, RelaySettings, Shutdown, ShutdownKind};

pub const WAIT: Duration = Duration::from_secs(5);

/// Client end of a relayed TLS connection.
pub type TlsClient = TlsStream<TcpStream>;

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

pub fn server_tls() -> TlsSettings {
    TlsSettings {
        certificate_path: fixture("server.pem"),
        private_key_path: fixture("server.key"),
        ..Default::default()
    }
}

/// Resolver answering every lookup the same way and counting calls.
pub struct StaticResolver {
    answer: Result<&'static str, LookupError>,
    pub calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(answer: Result<&'static str, LookupError>) -> Arc<Self> {
        Arc::new(Self { answer, calls: AtomicUsize::new(0) })
    }
}

impl ReverseResolver for StaticResolver {
    fn reverse(&self, _ip: std::net::IpAddr) -> BoxFuture<'static, Result<String, LookupError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answer.clone().map(str::to_owned);
        Box::pin(async move { answer })
    }
}

/// Resolver whose lookups never finish; records when one is cancelled.
#[derive(Default)]
pub struct StuckResolver {
    pub started: Arc<AtomicBool>,
    pub cancelled: Arc<AtomicBool>,
}

struct CancelFlag(Arc<AtomicBool>);

impl Drop for CancelFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ReverseResolver for StuckResolver {
    fn reverse(&self, _ip: std::net::IpAddr) -> BoxFuture<'static, Result<String, LookupError>> {
        self.started.store(true, Ordering::SeqCst);
        let flag = CancelFlag(self.cancelled.clone());
        Box::pin(async move {
            let _flag = flag;
            std::future::pending::<Result<String, LookupError>>().await
        })
    }
}

/// A running reactor plus the local peer it relays to.
pub struct Harness {
    pub addr: SocketAddr,
    pub local: UnixListener,
    pub shutdown: Shutdown,
    pub reactor: JoinHandle<ShutdownKind>,
    _dir: TempDir,
}

impl Harness {
    pub async fn start(resolver: Arc<dyn ReverseResolver>) -> Self {
        Self::start_with(resolver, server_tls(), |_| {}).await
    }

    pub async fn start_with(
        resolver: Arc<dyn ReverseResolver>,
        tls: TlsSettings,
        tweak: impl FnOnce(&mut RelaySettings),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("peer.sock");
        let local = UnixListener::bind(&socket_path).unwrap();

        let mut settings = RelaySettings::new(&socket_path);
        settings.shutdown_grace = Duration::from_secs(1);
        tweak(&mut settings);

        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor: TlsAcceptor = build_acceptor(&tls).unwrap();

        let shutdown = Shutdown::new();
        let stop = Shutdown::requested(shutdown.subscribe());
        let reactor = tokio::spawn(Reactor::new(listener, acceptor, resolver, settings).run(stop));

        Self { addr, local, shutdown, reactor, _dir: dir }
    }

    /// Accept the relay's connection to the local peer.
    pub async fn accept_local(&self) -> UnixStream {
        let (stream, _) = tokio::time::timeout(WAIT, self.local.accept())
            .await
            .expect("relay never connected to the local peer")
            .unwrap();
        stream
    }

    /// True if the relay opens no local connection within `wait`.
    pub async fn no_local_connection(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.local.accept()).await.is_err()
    }

    pub async fn stop(self, kind: ShutdownKind) -> ShutdownKind {
        self.shutdown.trigger(kind);
        tokio::time::timeout(WAIT, self.reactor).await.unwrap().unwrap()
    }
}

fn client_config(with_cert: bool) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let ca = std::fs::read(fixture("ca.pem")).unwrap();
    for cert in rustls_pemfile::certs(&mut ca.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }

    let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);

    let config = if with_cert {
        let chain = std::fs::read(fixture("client.pem")).unwrap();
        let chain = rustls_pemfile::certs(&mut chain.as_slice()).collect::<Result<Vec<_>, _>>().unwrap();
        let key = std::fs::read(fixture("client.key")).unwrap();
        let key = rustls_pemfile::private_key(&mut key.as_slice()).unwrap().unwrap();
        builder.with_client_auth_cert(chain, key).unwrap()
    } else {
        builder.with_no_client_auth()
    };
    Arc::new(config)
}

pub async fn tls_connect(addr: SocketAddr) -> std::io::Result<TlsStream<TcpStream>> {
    tls_connect_as(addr, false).await
}

pub async fn tls_connect_as(addr: SocketAddr, with_cert: bool) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let connector = TlsConnector::from(client_config(with_cert));
    let name = ServerName::try_from("localhost").unwrap();
    tokio::time::timeout(WAIT, connector.connect(name, tcp)).await.unwrap()
}

/// Read up to and including the first `\r\n`.
pub async fn read_line<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut line = Vec::new();
    while !line.ends_with(b"\r\n") {
        let byte = tokio::time::timeout(WAIT, stream.read_u8()).await.unwrap().unwrap();
        line.push(byte);
    }
    String::from_utf8(line).unwrap()
}

/// Read exactly `len` bytes.
pub async fn read_exactly<R: AsyncRead + Unpin>(stream: &mut R, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    buf
}

/// Wait for the peer to close; returns whatever arrived before it did.
pub async fn read_until_closed<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut rest)).await.unwrap()?;
    Ok(rest)
}

/// Poll `flag` until it is set or `WAIT` elapses.
pub async fn eventually(flag: &AtomicBool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    flag.load(Ordering::SeqCst)
}
