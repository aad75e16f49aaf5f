//! Privilege-separated TLS relay.
//!
//! Terminates TLS for remote clients and relays the plaintext stream to a
//! trusted local peer over a Unix socket, announcing each client with an
//! `<ip>^<host>\r\n` line first. Runs as a child of that peer and exits when
//! it goes away.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod relay;

use std::future::Future;
use std::sync::Arc;

use nix::unistd::Pid;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub use config::RelayConfig;
pub use lifecycle::{Shutdown, ShutdownKind};
pub use relay::{Reactor, RelaySettings};

use crate::config::ConfigError;
use crate::lifecycle::{supervise, ParentWatch, Signals};
use crate::net::listener::{Listener, ListenerError};
use crate::net::resolver::DnsResolver;
use crate::net::tls::TlsError;

/// Anything that stops the relay from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS initialization failure: {0}")]
    Tls(#[from] TlsError),

    #[error("bind address: {0}")]
    BindAddress(#[from] std::net::AddrParseError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("unable to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// Run the relay until a shutdown signal or the parent's death.
///
/// Must be called inside a current-thread runtime.
pub async fn serve(config: &RelayConfig, acceptor: TlsAcceptor, parent: Pid) -> Result<ShutdownKind, StartupError> {
    let listener = Listener::bind(config.listen_addr()?)?;
    let mut signals = Signals::install().map_err(StartupError::Signals)?;
    let watch = supervise(parent);

    let shutdown = Shutdown::new();
    let requested = Shutdown::requested(shutdown.subscribe());
    let _watcher = watch_for_shutdown(shutdown, async move { signals.recv().await }, watch);

    let reactor = Reactor::new(
        listener,
        acceptor,
        Arc::new(DnsResolver::from_system()),
        RelaySettings::from(config),
    );
    Ok(reactor.run(requested).await)
}

/// Trigger `shutdown` on whichever comes first: `signal`, or the parent
/// exiting.
pub fn watch_for_shutdown<F>(shutdown: Shutdown, signal: F, mut watch: Box<dyn ParentWatch>) -> JoinHandle<()>
where
    F: Future<Output = ShutdownKind> + Send + 'static,
{
    tokio::spawn(async move {
        let kind = tokio::select! {
            kind = signal => kind,
            () = watch.exited() => ShutdownKind::ParentExited,
        };
        shutdown.trigger(kind);
    })
}
