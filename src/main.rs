//! TLS relay process.
//!
//! ```text
//!   TLS clients                 tls-relay                     local peer
//!  ───────────── TLS ──▶ ┌──────────────────────┐ ── unix ──▶ ─────────────
//!                        │ accept → handshake   │   "<ip>^<host>\r\n"
//!                        │ → reverse lookup     │   then raw bytes
//!                        │ → local connect      │
//!                        │ → relay both ways    │
//!                        └──────────────────────┘
//!                           ▲ config record on stdin
//!                           ▲ SIGTERM / SIGUSR1 / parent death
//! ```
//!
//! Exit status is 0 after an orderly shutdown and 1 when the configuration
//! record or the TLS context cannot be set up.

use std::process::ExitCode;

use nix::unistd::getppid;
use tls_relay::config::read_config;
use tls_relay::net::tls::{build_acceptor, TlsSettings};
use tls_relay::observability::logging;

fn main() -> ExitCode {
    logging::init();

    let config = match read_config(&mut std::io::stdin().lock()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Unable to read configuration record");
            return ExitCode::FAILURE;
        }
    };
    let parent = getppid();

    tracing::info!(
        port = config.port,
        bind_address = %config.bind_address,
        socket = ?config.socket_path,
        keepalive_secs = config.keepalive_secs,
        "Configuration loaded"
    );

    let acceptor = match build_acceptor(&TlsSettings::from(&config)) {
        Ok(acceptor) => acceptor,
        Err(e) => {
            tracing::error!(error = %e, "TLS initialization failure");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Unable to start event loop");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(tls_relay::serve(&config, acceptor, parent)) {
        Ok(kind) => {
            tracing::info!(?kind, "Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Relay failed to start");
            ExitCode::FAILURE
        }
    }
}
