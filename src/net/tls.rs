//! TLS context: certificate, key, trust store and client-certificate policy.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// Error type for TLS context construction.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("trust store is empty")]
    EmptyTrustStore,

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Inputs for the TLS context.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub ca_file: Option<PathBuf>,
    pub ca_dir: Option<PathBuf>,
    pub require_client_cert: bool,
}

impl From<&crate::config::RelayConfig> for TlsSettings {
    fn from(config: &crate::config::RelayConfig) -> Self {
        Self {
            certificate_path: config.certificate_path.clone(),
            private_key_path: config.private_key_path.clone(),
            ca_file: config.ca_file.clone(),
            ca_dir: config.ca_dir.clone(),
            require_client_cert: config.require_client_cert,
        }
    }
}

/// Build the acceptor every remote connection is handshaken through.
///
/// Blocking file I/O; call it before the runtime starts.
pub fn build_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, TlsError> {
    let provider = crypto_provider();

    let chain = load_certs(&settings.certificate_path)?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates(settings.certificate_path.clone()));
    }
    let key = load_private_key(&settings.private_key_path)?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = match load_trust_store(settings)? {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            let verifier = if settings.require_client_cert {
                verifier.build()?
            } else {
                verifier.allow_unauthenticated().build()?
            };
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder.with_single_cert(chain, key)?;

    tracing::info!(
        certificate = ?settings.certificate_path,
        require_client_cert = settings.require_client_cert,
        "TLS context initialised"
    );

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read { path: path.to_path_buf(), source })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read { path: path.to_path_buf(), source })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read { path: path.to_path_buf(), source })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// CA file plus every readable PEM file in the CA directory.
///
/// Returns `None` when neither source is configured.
fn load_trust_store(settings: &TlsSettings) -> Result<Option<RootCertStore>, TlsError> {
    if settings.ca_file.is_none() && settings.ca_dir.is_none() {
        return Ok(None);
    }

    let mut roots = RootCertStore::empty();

    if let Some(ca_file) = &settings.ca_file {
        let (added, ignored) = roots.add_parsable_certificates(load_certs(ca_file)?);
        tracing::debug!(path = ?ca_file, added, ignored, "Loaded CA file");
    }

    if let Some(ca_dir) = &settings.ca_dir {
        let entries = std::fs::read_dir(ca_dir)
            .map_err(|source| TlsError::Read { path: ca_dir.clone(), source })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match load_certs(&path) {
                Ok(certs) => {
                    roots.add_parsable_certificates(certs);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping CA directory entry"),
            }
        }
    }

    if roots.is_empty() {
        return Err(TlsError::EmptyTrustStore);
    }

    Ok(Some(roots))
}

/// Crypto provider shared by the acceptor and anything that needs to talk TLS
/// to it, such as test clients.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Subject of a peer certificate in `CN=...` form, if it parses.
pub fn subject_name(cert: &CertificateDer<'_>) -> Option<String> {
    match x509_parser::parse_x509_certificate(cert.as_ref()) {
        Ok((_, parsed)) => Some(parsed.subject().to_string()),
        Err(e) => {
            tracing::debug!(error = %e, "Unable to parse client certificate");
            None
        }
    }
}
