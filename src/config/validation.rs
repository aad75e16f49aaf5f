//! Configuration validation.
//!
//! # Responsibilities
//! - Validate value ranges (port in range)
//! - Check required paths are present
//! - Detect a client-certificate requirement with no trust store
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>
//! - File existence is left to TLS initialisation, which reports the path

use thiserror::Error;

use crate::config::schema::RelayConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listen port {0} out of range")]
    PortOutOfRange(i32),

    #[error("local socket path is empty")]
    MissingSocketPath,

    #[error("private key path is empty")]
    MissingPrivateKey,

    #[error("certificate path is empty")]
    MissingCertificate,

    #[error("bind address `{0}` is not an IP address")]
    BadBindAddress(String),

    #[error("client certificates required but no CA file or directory given")]
    NoTrustStore,
}

pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !(1..=65535).contains(&config.port) {
        errors.push(ValidationError::PortOutOfRange(config.port));
    }
    if config.socket_path.as_os_str().is_empty() {
        errors.push(ValidationError::MissingSocketPath);
    }
    if config.private_key_path.as_os_str().is_empty() {
        errors.push(ValidationError::MissingPrivateKey);
    }
    if config.certificate_path.as_os_str().is_empty() {
        errors.push(ValidationError::MissingCertificate);
    }
    if !config.bind_address.is_empty() && config.bind_address.parse::<std::net::IpAddr>().is_err() {
        errors.push(ValidationError::BadBindAddress(config.bind_address.clone()));
    }
    if config.require_client_cert && config.ca_file.is_none() && config.ca_dir.is_none() {
        errors.push(ValidationError::NoTrustStore);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
