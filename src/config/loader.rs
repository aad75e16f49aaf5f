//! Configuration loading from the startup channel.

use std::io::{self, Read};
use std::path::PathBuf;

use thiserror::Error;

use crate::config::schema::*;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("short read on configuration record: expected {expected} bytes")]
    Truncated { expected: usize },

    #[error("unable to read configuration record: {0}")]
    Io(#[source] io::Error),

    #[error("field `{0}` is not NUL-terminated")]
    Unterminated(&'static str),

    #[error("field `{0}` is not valid UTF-8")]
    NotUtf8(&'static str),

    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read exactly one record from `reader`, decode and validate it.
///
/// This blocks; call it before the runtime starts.
pub fn read_config<R: Read>(reader: &mut R) -> Result<RelayConfig, ConfigError> {
    let mut record = [0u8; RECORD_LEN];
    reader.read_exact(&mut record).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ConfigError::Truncated { expected: RECORD_LEN },
        _ => ConfigError::Io(e),
    })?;

    let config = decode(&record)?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Decode a record without semantic validation.
pub fn decode(record: &[u8; RECORD_LEN]) -> Result<RelayConfig, ConfigError> {
    let ca_file = get_str(record, CA_FILE_AT, PATH_LEN, "ca_file")?;
    let ca_dir = get_str(record, CA_DIR_AT, PATH_LEN, "ca_dir")?;

    Ok(RelayConfig {
        socket_path: PathBuf::from(get_str(record, SOCKET_PATH_AT, PATH_LEN, "socket_file")?),
        bind_address: get_str(record, BIND_ADDR_AT, ADDR_LEN, "ssl_ip_addr")?,
        port: get_i32(record, PORT_AT),
        private_key_path: PathBuf::from(get_str(record, KEY_PATH_AT, PATH_LEN, "private_key_file")?),
        certificate_path: PathBuf::from(get_str(record, CERT_PATH_AT, PATH_LEN, "certificate_file")?),
        ca_file: (!ca_file.is_empty()).then(|| PathBuf::from(ca_file)),
        ca_dir: (!ca_dir.is_empty()).then(|| PathBuf::from(ca_dir)),
        require_client_cert: get_i32(record, REQUIRE_CERT_AT) != 0,
        keepalive_secs: get_i32(record, KEEPALIVE_AT),
    })
}

fn get_str(record: &[u8], at: usize, width: usize, name: &'static str) -> Result<String, ConfigError> {
    let field = &record[at..at + width];
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(ConfigError::Unterminated(name))?;
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| ConfigError::NotUtf8(name))
}

fn get_i32(record: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&record[at..at + 4]);
    i32::from_ne_bytes(raw)
}
