//! Configuration record definition.
//!
//! The owning process hands us one fixed-layout binary record. Integers are
//! native-endian `i32`; string fields are NUL-padded UTF-8.
//!
//! ```text
//! offset  size  field
//!      0   256  local peer socket path
//!    256    64  listen bind address (empty = 0.0.0.0)
//!    320     4  listen port
//!    324   256  private key path
//!    580   256  certificate chain path
//!    836   256  CA file path (optional)
//!   1092   256  CA directory path (optional)
//!   1348     4  require client certificate (non-zero = true)
//!   1352     4  keepalive timeout seconds (<= 0 disables)
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Width of every path field.
pub const PATH_LEN: usize = 256;
/// Width of the bind address field.
pub const ADDR_LEN: usize = 64;

pub(crate) const SOCKET_PATH_AT: usize = 0;
pub(crate) const BIND_ADDR_AT: usize = SOCKET_PATH_AT + PATH_LEN;
pub(crate) const PORT_AT: usize = BIND_ADDR_AT + ADDR_LEN;
pub(crate) const KEY_PATH_AT: usize = PORT_AT + 4;
pub(crate) const CERT_PATH_AT: usize = KEY_PATH_AT + PATH_LEN;
pub(crate) const CA_FILE_AT: usize = CERT_PATH_AT + PATH_LEN;
pub(crate) const CA_DIR_AT: usize = CA_FILE_AT + PATH_LEN;
pub(crate) const REQUIRE_CERT_AT: usize = CA_DIR_AT + PATH_LEN;
pub(crate) const KEEPALIVE_AT: usize = REQUIRE_CERT_AT + 4;

/// Exact size of the record on the wire.
pub const RECORD_LEN: usize = KEEPALIVE_AT + 4;

/// Startup configuration handed over by the owning process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Unix socket the local peer listens on.
    pub socket_path: PathBuf,

    /// Address to bind the TLS listener to. Empty means all IPv4 interfaces.
    pub bind_address: String,

    /// TLS listen port.
    pub port: i32,

    /// PEM private key.
    pub private_key_path: PathBuf,

    /// PEM certificate chain.
    pub certificate_path: PathBuf,

    /// PEM bundle of trusted CAs for client certificates.
    pub ca_file: Option<PathBuf>,

    /// Directory of PEM files with trusted CAs for client certificates.
    pub ca_dir: Option<PathBuf>,

    /// Reject clients that do not present a verifiable certificate.
    pub require_client_cert: bool,

    /// TCP keepalive idle time in seconds; `<= 0` disables keepalive.
    pub keepalive_secs: i32,
}

impl RelayConfig {
    /// Socket address the TLS listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip = if self.bind_address.is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            self.bind_address.parse()?
        };
        Ok(SocketAddr::new(ip, self.port as u16))
    }

    /// Keepalive idle time applied to accepted remote sockets.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs as u64))
    }

    /// Serialize into the wire layout.
    ///
    /// Used by the owning side of the channel. Strings longer than their
    /// field are truncated so the terminating NUL always fits.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        put_str(&mut record, SOCKET_PATH_AT, PATH_LEN, &self.socket_path.to_string_lossy());
        put_str(&mut record, BIND_ADDR_AT, ADDR_LEN, &self.bind_address);
        put_i32(&mut record, PORT_AT, self.port);
        put_str(&mut record, KEY_PATH_AT, PATH_LEN, &self.private_key_path.to_string_lossy());
        put_str(&mut record, CERT_PATH_AT, PATH_LEN, &self.certificate_path.to_string_lossy());
        let ca_file = self.ca_file.as_ref().map(|p| p.to_string_lossy()).unwrap_or_default();
        put_str(&mut record, CA_FILE_AT, PATH_LEN, &ca_file);
        let ca_dir = self.ca_dir.as_ref().map(|p| p.to_string_lossy()).unwrap_or_default();
        put_str(&mut record, CA_DIR_AT, PATH_LEN, &ca_dir);
        put_i32(&mut record, REQUIRE_CERT_AT, i32::from(self.require_client_cert));
        put_i32(&mut record, KEEPALIVE_AT, self.keepalive_secs);
        record
    }
}

fn put_str(record: &mut [u8], at: usize, width: usize, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(width - 1);
    record[at..at + len].copy_from_slice(&bytes[..len]);
}

fn put_i32(record: &mut [u8], at: usize, value: i32) {
    record[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RelayConfig {
        RelayConfig {
            socket_path: "/tmp/x.sock".into(),
            bind_address: String::new(),
            port: 9999,
            private_key_path: "key.pem".into(),
            certificate_path: "cert.pem".into(),
            ca_file: None,
            ca_dir: None,
            require_client_cert: false,
            keepalive_secs: 300,
        }
    }

    #[test]
    fn empty_bind_address_listens_everywhere() {
        let addr = sample().listen_addr().unwrap();
        assert_eq!(addr, "0.0.0.0:9999".parse().unwrap());
    }

    #[test]
    fn explicit_bind_address_is_parsed() {
        let mut config = sample();
        config.bind_address = "::1".into();
        assert_eq!(config.listen_addr().unwrap(), "[::1]:9999".parse().unwrap());
    }

    #[test]
    fn keepalive_disabled_when_not_positive() {
        let mut config = sample();
        assert_eq!(config.keepalive(), Some(Duration::from_secs(300)));
        config.keepalive_secs = 0;
        assert_eq!(config.keepalive(), None);
    }

    #[test]
    fn encode_places_fields_at_fixed_offsets() {
        let record = sample().encode();
        assert_eq!(&record[..11], b"/tmp/x.sock");
        assert_eq!(record[11], 0);
        assert_eq!(i32::from_ne_bytes(record[PORT_AT..PORT_AT + 4].try_into().unwrap()), 9999);
        assert_eq!(record.len(), 1356);
    }
}
