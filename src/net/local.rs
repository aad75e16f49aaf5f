//! The local peer's Unix socket.
//!
//! # Responsibilities
//! - Connect to the peer
//! - Deliver the handshake line with the relay's credentials attached, so
//!   the peer can check who is talking to it
//!
//! # Design Decisions
//! - Credentials ride on the first `sendmsg` only (`SCM_CREDENTIALS`);
//!   anything the kernel did not take in that call is written plainly
//! - Platforms without `SCM_CREDENTIALS` write the line plainly

use std::io;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

/// Connect to the peer at `path` and send `line` before anything else.
pub async fn connect_and_announce(path: &Path, line: &[u8]) -> io::Result<UnixStream> {
    let mut stream = UnixStream::connect(path).await?;
    send_with_credentials(&mut stream, line).await?;
    Ok(stream)
}

/// Write all of `bytes`, attaching this process's credentials to the first
/// segment.
#[cfg(any(target_os = "linux", target_os = "android"))]
async fn send_with_credentials(stream: &mut UnixStream, bytes: &[u8]) -> io::Result<()> {
    use std::io::IoSlice;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixCredentials};
    use tokio::io::Interest;

    if bytes.is_empty() {
        return Ok(());
    }

    let credentials = UnixCredentials::new();
    let fd = stream.as_raw_fd();
    let sent = stream
        .async_io(Interest::WRITABLE, || {
            sendmsg::<()>(
                fd,
                &[IoSlice::new(bytes)],
                &[ControlMessage::ScmCredentials(&credentials)],
                MsgFlags::MSG_NOSIGNAL,
                None,
            )
            .map_err(io::Error::from)
        })
        .await?;

    stream.write_all(&bytes[sent..]).await
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
async fn send_with_credentials(stream: &mut UnixStream, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes).await
}
