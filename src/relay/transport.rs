//! The two wired sides of a relay.
//!
//! # Responsibilities
//! - Read at most one relay buffer per event and post it to the loop
//! - Drain a bounded outbox into each stream
//! - Flush then close, or drop everything immediately
//!
//! # Design Decisions
//! - A reader reserves a slot in the opposite outbox before every read, so
//!   a slow peer pauses its source instead of losing bytes
//! - The loop delivers each chunk into the slot reserved for it
//! - Closing the outbox lets the writer drain, then shuts the write side
//!   down (a TLS close-notify on the remote side)
//! - Dropping a transport aborts both helpers

use std::fmt;
use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::task::JoinHandle;

use crate::relay::connection::ConnectionId;
use crate::relay::event::{Event, EventKind, Side};

/// Largest chunk moved per read.
pub const RELAY_BUFFER_LEN: usize = 8192;

/// Chunks a transport queues for writing before its source stops reading.
pub const OUTBOX_DEPTH: usize = 64;

/// A helper task that is aborted when its owner goes away.
#[derive(Debug)]
pub struct Task(JoinHandle<()>);

impl Task {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Bytes read from one side, together with the outbox slot on the other
/// side they are bound for.
pub struct Chunk {
    data: Vec<u8>,
    slot: OwnedPermit<Vec<u8>>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Queue the bytes for the destination writer. Never waits.
    pub fn deliver(self) {
        self.slot.send(self.data);
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("len", &self.data.len()).finish()
    }
}

/// Reader and writer helpers for one stream.
#[derive(Debug)]
pub struct Transport {
    outbox: Option<mpsc::Sender<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Transport {
    /// Start relaying between `remote` and `local` for connection `conn`.
    ///
    /// Returns the remote transport first.
    pub fn pair<R, L>(conn: ConnectionId, remote: R, local: L, events: mpsc::Sender<Event>) -> (Transport, Transport)
    where
        R: AsyncRead + AsyncWrite + Send + 'static,
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (to_remote, remote_queue) = mpsc::channel(OUTBOX_DEPTH);
        let (to_local, local_queue) = mpsc::channel(OUTBOX_DEPTH);

        let remote = Self::wire(conn, Side::Remote, remote, (to_remote.clone(), remote_queue), to_local.clone(), events.clone());
        let local = Self::wire(conn, Side::Local, local, (to_local, local_queue), to_remote, events);
        (remote, local)
    }

    fn wire<S>(
        conn: ConnectionId,
        side: Side,
        stream: S,
        (outbox, queue): (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>),
        destination: mpsc::Sender<Vec<u8>>,
        events: mpsc::Sender<Event>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let reader = tokio::spawn(read_loop(conn, side, read_half, destination, events.clone()));
        let writer = tokio::spawn(write_loop(conn, side, write_half, queue, events));

        Self {
            outbox: Some(outbox),
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    fn disable_read(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Stop reading, write out what is queued and shut the stream down.
    ///
    /// Returns the writer so callers can wait for the flush; dropping the
    /// handle detaches it. The writer finishes once the opposite reader has
    /// also stopped, since that reader holds the way into this outbox.
    pub fn flush_and_close(mut self) -> Option<JoinHandle<()>> {
        self.disable_read();
        self.outbox = None;
        self.writer.take()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn read_loop<R>(
    conn: ConnectionId,
    side: Side,
    mut reader: R,
    destination: mpsc::Sender<Vec<u8>>,
    events: mpsc::Sender<Event>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_LEN];
    loop {
        // The destination's writer is gone; its own side reports why.
        let Ok(slot) = destination.clone().reserve_owned().await else {
            tracing::debug!(connection_id = %conn, %side, "Destination closed, reader stopping");
            return;
        };

        let kind = match reader.read(&mut buf).await {
            Ok(0) => EventKind::Eof(side),
            Ok(n) => EventKind::Readable(side, Chunk { data: buf[..n].to_vec(), slot }),
            Err(e) => EventKind::Error(side, e),
        };
        let more = matches!(kind, EventKind::Readable(..));
        if events.send(Event::new(conn, kind)).await.is_err() || !more {
            return;
        }
    }
}

async fn write_loop<W>(
    conn: ConnectionId,
    side: Side,
    mut writer: W,
    mut queue: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<Event>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = queue.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            let _ = events.send(Event::new(conn, EventKind::Error(side, e))).await;
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(connection_id = %conn, %side, error = %e, "Shutdown after flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    struct Wired {
        remote: Transport,
        local: Transport,
        client: DuplexStream,
        peer: DuplexStream,
        events: mpsc::Receiver<Event>,
    }

    fn wired(capacity: usize) -> Wired {
        let (remote, client) = duplex(capacity);
        let (local, peer) = duplex(capacity);
        let (tx, events) = mpsc::channel(2 * OUTBOX_DEPTH);
        let (remote, local) = Transport::pair(ConnectionId::new(), remote, local, tx);
        Wired { remote, local, client, peer, events }
    }

    async fn next(events: &mut mpsc::Receiver<Event>) -> EventKind {
        events.recv().await.unwrap().kind
    }

    #[tokio::test]
    async fn chunks_reach_the_opposite_side_and_eof_follows() {
        let mut w = wired(1024);

        w.client.write_all(b"ping").await.unwrap();
        match next(&mut w.events).await {
            EventKind::Readable(Side::Remote, chunk) => chunk.deliver(),
            other => panic!("unexpected event {other:?}"),
        }
        let mut got = [0u8; 4];
        w.peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        drop(w.client);
        assert!(matches!(next(&mut w.events).await, EventKind::Eof(Side::Remote)));
    }

    #[tokio::test]
    async fn reads_never_exceed_relay_buffer() {
        let mut w = wired(4 * RELAY_BUFFER_LEN);

        let payload = vec![7u8; 3 * RELAY_BUFFER_LEN];
        w.peer.write_all(&payload).await.unwrap();

        let mut received = 0;
        while received < payload.len() {
            match next(&mut w.events).await {
                EventKind::Readable(Side::Local, chunk) => {
                    assert!(chunk.len() <= RELAY_BUFFER_LEN);
                    received += chunk.len();
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(received, payload.len());
    }

    #[tokio::test]
    async fn reader_pauses_while_destination_outbox_is_full() {
        let mut w = wired(64);
        let mut client = w.client;
        let _feeder = tokio::spawn(async move {
            while client.write_all(b"x").await.is_ok() {}
        });

        // Undelivered chunks keep their slots, so the outbox counts as full.
        let mut held = Vec::new();
        while held.len() < OUTBOX_DEPTH {
            match next(&mut w.events).await {
                EventKind::Readable(Side::Remote, chunk) => held.push(chunk),
                other => panic!("unexpected event {other:?}"),
            }
        }
        let more = tokio::time::timeout(Duration::from_millis(100), w.events.recv()).await;
        assert!(more.is_err(), "reader kept reading past a full outbox");

        held.pop().unwrap().deliver();
        match next(&mut w.events).await {
            EventKind::Readable(Side::Remote, _) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn flush_and_close_writes_delivered_chunks_then_eof() {
        let mut w = wired(1024);

        w.client.write_all(b"one two").await.unwrap();
        match next(&mut w.events).await {
            EventKind::Readable(Side::Remote, chunk) => chunk.deliver(),
            other => panic!("unexpected event {other:?}"),
        }

        drop(w.remote);
        w.local.flush_and_close().unwrap().await.unwrap();

        let mut out = Vec::new();
        w.peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"one two");
    }
}
