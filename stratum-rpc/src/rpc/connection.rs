//! Live connection I/O.
//!
//! A connection is two tasks over one [`TransportStreams`]: a reader that
//! frames inbound lines and hands each one to the owner in arrival order,
//! and a writer that drains an outbound queue of pre-encoded lines. Callers
//! never touch the socket; they push bytes through the [`ConnectionHandle`].
//!
//! Both tasks hold only a [`Weak`] reference to the owner, so dropping the
//! client is enough to wind everything down.

use std::net::SocketAddr;
use std::sync::Weak;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::error::{FramingError, RpcError};
use super::framer::{Decoded, LineFramer};
use super::transport::{BoxedReader, BoxedWriter, TransportStreams};

/// Receiver of everything a connection observes.
///
/// Callbacks run on the reader task, one at a time, in wire order.
pub(crate) trait LinkEvents: Send + Sync + 'static {
    /// A line decoded to JSON.
    fn on_message(&self, value: Value);

    /// A line had to be dropped.
    fn on_malformed(&self, error: FramingError);

    /// The connection ended on its own (EOF, read or write failure).
    ///
    /// Not called when the owner shut the connection down itself.
    fn on_closed(&self, generation: u64, error: Option<RpcError>);
}

/// Owner's grip on a running connection.
///
/// Dropping the handle shuts the connection down.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: CancellationToken,
    peer: Option<SocketAddr>,
}

impl ConnectionHandle {
    /// Start the reader and writer tasks.
    ///
    /// `generation` tags this connection so late events from an old one can
    /// be told apart from the current one.
    pub fn spawn<E: LinkEvents>(
        streams: TransportStreams,
        generation: u64,
        max_line_length: usize,
        events: Weak<E>,
    ) -> Self {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let TransportStreams {
            reader,
            writer,
            peer,
        } = streams;

        tokio::spawn(read_loop(
            reader,
            generation,
            max_line_length,
            events.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(write_loop(writer, generation, rx, events, shutdown.clone()));

        debug!(generation, peer = ?peer, "Connection tasks started");

        Self {
            generation,
            outbound,
            shutdown,
            peer,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue one encoded line. Returns false if the writer is gone.
    pub fn send(&self, line: Bytes) -> bool {
        self.outbound.send(line).is_ok()
    }

    /// Token cancelled when this connection shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Stop both tasks. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop<E: LinkEvents>(
    reader: BoxedReader,
    generation: u64,
    max_line_length: usize,
    events: Weak<E>,
    shutdown: CancellationToken,
) {
    let mut frames = FramedRead::new(reader, LineFramer::new(max_line_length));

    let error = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                trace!(generation, "Reader stopped");
                return;
            }
            item = frames.next() => {
                let Some(owner) = events.upgrade() else {
                    return;
                };
                match item {
                    Some(Ok(Decoded::Message(value))) => owner.on_message(value),
                    Some(Ok(Decoded::Malformed(e))) => owner.on_malformed(e),
                    Some(Err(e)) => break Some(e),
                    None => break None,
                }
            }
        }
    };

    match &error {
        Some(e) => warn!(generation, error = %e, "Connection read failed"),
        None => debug!(generation, "Server closed connection"),
    }

    if let Some(owner) = events.upgrade() {
        owner.on_closed(generation, error);
    }
}

async fn write_loop<E: LinkEvents>(
    mut writer: BoxedWriter,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: Weak<E>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = outbound.recv() => {
                let Some(line) = next else {
                    break;
                };

                trace!(tx = %String::from_utf8_lossy(&line).trim_end(), "Sending message");

                let result = async {
                    writer.write_all(&line).await?;
                    writer.flush().await
                }
                .await;

                if let Err(e) = result {
                    warn!(generation, error = %e, "Connection write failed");
                    if let Some(owner) = events.upgrade() {
                        owner.on_closed(generation, Some(RpcError::Io(e)));
                    }
                    return;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    trace!(generation, "Writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::rpc::transport::{Connector, TcpConnector};

    #[derive(Debug)]
    enum Seen {
        Message(Value),
        Malformed,
        Closed(u64, bool),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Seen>,
    }

    impl LinkEvents for Recorder {
        fn on_message(&self, value: Value) {
            let _ = self.tx.send(Seen::Message(value));
        }

        fn on_malformed(&self, _error: FramingError) {
            let _ = self.tx.send(Seen::Malformed);
        }

        fn on_closed(&self, generation: u64, error: Option<RpcError>) {
            let _ = self.tx.send(Seen::Closed(generation, error.is_some()));
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }

    #[tokio::test]
    async fn test_inbound_lines_reach_owner_in_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (owner, mut seen) = recorder();
        let _handle = ConnectionHandle::spawn(
            TransportStreams::from_stream(client, None),
            7,
            1024,
            Arc::downgrade(&owner),
        );

        server
            .write_all(b"{\"id\":2,\"result\":1}\ngarbage\n{\"method\":\"a.b\"}\n")
            .await
            .unwrap();
        drop(server);

        assert!(matches!(seen.recv().await, Some(Seen::Message(v)) if v["id"] == 2));
        assert!(matches!(seen.recv().await, Some(Seen::Malformed)));
        assert!(matches!(seen.recv().await, Some(Seen::Message(v)) if v["method"] == "a.b"));
        assert!(matches!(seen.recv().await, Some(Seen::Closed(7, false))));
    }

    #[tokio::test]
    async fn test_outbound_lines_are_written() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (owner, _seen) = recorder();
        let handle = ConnectionHandle::spawn(
            TransportStreams::from_stream(client, None),
            1,
            1024,
            Arc::downgrade(&owner),
        );

        assert!(handle.send(Bytes::from_static(b"[1]\n")));
        assert!(handle.send(Bytes::from_static(b"[2]\n")));

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"[1]\n[2]\n");
    }

    #[tokio::test]
    async fn test_shutdown_is_silent_and_closes_stream() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (owner, mut seen) = recorder();
        let handle = ConnectionHandle::spawn(
            TransportStreams::from_stream(client, None),
            3,
            1024,
            Arc::downgrade(&owner),
        );
        let token = handle.child_token();

        handle.shutdown();
        assert!(token.is_cancelled());

        // Writer shut its half down
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        // Owner is not told about a close it asked for
        let quiet = tokio::time::timeout(Duration::from_millis(50), seen.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_dropped_owner_stops_reader() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (owner, mut seen) = recorder();
        let _handle = ConnectionHandle::spawn(
            TransportStreams::from_stream(client, None),
            1,
            1024,
            Arc::downgrade(&owner),
        );
        drop(owner);

        server.write_all(b"1\n").await.unwrap();
        assert!(seen.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            let request: Value = serde_json::from_slice(&buf[..n]).unwrap();
            let reply = json!({"id": request["id"], "result": "pong"});
            let mut line = serde_json::to_vec(&reply).unwrap();
            line.push(b'\n');
            socket.write_all(&line).await.unwrap();
        });

        let streams = TcpConnector::new("127.0.0.1", addr.port())
            .connect()
            .await
            .unwrap();
        let (owner, mut seen) = recorder();
        let handle = ConnectionHandle::spawn(streams, 1, 1024, Arc::downgrade(&owner));
        assert_eq!(handle.peer(), Some(addr));

        handle.send(Bytes::from_static(b"{\"id\":2,\"method\":\"server.ping\",\"params\":[]}\n"));

        match seen.recv().await {
            Some(Seen::Message(v)) => assert_eq!(v, json!({"id": 2, "result": "pong"})),
            other => panic!("Expected reply, got {:?}", other),
        }
        server.await.unwrap();
    }
}
