//! A live TCP link to one peer
//!
//! Each connection runs two tasks: a receive loop that decodes frames and
//! hands them to the node in arrival order, and a writer task that drains a
//! bounded queue of pre-encoded frames so writes never interleave. Either
//! side failing tears the whole connection down; there is no retry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, SendError};
use crate::frame::{self, write_frame, FrameDecoder};
use crate::node::Shared;
use crate::protocol::{Envelope, Message, PeerAddress};

/// Bytes requested per socket read
const READ_CHUNK: usize = 4096;

/// One encoded frame, shared between every connection it is queued on
pub type Frame = Arc<[u8]>;

/// Registry key for a connection, unique for the lifetime of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by us
    Outbound,
}

/// Cloneable send half of a connection
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
}

impl ConnectionSender {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame, waiting at most `timeout` for room
    pub async fn send(&self, frame: Frame, timeout: Duration) -> std::result::Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }
}

/// Registry entry for an open connection.
///
/// Dropping it (or calling [`Connection::close`]) stops the receive loop,
/// which in turn stops the writer and releases the socket.
#[derive(Debug)]
pub struct Connection {
    sender: ConnectionSender,
    direction: Direction,
    dialer_port: u16,
    peer: Option<PeerAddress>,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        direction: Direction,
        dialer_port: u16,
        tx: mpsc::Sender<Frame>,
        close_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            sender: ConnectionSender { id, tx },
            direction,
            dialer_port,
            peer: None,
            close_tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.sender.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Ephemeral port on the dialing side of the socket.
    ///
    /// Both ends of a socket see the same value: the dialer reads it from
    /// its local address, the acceptor from the remote address.
    pub fn dialer_port(&self) -> u16 {
        self.dialer_port
    }

    /// Listen address the peer announced, once its hello has arrived
    pub fn peer(&self) -> Option<&PeerAddress> {
        self.peer.as_ref()
    }

    pub(crate) fn set_peer(&mut self, peer: PeerAddress) {
        self.peer = Some(peer);
    }

    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    /// Signal the receive loop to stop
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

/// Register a freshly connected socket and start its tasks.
///
/// The hello frame is queued before the connection becomes visible to
/// broadcasts, so it is always the first frame the peer sees.
pub(crate) async fn open(
    stream: TcpStream,
    direction: Direction,
    node: Arc<Shared>,
) -> Result<ConnectionId> {
    let remote = stream.peer_addr()?;
    let dialer_port = match direction {
        Direction::Outbound => stream.local_addr()?.port(),
        Direction::Inbound => remote.port(),
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(remote = %remote, error = %e, "Failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();

    let (tx, rx) = mpsc::channel(node.config.send_queue.max(1));
    let (close_tx, close_rx) = watch::channel(false);

    let id = node.registry.next_id();
    let conn = Connection::new(id, direction, dialer_port, tx, close_tx);

    let hello = frame::encode(&Envelope::new(Message::Hello {
        listen: node.address.clone(),
    }))?;
    conn.sender()
        .send(Frame::from(hello), node.config.send_timeout())
        .await?;

    node.registry.add(conn).await?;

    let writer_handle = tokio::spawn(writer_task(writer, rx, node.config.send_timeout()));
    tokio::spawn(receive_loop(reader, id, close_rx, writer_handle, node));

    info!(conn = %id, remote = %remote, direction = ?direction, "Connection open");
    Ok(id)
}

/// Writer task - sends queued frames to the peer
async fn writer_task(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>, timeout: Duration) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Write failed");
                break;
            }
            Err(_) => {
                debug!("Write timed out");
                break;
            }
        }
    }
}

/// Read loop - decodes frames and dispatches them until the link dies
async fn receive_loop(
    mut reader: OwnedReadHalf,
    id: ConnectionId,
    mut close_rx: watch::Receiver<bool>,
    mut writer_handle: JoinHandle<()>,
    node: Arc<Shared>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!(conn = %id, "Connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        decoder.extend(&buf[..n]);
                        // Dispatch may wait on a full event queue, so keep
                        // listening for close while it runs
                        tokio::select! {
                            keep = drain_frames(&mut decoder, id, &node) => {
                                if !keep {
                                    break;
                                }
                            }
                            _ = close_rx.changed() => {
                                debug!(conn = %id, "Connection closed locally during dispatch");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(conn = %id, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = close_rx.changed() => {
                debug!(conn = %id, "Connection closed locally");
                break;
            }
            _ = &mut writer_handle => {
                debug!(conn = %id, "Writer stopped");
                break;
            }
        }
    }

    // Cleanup
    writer_handle.abort();
    node.connection_closed(id).await;
}

/// Dispatch every complete frame in the decoder. Returns `false` if the
/// stream can no longer be trusted.
async fn drain_frames(decoder: &mut FrameDecoder, id: ConnectionId, node: &Arc<Shared>) -> bool {
    loop {
        match decoder.next_frame() {
            Ok(Some(envelope)) => node.dispatch(envelope, id).await,
            Ok(None) => return true,
            Err(Error::Decode(e)) => {
                warn!(conn = %id, error = %e, "Dropping undecodable frame");
            }
            Err(e) => {
                warn!(conn = %id, error = %e, "Unrecoverable stream error");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn test_connection(id: u64, queue: usize) -> (Connection, mpsc::Receiver<Frame>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(queue);
        let (close_tx, close_rx) = watch::channel(false);
        let conn = Connection::new(ConnectionId(id), Direction::Inbound, 5000, tx, close_tx);
        (conn, rx, close_rx)
    }

    #[tokio::test]
    async fn test_send_queues_frame() {
        let (conn, mut rx, _close_rx) = test_connection(1, 4);
        let frame = Frame::from(vec![1u8, 2, 3]);

        conn.sender()
            .send(frame.clone(), Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, rx, _close_rx) = test_connection(1, 4);
        drop(rx);

        let result = conn
            .sender()
            .send(Frame::from(vec![0u8]), Duration::from_millis(100))
            .await;
        assert_eq!(result, Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_send_times_out_on_full_queue() {
        let (conn, _rx, _close_rx) = test_connection(1, 1);
        let sender = conn.sender();
        let timeout = Duration::from_millis(50);

        sender.send(Frame::from(vec![0u8]), timeout).await.unwrap();
        let result = sender.send(Frame::from(vec![1u8]), timeout).await;
        assert_eq!(result, Err(SendError::Timeout));
    }

    #[tokio::test]
    async fn test_close_signals_receiver() {
        let (conn, _rx, mut close_rx) = test_connection(1, 1);
        conn.close();
        close_rx.changed().await.unwrap();
        assert!(*close_rx.borrow());
    }

    #[tokio::test]
    async fn test_send_failure_propagates_as_error() {
        let (conn, rx, _close_rx) = test_connection(1, 1);
        drop(rx);

        let result: Result<()> = async {
            conn.sender()
                .send(Frame::from(vec![0u8]), Duration::from_millis(50))
                .await?;
            Ok(())
        }
        .await;
        assert!(matches!(result, Err(Error::Send(SendError::Closed))));
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "#7");
    }
}
