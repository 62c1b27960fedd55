//! Peer node
//!
//! A node listens for inbound connections, dials outbound ones and floods
//! drawing events across every link. It is the only owner of the mesh state:
//! the connection registry, the known-peers set, the seen-message cache and
//! the last remote colour.
//!
//! Remote events reach the UI through a channel ([`PeerNode::next_event`]),
//! so the UI always handles them on its own task and never from a network
//! task.
//!
//! There is no heartbeat. A peer that vanishes without closing its socket
//! stays registered until a write to it fails.

use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::connection::{self, Connection, ConnectionId, Direction, Frame};
use crate::discovery::{self, KnownPeers};
use crate::error::{Error, Result};
use crate::frame;
use crate::protocol::{DrawSegment, Envelope, Message, PeerAddress};
use crate::registry::ConnectionRegistry;
use crate::seen::SeenCache;

/// Event delivered to the UI
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A remote participant drew a segment
    Draw(DrawSegment),
    /// A remote participant cleared the canvas
    Clear,
    /// A remote participant switched colour
    ColorChanged(String),
    /// A peer finished its hello on a new link
    PeerConnected(PeerAddress),
    /// The last link to a peer closed
    PeerDisconnected(PeerAddress),
    /// A dial gave up
    DialFailed { addr: PeerAddress, reason: String },
}

/// Node state shared across tasks
pub(crate) struct Shared {
    pub(crate) address: PeerAddress,
    pub(crate) config: NodeConfig,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) known: KnownPeers,
    seen: Mutex<SeenCache>,
    remote_color: RwLock<Option<String>>,
    event_tx: mpsc::Sender<NodeEvent>,
    shutdown_tx: broadcast::Sender<()>,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Queue a canvas event for the UI, waiting for room so none are lost
    pub(crate) async fn emit(&self, event: NodeEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }

    /// Queue a status event for the UI without waiting.
    ///
    /// Used on paths the UI itself may be awaiting (a local broadcast that
    /// drops a dead peer), where waiting on a full queue would deadlock.
    pub(crate) fn notify(&self, event: NodeEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "Status event not delivered");
        }
    }

    /// Dial a peer and register the connection
    pub(crate) async fn connect_to(self: &Arc<Self>, addr: PeerAddress) -> Result<ConnectionId> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        if addr == self.address {
            return Err(Error::SelfDial);
        }
        if let Some(id) = self.registry.find_by_peer(&addr).await {
            debug!(conn = %id, peer = %addr, "Already connected");
            return Ok(id);
        }

        info!(peer = %addr, "Dialing peer");
        let connect = TcpStream::connect((addr.host.as_str(), addr.port));
        let stream = match tokio::time::timeout(self.config.dial_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(Error::Dial { addr, source }),
            Err(_) => {
                return Err(Error::Dial {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
                })
            }
        };

        self.known.insert(addr).await;
        connection::open(stream, Direction::Outbound, self.clone()).await
    }

    /// Route one envelope received on connection `origin`
    pub(crate) async fn dispatch(self: &Arc<Self>, envelope: Envelope, origin: ConnectionId) {
        debug!(conn = %origin, kind = envelope.message.kind(), id = %envelope.id, "Received message");

        if envelope.message.is_relayed() {
            if !self.seen.lock().await.insert(envelope.id) {
                debug!(conn = %origin, id = %envelope.id, "Dropping already-seen message");
                return;
            }
            if let Err(e) = self.broadcast(&envelope, Some(origin)).await {
                warn!(conn = %origin, error = %e, "Relay failed");
            }
        }

        match envelope.message {
            Message::DrawSegment(segment) => {
                self.emit(NodeEvent::Draw(segment)).await;
            }
            Message::ClearCanvas => {
                self.emit(NodeEvent::Clear).await;
            }
            Message::ColorChange { color } => {
                *self.remote_color.write().await = Some(color.clone());
                self.emit(NodeEvent::ColorChanged(color)).await;
            }
            Message::PeerListAdvertisement { peers } => {
                discovery::handle_advertisement(self, origin, peers).await;
            }
            Message::Hello { listen } => {
                discovery::handle_hello(self, origin, listen).await;
            }
        }
    }

    /// Encode once and queue on every connection except `except`
    pub(crate) async fn broadcast(&self, envelope: &Envelope, except: Option<ConnectionId>) -> Result<usize> {
        let frame = Frame::from(frame::encode(envelope)?);
        let outcome = self.registry.broadcast(frame, except).await;
        for conn in outcome.dropped {
            self.release(conn).await;
        }
        Ok(outcome.queued)
    }

    /// Send a handshake message on a single connection
    pub(crate) async fn send_to(&self, id: ConnectionId, message: Message) {
        let frame = match frame::encode(&Envelope::new(message)) {
            Ok(frame) => Frame::from(frame),
            Err(e) => {
                warn!(conn = %id, error = %e, "Failed to encode message");
                return;
            }
        };

        let Some(sender) = self.registry.sender(id).await else {
            return;
        };
        if let Err(e) = sender.send(frame, self.config.send_timeout()).await {
            debug!(conn = %id, error = %e, "Send failed, dropping connection");
            self.drop_connection(id).await;
        }
    }

    /// Remove a connection, if still registered, and report the peer gone
    pub(crate) async fn drop_connection(&self, id: ConnectionId) {
        if let Some(conn) = self.registry.remove(id).await {
            self.release(conn).await;
        }
    }

    /// Called by a receive loop on exit
    pub(crate) async fn connection_closed(&self, id: ConnectionId) {
        debug!(conn = %id, "Connection closed");
        self.drop_connection(id).await;
    }

    async fn release(&self, conn: Connection) {
        let Some(peer) = conn.peer().cloned() else {
            return;
        };
        if self.is_shut_down() || self.registry.find_by_peer(&peer).await.is_some() {
            return;
        }

        info!(conn = %conn.id(), peer = %peer, "Peer disconnected");
        self.notify(NodeEvent::PeerDisconnected(peer));
    }
}

/// Handle to a running peer node
pub struct PeerNode {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    event_rx: mpsc::Receiver<NodeEvent>,
}

impl PeerNode {
    /// Bind the listen address, start accepting, and dial the initial peer
    /// if one is configured. Failing to bind is fatal; failing to reach the
    /// initial peer is reported as [`NodeEvent::DialFailed`].
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.listen.host.as_str(), config.listen.port))
            .await
            .map_err(|source| Error::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        // Announce the port actually bound, which differs when asked for 0
        let address = PeerAddress::new(config.listen.host.clone(), local_addr.port());

        info!(addr = %local_addr, announce = %address, "Listening for peers");

        let (event_tx, event_rx) = mpsc::channel(config.event_queue.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            known: KnownPeers::new(address.clone()),
            registry: ConnectionRegistry::new(config.send_timeout()),
            seen: Mutex::new(SeenCache::new(config.seen_capacity)),
            remote_color: RwLock::new(None),
            address,
            config,
            event_tx,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        });

        // Spawn accept loop
        let shutdown_rx = shared.shutdown_tx.subscribe();
        tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        let node = PeerNode {
            shared,
            local_addr,
            event_rx,
        };

        if let Some(peer) = node.shared.config.initial_peer.clone() {
            if let Err(e) = node.connect_to(peer.clone()).await {
                warn!(peer = %peer, error = %e, "Initial dial failed");
                node.shared.notify(NodeEvent::DialFailed {
                    addr: peer,
                    reason: e.to_string(),
                });
            }
        }

        Ok(node)
    }

    /// Address announced to peers
    pub fn address(&self) -> &PeerAddress {
        &self.shared.address
    }

    /// Socket address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dial a peer. The address joins the known peers and the discovery
    /// handshake starts once the connection is up.
    pub async fn connect_to(&self, addr: PeerAddress) -> Result<ConnectionId> {
        self.shared.connect_to(addr).await
    }

    /// Broadcast a locally originated message to every connection.
    ///
    /// Returns the number of connections it was queued on.
    pub async fn send_local_event(&self, message: Message) -> Result<usize> {
        let envelope = Envelope::new(message);
        self.shared.seen.lock().await.insert(envelope.id);
        self.shared.broadcast(&envelope, None).await
    }

    /// The local user dragged the pointer from one point to another
    pub async fn on_local_drag(
        &self,
        from_x: f64,
        from_y: f64,
        to_x: f64,
        to_y: f64,
        author: impl Into<String>,
    ) -> Result<usize> {
        self.send_local_event(Message::DrawSegment(DrawSegment {
            from_x,
            from_y,
            to_x,
            to_y,
            author: author.into(),
        }))
        .await
    }

    /// The local user cleared the canvas
    pub async fn on_local_clear(&self) -> Result<usize> {
        self.send_local_event(Message::ClearCanvas).await
    }

    /// The local user picked a new colour
    pub async fn on_local_color_change(&self, color: impl Into<String>) -> Result<usize> {
        self.send_local_event(Message::ColorChange {
            color: color.into(),
        })
        .await
    }

    /// Wait for the next remote event
    pub async fn next_event(&mut self) -> Option<NodeEvent> {
        self.event_rx.recv().await
    }

    /// Get the next remote event without waiting
    pub fn try_recv_event(&mut self) -> Option<NodeEvent> {
        self.event_rx.try_recv().ok()
    }

    pub async fn known_peers(&self) -> BTreeSet<PeerAddress> {
        self.shared.known.snapshot().await
    }

    /// Peers with a live connection that completed its hello
    pub async fn connected_peers(&self) -> BTreeSet<PeerAddress> {
        self.shared.registry.peers().await
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.registry.len().await
    }

    /// Colour most recently announced by a remote peer
    pub async fn remote_color(&self) -> Option<String> {
        self.shared.remote_color.read().await.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Stop accepting and close every connection. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shared.shutdown_tx.send(());
        let closed = self.shared.registry.close_all().await;
        info!(closed, "Node shut down");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    node: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        if let Err(e) = connection::open(stream, Direction::Inbound, node.clone()).await {
                            warn!(addr = %addr, error = %e, "Failed to open inbound connection");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}
