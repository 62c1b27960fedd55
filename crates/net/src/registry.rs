//! Live connection registry
//!
//! Shared by the accept loop, dialers, every receive loop and every caller
//! of broadcast. Broadcasts work on a snapshot of the senders taken under
//! the lock, so a connection closing mid-broadcast can neither corrupt the
//! iteration nor be removed twice.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use crate::connection::{Connection, ConnectionId, ConnectionSender, Direction, Frame};
use crate::error::{Error, Result};
use crate::protocol::PeerAddress;

/// A connection as seen by the duplicate-link tie-break
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub id: ConnectionId,
    pub direction: Direction,
    pub dialer_port: u16,
}

/// Result of attaching a peer address to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAssignment {
    /// The connection is no longer registered
    Missing,
    /// The connection already had a peer address
    AlreadyAssigned,
    /// First live link to this peer
    Unique(Link),
    /// Another live link to the same peer exists
    Duplicate { new: Link, existing: Link },
}

/// What a broadcast reached
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    /// Connections the frame was queued on
    pub queued: usize,
    /// Connections removed because the send failed
    pub dropped: Vec<Connection>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Connection>,
    closed: bool,
}

/// Thread-safe collection of open connections
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    /// Allocate an id for a connection about to be added
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a connection. Fails once [`close_all`](Self::close_all) ran.
    pub async fn add(&self, conn: Connection) -> Result<()> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(Error::ShutDown);
        }
        state.connections.insert(conn.id(), conn);
        Ok(())
    }

    /// Remove a connection if it is still registered, signalling it to close
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let conn = self.state.write().await.connections.remove(&id);
        if let Some(conn) = &conn {
            conn.close();
        }
        conn
    }

    /// Attach the peer's announced listen address to a connection and report
    /// any other live link to the same peer.
    pub async fn assign_peer(&self, id: ConnectionId, peer: &PeerAddress) -> PeerAssignment {
        let mut state = self.state.write().await;

        let existing = state
            .connections
            .values()
            .filter(|c| c.id() != id && c.peer() == Some(peer))
            .map(|c| Link {
                id: c.id(),
                direction: c.direction(),
                dialer_port: c.dialer_port(),
            })
            .min_by_key(|link| link.id);

        let Some(conn) = state.connections.get_mut(&id) else {
            return PeerAssignment::Missing;
        };
        if conn.peer().is_some() {
            return PeerAssignment::AlreadyAssigned;
        }

        conn.set_peer(peer.clone());
        let new = Link {
            id,
            direction: conn.direction(),
            dialer_port: conn.dialer_port(),
        };

        match existing {
            Some(existing) => PeerAssignment::Duplicate { new, existing },
            None => PeerAssignment::Unique(new),
        }
    }

    /// Find a live connection to the given peer
    pub async fn find_by_peer(&self, peer: &PeerAddress) -> Option<ConnectionId> {
        self.state
            .read()
            .await
            .connections
            .values()
            .find(|c| c.peer() == Some(peer))
            .map(|c| c.id())
    }

    pub async fn sender(&self, id: ConnectionId) -> Option<ConnectionSender> {
        self.state
            .read()
            .await
            .connections
            .get(&id)
            .map(|c| c.sender())
    }

    /// Queue a frame on every connection except `except`.
    ///
    /// A failing connection is removed and the broadcast carries on with
    /// the rest.
    pub async fn broadcast(&self, frame: Frame, except: Option<ConnectionId>) -> BroadcastOutcome {
        let targets: Vec<ConnectionSender> = {
            let state = self.state.read().await;
            state
                .connections
                .values()
                .filter(|c| except != Some(c.id()))
                .map(|c| c.sender())
                .collect()
        };

        let mut outcome = BroadcastOutcome::default();
        for target in targets {
            match target.send(frame.clone(), self.send_timeout).await {
                Ok(()) => outcome.queued += 1,
                Err(e) => {
                    debug!(conn = %target.id(), error = %e, "Broadcast send failed, dropping connection");
                    if let Some(conn) = self.remove(target.id()).await {
                        outcome.dropped.push(conn);
                    }
                }
            }
        }
        outcome
    }

    /// Listen addresses of peers with a live, announced connection
    pub async fn peers(&self) -> BTreeSet<PeerAddress> {
        self.state
            .read()
            .await
            .connections
            .values()
            .filter_map(|c| c.peer().cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and remove every connection; later adds are refused
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Connection> = {
            let mut state = self.state.write().await;
            state.closed = true;
            state.connections.drain().map(|(_, c)| c).collect()
        };
        for conn in &drained {
            conn.close();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, watch};

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_millis(50))
    }

    async fn add_connection(
        registry: &ConnectionRegistry,
        direction: Direction,
    ) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        let (close_tx, _close_rx) = watch::channel(false);
        let id = registry.next_id();
        let port = 5000 + id.0 as u16;
        registry
            .add(Connection::new(id, direction, port, tx, close_tx))
            .await
            .unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded() {
        let registry = registry();
        let (a, mut rx_a) = add_connection(&registry, Direction::Inbound).await;
        let (_b, mut rx_b) = add_connection(&registry, Direction::Inbound).await;

        let frame = Frame::from(vec![9u8]);
        let outcome = registry.broadcast(frame.clone(), Some(a)).await;

        assert_eq!(outcome.queued, 1);
        assert_eq!(rx_b.recv().await.unwrap(), frame);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_survives_closed_connection() {
        let registry = registry();
        let (_a, mut rx_a) = add_connection(&registry, Direction::Inbound).await;
        let (b, rx_b) = add_connection(&registry, Direction::Outbound).await;
        let (_c, mut rx_c) = add_connection(&registry, Direction::Inbound).await;

        // b's writer is gone
        drop(rx_b);

        let frame = Frame::from(vec![1u8, 2]);
        let outcome = registry.broadcast(frame.clone(), None).await;

        assert_eq!(outcome.queued, 2);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].id(), b);
        assert_eq!(rx_a.recv().await.unwrap(), frame);
        assert_eq!(rx_c.recv().await.unwrap(), frame);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = registry();
        let (a, _rx) = add_connection(&registry, Direction::Inbound).await;

        assert!(registry.remove(a).await.is_some());
        assert!(registry.remove(a).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_assign_peer_reports_duplicate() {
        let registry = registry();
        let peer = PeerAddress::new("127.0.0.1", 9000);
        let (a, _rx_a) = add_connection(&registry, Direction::Outbound).await;
        let (b, _rx_b) = add_connection(&registry, Direction::Inbound).await;

        assert_eq!(
            registry.assign_peer(a, &peer).await,
            PeerAssignment::Unique(Link {
                id: a,
                direction: Direction::Outbound,
                dialer_port: 5000 + a.0 as u16,
            })
        );
        assert_eq!(
            registry.assign_peer(b, &peer).await,
            PeerAssignment::Duplicate {
                new: Link {
                    id: b,
                    direction: Direction::Inbound,
                    dialer_port: 5000 + b.0 as u16,
                },
                existing: Link {
                    id: a,
                    direction: Direction::Outbound,
                    dialer_port: 5000 + a.0 as u16,
                },
            }
        );
        assert_eq!(
            registry.assign_peer(b, &peer).await,
            PeerAssignment::AlreadyAssigned
        );
        assert!(registry.find_by_peer(&peer).await.is_some());
        assert_eq!(registry.peers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_refuses_later_adds() {
        let registry = registry();
        let (_a, _rx) = add_connection(&registry, Direction::Inbound).await;

        assert_eq!(registry.close_all().await, 1);
        assert!(registry.is_empty().await);

        let (tx, _rx) = mpsc::channel(1);
        let (close_tx, _close_rx) = watch::channel(false);
        let result = registry
            .add(Connection::new(
                registry.next_id(),
                Direction::Inbound,
                5001,
                tx,
                close_tx,
            ))
            .await;
        assert!(matches!(result, Err(Error::ShutDown)));
    }
}
