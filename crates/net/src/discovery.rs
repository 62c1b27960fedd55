//! Peer discovery
//!
//! Every new connection, in either direction, starts with both sides
//! sending `Hello`. When a node receives the peer's hello it records the
//! announced address, settles duplicate links, and answers with a
//! `PeerListAdvertisement` of everything it knows except that peer. The
//! receiver of an advertisement dials each address it had never heard of.
//!
//! Two nodes that learn of each other through different intermediaries may
//! dial each other at the same time. Both ends then hold two sockets to the
//! same peer; the one kept is the one dialed by the lexicographically
//! smaller address, and both ends reach the same answer independently. When
//! one node dials the same peer twice, the socket with the lower dialer-side
//! port is kept, a value both ends read off the socket itself.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionId, Direction};
use crate::error::Error;
use crate::node::{NodeEvent, Shared};
use crate::protocol::{Message, PeerAddress};
use crate::registry::{Link, PeerAssignment};

/// Delay before each retry of a discovery dial
const DIAL_RETRY_DELAYS_MS: &[u64] = &[250, 1000, 3000];

/// Future of a background discovery dial
pub(crate) type DialFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Addresses this node has learned of, never including its own
pub struct KnownPeers {
    own: PeerAddress,
    peers: RwLock<HashSet<PeerAddress>>,
}

impl KnownPeers {
    pub fn new(own: PeerAddress) -> Self {
        Self {
            own,
            peers: RwLock::new(HashSet::new()),
        }
    }

    /// Record an address. Returns `true` only if it was new and not our own.
    pub async fn insert(&self, addr: PeerAddress) -> bool {
        if addr == self.own {
            return false;
        }
        self.peers.write().await.insert(addr)
    }

    /// Merge an advertised set, returning the addresses that were new
    pub async fn merge(&self, advertised: impl IntoIterator<Item = PeerAddress>) -> Vec<PeerAddress> {
        let mut peers = self.peers.write().await;
        advertised
            .into_iter()
            .filter(|addr| *addr != self.own)
            .filter(|addr| peers.insert(addr.clone()))
            .collect()
    }

    #[cfg(test)]
    pub async fn contains(&self, addr: &PeerAddress) -> bool {
        self.peers.read().await.contains(addr)
    }

    pub async fn snapshot(&self) -> BTreeSet<PeerAddress> {
        self.peers.read().await.iter().cloned().collect()
    }

    /// The advertisement sent to `peer`: everything known except itself
    pub async fn advertisement_for(&self, peer: &PeerAddress) -> BTreeSet<PeerAddress> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|addr| *addr != peer)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Which side's dial survives between `local` and `remote`
pub fn preferred_direction(local: &PeerAddress, remote: &PeerAddress) -> Direction {
    if local < remote {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

/// Pick the link to close when two connect the same pair of nodes
pub fn duplicate_loser(local: &PeerAddress, remote: &PeerAddress, existing: Link, new: Link) -> ConnectionId {
    if existing.direction == new.direction {
        // Hellos may be assigned in a different order on each end
        return if new.dialer_port < existing.dialer_port {
            existing.id
        } else {
            new.id
        };
    }

    if new.direction == preferred_direction(local, remote) {
        existing.id
    } else {
        new.id
    }
}

/// Handle the peer's hello on connection `id`
pub(crate) async fn handle_hello(node: &Arc<Shared>, id: ConnectionId, listen: PeerAddress) {
    if listen == node.address {
        warn!(conn = %id, "Peer announced our own address, closing");
        node.drop_connection(id).await;
        return;
    }

    match node.registry.assign_peer(id, &listen).await {
        PeerAssignment::Missing => return,
        PeerAssignment::AlreadyAssigned => {
            debug!(conn = %id, peer = %listen, "Ignoring repeated hello");
            return;
        }
        PeerAssignment::Unique(_) => {
            node.known.insert(listen.clone()).await;
            info!(conn = %id, peer = %listen, "Peer connected");
            node.notify(NodeEvent::PeerConnected(listen.clone()));
        }
        PeerAssignment::Duplicate { new, existing } => {
            node.known.insert(listen.clone()).await;
            let loser = duplicate_loser(&node.address, &listen, existing, new);
            let kept = if loser == new.id { existing.id } else { new.id };
            debug!(peer = %listen, kept = %kept, closed = %loser, "Resolving duplicate link");
            node.drop_connection(loser).await;
            if loser == id {
                return;
            }
        }
    }

    let peers = node.known.advertisement_for(&listen).await;
    debug!(conn = %id, count = peers.len(), "Advertising known peers");
    node.send_to(id, Message::PeerListAdvertisement { peers }).await;
}

/// Handle a peer list advertisement received on connection `origin`
pub(crate) async fn handle_advertisement(
    node: &Arc<Shared>,
    origin: ConnectionId,
    peers: BTreeSet<PeerAddress>,
) {
    let fresh = node.known.merge(peers).await;
    if fresh.is_empty() {
        return;
    }

    debug!(conn = %origin, count = fresh.len(), "Learned new peers");
    for addr in fresh {
        tokio::spawn(dial_discovered(node.clone(), addr));
    }
}

/// Dial an address learned through discovery, with bounded retries.
///
/// Boxed because the call graph is cyclic: a dial opens a connection whose
/// receive loop may spawn further dials.
pub(crate) fn dial_discovered(node: Arc<Shared>, addr: PeerAddress) -> DialFuture {
    Box::pin(async move {
        let attempts = node.config.dial_attempts.max(1) as usize;

        for attempt in 0..attempts {
            if node.is_shut_down() {
                return;
            }
            if node.registry.find_by_peer(&addr).await.is_some() {
                debug!(peer = %addr, "Already connected, skipping dial");
                return;
            }

            match node.connect_to(addr.clone()).await {
                Ok(id) => {
                    debug!(conn = %id, peer = %addr, "Discovery dial succeeded");
                    return;
                }
                Err(Error::ShutDown) | Err(Error::SelfDial) => return,
                Err(e) => {
                    warn!(peer = %addr, attempt = attempt + 1, error = %e, "Discovery dial failed");
                    if attempt + 1 == attempts {
                        node.notify(NodeEvent::DialFailed {
                            addr: addr.clone(),
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }

            let delay_ms = DIAL_RETRY_DELAYS_MS[attempt.min(DIAL_RETRY_DELAYS_MS.len() - 1)];
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    })
}
