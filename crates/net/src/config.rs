//! Node configuration
//!
//! Supplied by the embedding application; the network layer never parses
//! process arguments itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::PeerAddress;
use crate::seen::DEFAULT_SEEN_CAPACITY;

/// Per-node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind and to announce to peers
    pub listen: PeerAddress,
    /// Peer to dial right after startup
    #[serde(default)]
    pub initial_peer: Option<PeerAddress>,
    /// How long a send may wait for room in a connection's queue
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Connect timeout for each dial attempt
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Attempts per discovered peer before giving up
    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,
    /// Outgoing frames buffered per connection
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Remote events buffered for the UI
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
    /// Message ids remembered for loop suppression
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
}

fn default_send_timeout_ms() -> u64 {
    2000
}

fn default_dial_timeout_ms() -> u64 {
    3000
}

fn default_dial_attempts() -> u32 {
    3
}

fn default_send_queue() -> usize {
    256
}

fn default_event_queue() -> usize {
    1024
}

fn default_seen_capacity() -> usize {
    DEFAULT_SEEN_CAPACITY
}

impl NodeConfig {
    /// Config with defaults for everything but the listen address
    pub fn new(listen: PeerAddress) -> Self {
        Self {
            listen,
            initial_peer: None,
            send_timeout_ms: default_send_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            dial_attempts: default_dial_attempts(),
            send_queue: default_send_queue(),
            event_queue: default_event_queue(),
            seen_capacity: default_seen_capacity(),
        }
    }

    /// Set the peer dialed at startup
    pub fn with_initial_peer(mut self, peer: PeerAddress) -> Self {
        self.initial_peer = Some(peer);
        self
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_filled_in() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"listen":{"host":"127.0.0.1","port":9000}}"#).unwrap();

        assert_eq!(config.listen, PeerAddress::new("127.0.0.1", 9000));
        assert!(config.initial_peer.is_none());
        assert_eq!(config.send_timeout(), Duration::from_secs(2));
        assert_eq!(config.dial_attempts, 3);
        assert_eq!(config.seen_capacity, DEFAULT_SEEN_CAPACITY);
    }

    #[test]
    fn test_builder_sets_initial_peer() {
        let config = NodeConfig::new(PeerAddress::new("127.0.0.1", 9001))
            .with_initial_peer(PeerAddress::new("127.0.0.1", 9000));
        assert_eq!(
            config.initial_peer,
            Some(PeerAddress::new("127.0.0.1", 9000))
        );
    }
}
