//! Scribble Network Library
//!
//! Serverless peer-to-peer mesh for a shared whiteboard.
//!
//! # Architecture
//!
//! - **Node**: listens for peers, dials peers, floods drawing events
//! - **Connection**: one TCP link with its own receive loop and writer
//! - **Registry**: the set of live connections, broadcast with exclusion
//! - **Discovery**: hello + known-peer advertisement on every new link
//! - **Protocol**: length-prefixed, versioned JSON envelopes
//!
//! # Usage
//!
//! ```ignore
//! let config = NodeConfig::new("127.0.0.1:9001".parse()?)
//!     .with_initial_peer("127.0.0.1:9000".parse()?);
//! let mut node = PeerNode::start(config).await?;
//!
//! node.on_local_drag(10.0, 10.0, 20.0, 20.0, "alice").await?;
//!
//! while let Some(event) = node.next_event().await {
//!     match event {
//!         NodeEvent::Draw(segment) => { /* render */ }
//!         NodeEvent::Clear => { /* wipe */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod seen;

pub use config::NodeConfig;
pub use connection::{ConnectionId, Direction};
pub use error::{DecodeError, Error, Result, SendError};
pub use frame::{decode, encode, FrameDecoder};
pub use node::{NodeEvent, PeerNode};
pub use protocol::{DrawSegment, Envelope, Message, PeerAddress, PROTOCOL_VERSION};

/// Default listen port for Scribble nodes
pub const DEFAULT_PORT: u16 = 9000;
