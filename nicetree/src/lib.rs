#![forbid(unsafe_code)]
//! nicetree - hierarchical overlay clustering for scalable multicast
//!
//! Peers self-organize into a hierarchy of bounded-size clusters. Layer 0
//! holds every peer; each cluster's leader also sits in the cluster one layer
//! up, recursively, until a single top cluster remains, led by the
//! rendezvous point (RP). Every node keeps O(log N) state and application
//! data reaches the whole group by flooding along cluster edges.
//!
//! # Key Properties
//!
//! - Clusters hold between `K` and `3K+1` members; oversized clusters split
//!   and undersized ones merge into the nearest sibling
//! - Leaders sit at the graph center of their cluster, measured by
//!   heartbeat round trips
//! - Leader collisions and flapping heartbeats resolve deterministically
//! - The node is sans-IO: it consumes datagrams and timer firings, and
//!   produces datagrams, application data and events
//!
//! # Example (integration pattern)
//!
//! ```ignore
//! use nicetree::{Node, DefaultConfig, NodeId};
//!
//! // Implement Transport, BootstrapOracle, Random and Clock for your platform
//! let mut node = Node::<_, _, _, _, DefaultConfig>::new(id, transport, oracle, random, clock);
//!
//! // Spawn the node's run loop
//! spawn(async move {
//!     node.run().await;
//! });
//!
//! // Multicast to the group
//! node.outgoing().send(b"hello".to_vec()).await;
//!
//! // Receive data from other members
//! let data = node.incoming().receive().await;
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Core types (NodeId, message bodies, events, metrics)
//! - [`wire`] - Wire format serialization
//! - [`traits`] - Transport, BootstrapOracle, Random, Clock traits
//! - [`node`] - Main Node struct and public API
//! - [`cluster`] - Per-layer cluster membership
//! - [`peer`] - Peer directory and distance bookkeeping
//! - [`distance`] - Graph center and aggregate distances
//! - [`split`] - Split planning
//! - [`timer`] - Generation-checked timer slots
//! - [`time`] - Timestamp and Duration types
//! - [`config`] - Compile-time protocol tunables

// Mocks are for tests and simulation only.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It exposes mock collaborators intended only for tests and simulation."
);

pub mod cluster;
pub mod config;
pub mod distance;
pub mod node;
pub mod peer;
pub mod split;
pub mod time;
pub mod timer;
pub mod traits;
pub mod types;
pub mod wire;

mod heartbeat;
mod join;
mod maintenance;
mod merge;
mod multicast;
mod transfer;

// Re-export main types at crate root
pub use cluster::{ClusterLayer, ClusterTable};
pub use config::{DefaultConfig, FastConfig, NiceConfig};
pub use distance::{find_center, DistanceView};
pub use node::Node;
pub use peer::{PeerDirectory, PeerInfo};
pub use split::{plan_split, SplitPlan};
pub use time::{Duration, Timestamp};
pub use timer::{TimerId, TimerKind};
pub use traits::{BootstrapOracle, Clock, Datagram, IncomingData, Random, Transport};
pub use types::{Error, Event, NodeId, NodeMetrics, ProtocolState};
