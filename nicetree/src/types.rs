//! Core types and constants for the nicetree protocol.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::time::Duration;

// Hierarchy bounds
pub const MAX_LAYERS: usize = 10;
pub const SPLIT_EXHAUSTIVE_LIMIT: usize = 18; // exhaustive 2-partition search below this size
pub const MULTICAST_HOP_LIMIT: u8 = 8;

// Protocol constants
pub const TEMP_PEER_TIMEOUT_HEARTBEATS: u64 = 3;
pub const COLLISION_WINDOW: usize = 4;
pub const EMA_WEIGHT: f64 = 0.1;
/// Lower bound on the improvement (ms) required before refinement moves a leader.
pub const MIN_IMPROVEMENT_FLOOR_MS: f64 = 5.0;

/// Transport-layer address used as the identity of a peer.
///
/// Ordering is lexicographic on (octets, port), which makes it usable as the
/// deterministic leader tie-break.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    ip: [u8; 4],
    port: u16,
}

impl NodeId {
    /// The "no node" sentinel.
    pub const UNSPECIFIED: NodeId = NodeId {
        ip: [0; 4],
        port: 0,
    };

    pub const fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip, port }
    }

    /// Build an address from a host-order IPv4 value.
    pub const fn from_ipv4(ip: u32, port: u16) -> Self {
        Self {
            ip: ip.to_be_bytes(),
            port,
        }
    }

    pub const fn ip(&self) -> [u8; 4] {
        self.ip
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.ip;
        write!(f, "{}.{}.{}.{}:{}", a, b, c, d, self.port)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Payload type for multicast data.
pub type Payload = Vec<u8>;

/// Round-trip estimate in milliseconds.
pub type Distance = f64;

/// Per-protocol-state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolState {
    Init,
    Bootstrap,
    Ready,
}

/// Plain control message carrying a layer.
///
/// Used for QUERY, JOIN_CLUSTER, POLL_RP, JOINEVAL, REMOVE, PING_PROBE and
/// their responses. `layer: None` encodes "unspecified" (e.g. QUERY(-1)).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub src: NodeId,
    pub layer: Option<u8>,
}

impl Control {
    pub fn new(src: NodeId, layer: Option<usize>) -> Self {
        Self {
            src,
            layer: layer.map(|l| l as u8),
        }
    }
}

/// Answer to a QUERY: the responder's cluster at `layer` (responder excluded).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub src: NodeId,
    pub layer: u8,
    pub members: Vec<NodeId>,
}

/// Sequence bookkeeping shared by both heartbeat kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatStamp {
    /// Sequence number of this heartbeat, personalized per recipient.
    pub seq_no: u32,
    /// Last sequence number received from the recipient.
    pub seq_rsp_no: u32,
    /// Time the sender held the recipient's last heartbeat before answering.
    pub hb_delay: Duration,
}

/// Member to leader heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub src: NodeId,
    pub layer: u8,
    pub stamp: HeartbeatStamp,
    pub members: Vec<NodeId>,
    pub distances: Vec<Option<Distance>>,
    /// Size of the sender's own cluster one layer down, if it leads one.
    pub sublayer_members: u32,
}

/// Leader to member heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderHeartbeat {
    pub src: NodeId,
    pub layer: u8,
    pub stamp: HeartbeatStamp,
    pub members: Vec<NodeId>,
    pub distances: Vec<Option<Distance>>,
    pub supercluster_leader: Option<NodeId>,
    pub supercluster_members: Vec<NodeId>,
}

/// Leadership hand-off: everything the new leader inherits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderTransfer {
    pub src: NodeId,
    pub layer: u8,
    pub members: Vec<NodeId>,
    pub supercluster_leader: Option<NodeId>,
    pub supercluster_members: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterMergeRequest {
    pub src: NodeId,
    pub layer: u8,
    pub members: Vec<NodeId>,
    pub new_cluster_leader: Option<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Multicast {
    pub src: NodeId,
    pub last_hop: NodeId,
    pub hop_count: u8,
    /// Layer the message was sent on (None when freshly originated).
    pub layer: Option<u8>,
    pub payload: Payload,
}

/// Events emitted by the node for application handling.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Join completed; the node is READY.
    Ready,
    /// No RP existed at bootstrap; this node is now the RP.
    BecameRendezvousPoint,
    /// Joined the cluster led by `leader` at `layer`.
    JoinedCluster { layer: usize, leader: NodeId },
    /// Two leaders claimed the same layer.
    LeaderCollision {
        layer: usize,
        winner: NodeId,
        loser: NodeId,
    },
    /// An oversized cluster was split.
    ClusterSplit {
        layer: usize,
        sizes: (usize, usize),
    },
    /// An undersized cluster was folded into a sibling.
    ClusterMerged { layer: usize, into: NodeId },
    /// Leadership of `layer` was handed to `to`.
    LeadershipTransferred { layer: usize, to: NodeId },
    /// A peer was silent for too long and was purged.
    PeerTimedOut { peer: NodeId },
    /// Stale layers above `above` were dropped.
    LayersCleared { above: usize },
}

/// Per-node protocol counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Outgoing datagrams lost to a full transport queue or an encode failure.
    pub messages_dropped: u64,
    pub decode_errors: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub multicast_delivered: u64,
    pub multicast_forwarded: u64,
    pub multicast_own_echo: u64,
    pub query_timeouts: u64,
    pub peer_timeouts: u64,
    pub splits: u64,
    pub merges: u64,
    pub leader_collisions: u64,
    pub joins_accepted: u64,
    /// Times this node lost its layer 0 cluster and joined again.
    pub rejoins: u64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Error type for node operations visible to the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The rendezvous point must outlive the overlay.
    #[error("the rendezvous point cannot leave the overlay")]
    RendezvousPointDeparture,
    /// Message encoding failed.
    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering() {
        let a = NodeId::from_ipv4(0x0A, 1);
        let b = NodeId::from_ipv4(0x0B, 1);
        assert!(a < b);

        // Port breaks ties between equal addresses
        let c = NodeId::from_ipv4(0x0A, 2);
        assert!(a < c && c < b);
    }

    #[test]
    fn test_unspecified() {
        assert!(NodeId::UNSPECIFIED.is_unspecified());
        assert!(NodeId::default().is_unspecified());
        assert!(!NodeId::new([10, 0, 0, 1], 1024).is_unspecified());
    }

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new([10, 0, 0, 7], 4000);
        assert_eq!(format!("{}", id), "10.0.0.7:4000");
        assert_eq!(format!("{:?}", id), "10.0.0.7:4000");
    }

    #[test]
    fn test_control_layer_conversion() {
        let src = NodeId::from_ipv4(1, 1);
        assert_eq!(Control::new(src, Some(3)).layer, Some(3));
        assert_eq!(Control::new(src, None).layer, None);
    }
}
