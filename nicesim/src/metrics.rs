//! Metrics collection for simulation analysis.

use hashbrown::HashMap;
use nicetree::{NodeId, NodeMetrics, ProtocolState, Timestamp};

/// What one node believes about its place in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub state: ProtocolState,
    pub is_rp: bool,
    pub highest_layer: Option<usize>,
    /// Leader of the node's layer 0 cluster.
    pub cluster_leader: Option<NodeId>,
    /// Size of the node's layer 0 cluster.
    pub cluster_size: usize,
}

/// A snapshot of hierarchy state at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchySnapshot {
    /// When this snapshot was taken.
    pub time: Timestamp,
    pub nodes: HashMap<NodeId, NodeView>,
}

impl HierarchySnapshot {
    /// Create a new empty snapshot.
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            nodes: HashMap::new(),
        }
    }

    /// Record a node's state.
    pub fn record_node(&mut self, node_id: NodeId, view: NodeView) {
        self.nodes.insert(node_id, view);
    }

    pub fn ready_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|v| v.state == ProtocolState::Ready)
            .count()
    }

    /// Nodes that consider themselves the RP.
    pub fn rendezvous_points(&self) -> Vec<NodeId> {
        let mut rps: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, v)| v.is_rp)
            .map(|(id, _)| *id)
            .collect();
        rps.sort();
        rps
    }

    /// Distinct layer 0 leaders named by the nodes.
    pub fn cluster_leaders(&self) -> Vec<NodeId> {
        let mut leaders: Vec<NodeId> = self
            .nodes
            .values()
            .filter_map(|v| v.cluster_leader)
            .collect();
        leaders.sort();
        leaders.dedup();
        leaders
    }

    /// Highest layer any node reaches.
    pub fn max_layer(&self) -> Option<usize> {
        self.nodes.values().filter_map(|v| v.highest_layer).max()
    }

    /// Every node is READY, exactly one is the RP, and every node has a
    /// layer 0 leader that is itself a live member.
    pub fn is_stable(&self) -> bool {
        self.ready_count() == self.nodes.len()
            && self.rendezvous_points().len() == 1
            && self.nodes.values().all(|v| {
                v.cluster_leader
                    .is_some_and(|leader| self.nodes.contains_key(&leader))
            })
    }
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Total datagrams handed to the network.
    pub messages_sent: u64,
    /// Datagrams dropped due to loss, partition or a vanished receiver.
    pub messages_dropped: u64,
    /// Datagrams delivered successfully.
    pub messages_delivered: u64,
    /// Timer firings handed to nodes.
    pub timer_fires: u64,
    /// Hierarchy snapshots taken at intervals.
    pub snapshots: Vec<HierarchySnapshot>,
}

impl SimMetrics {
    /// Create new empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a snapshot.
    pub fn add_snapshot(&mut self, snapshot: HierarchySnapshot) {
        self.snapshots.push(snapshot);
    }

    /// Find first time when the hierarchy was stable.
    pub fn stabilization_time(&self) -> Option<Timestamp> {
        self.snapshots
            .iter()
            .find(|s| s.is_stable())
            .map(|s| s.time)
    }

    /// Get the latest snapshot.
    pub fn latest_snapshot(&self) -> Option<&HierarchySnapshot> {
        self.snapshots.last()
    }
}

/// Sum of the protocol counters of every live node.
pub fn total_node_metrics<'a>(metrics: impl IntoIterator<Item = &'a NodeMetrics>) -> NodeMetrics {
    metrics.into_iter().fold(NodeMetrics::new(), |mut total, m| {
        total.messages_sent += m.messages_sent;
        total.messages_received += m.messages_received;
        total.messages_dropped += m.messages_dropped;
        total.decode_errors += m.decode_errors;
        total.heartbeats_sent += m.heartbeats_sent;
        total.heartbeats_received += m.heartbeats_received;
        total.multicast_delivered += m.multicast_delivered;
        total.multicast_forwarded += m.multicast_forwarded;
        total.multicast_own_echo += m.multicast_own_echo;
        total.query_timeouts += m.query_timeouts;
        total.peer_timeouts += m.peer_timeouts;
        total.splits += m.splits;
        total.merges += m.merges;
        total.leader_collisions += m.leader_collisions;
        total.joins_accepted += m.joins_accepted;
        total.rejoins += m.rejoins;
        total
    })
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Final simulation time.
    pub end_time: Timestamp,
    /// Collected metrics.
    pub metrics: SimMetrics,
    /// Protocol counters summed over the live nodes.
    pub node_totals: NodeMetrics,
    /// Whether simulation ended due to event queue exhaustion (vs time limit).
    pub queue_exhausted: bool,
}

impl SimulationResult {
    /// Check if the hierarchy ended up stable.
    pub fn stable(&self) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.is_stable())
    }

    /// Number of distinct layer 0 clusters at end.
    pub fn final_cluster_count(&self) -> usize {
        self.metrics
            .latest_snapshot()
            .map(|s| s.cluster_leaders().len())
            .unwrap_or(0)
    }
}
