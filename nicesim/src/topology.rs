//! Network topology and link properties.
//!
//! Overlay peers sit on an IP network, so every pair of nodes can reach each
//! other. The topology only decides how long a datagram takes, how likely it
//! is lost, and which pairs a partition currently separates.

use hashbrown::HashMap;
use nicetree::{Duration, NodeId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Properties of a network link between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Packet loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// One-way propagation delay.
    pub delay: Duration,
    /// Whether the link is currently active.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            delay: Duration::from_millis(10),
            active: true,
        }
    }
}

impl Link {
    /// Create a new link with default properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the loss rate.
    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set the delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set whether the link is active.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Network topology defining latency and reachability between nodes.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Explicit per-pair links, overriding everything else.
    links: HashMap<(NodeId, NodeId), Link>,
    /// Node positions in a unit square, for distance-derived delays.
    positions: HashMap<NodeId, (f64, f64)>,
    /// Delay across the full diagonal of the unit square.
    max_delay: Duration,
    /// Properties of pairs without an explicit link.
    default_link: Link,
    /// Partition groups; pairs in different groups cannot talk.
    partition: Option<Vec<Vec<NodeId>>>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Uniform topology: every pair uses the default link.
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            positions: HashMap::new(),
            max_delay: Duration::ZERO,
            default_link: Link::default(),
            partition: None,
        }
    }

    /// Set default link properties for pairs without an explicit link.
    pub fn with_default_link(mut self, link: Link) -> Self {
        self.default_link = link;
        self
    }

    /// Place nodes at seeded random positions in a unit square. A pair's
    /// delay grows with its distance, up to `max_delay` across the diagonal,
    /// on top of the default link delay.
    pub fn plane(nodes: &[NodeId], seed: u64, max_delay: Duration) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let positions = nodes
            .iter()
            .map(|n| (*n, (rng.gen::<f64>(), rng.gen::<f64>())))
            .collect();
        Self {
            positions,
            max_delay,
            ..Self::new()
        }
    }

    /// Add an explicit bidirectional link between two nodes.
    pub fn add_link(&mut self, a: NodeId, b: NodeId, link: Link) {
        self.links.insert(Self::canonical_pair(a, b), link);
    }

    /// Effective link between two nodes.
    pub fn link(&self, a: NodeId, b: NodeId) -> Link {
        if let Some(link) = self.links.get(&Self::canonical_pair(a, b)) {
            return link.clone();
        }
        let mut link = self.default_link.clone();
        if let (Some(pa), Some(pb)) = (self.positions.get(&a), self.positions.get(&b)) {
            let (dx, dy) = (pa.0 - pb.0, pa.1 - pb.1);
            let fraction = (dx * dx + dy * dy).sqrt() / std::f64::consts::SQRT_2;
            let extra = (self.max_delay.as_millis_f64() * fraction).round() as u64;
            link.delay = link.delay + Duration::from_millis(extra);
        }
        link
    }

    /// Get a mutable explicit link, creating it from the effective one.
    pub fn link_mut(&mut self, a: NodeId, b: NodeId) -> &mut Link {
        let current = self.link(a, b);
        self.links
            .entry(Self::canonical_pair(a, b))
            .or_insert(current)
    }

    /// Check if a datagram from `a` can reach `b` right now.
    pub fn is_connected(&self, a: NodeId, b: NodeId) -> bool {
        self.link(a, b).active && !self.is_partitioned(a, b)
    }

    fn is_partitioned(&self, a: NodeId, b: NodeId) -> bool {
        let Some(groups) = &self.partition else {
            return false;
        };
        let group_a = groups.iter().position(|g| g.contains(&a));
        let group_b = groups.iter().position(|g| g.contains(&b));
        group_a != group_b
    }

    /// Cut all traffic between the given groups.
    pub fn partition(&mut self, groups: &[Vec<NodeId>]) {
        self.partition = Some(groups.to_vec());
    }

    /// Remove the partition and re-enable all explicit links.
    pub fn heal(&mut self) {
        self.partition = None;
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    /// Set loss rate for all links.
    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        self.default_link.loss_rate = rate;
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    /// Get default link properties.
    pub fn default_link(&self) -> &Link {
        &self.default_link
    }

    /// Canonical pair ordering for consistent link storage.
    fn canonical_pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}
