//! Cluster table: per-layer membership and leadership.
//!
//! A node holds one [`ClusterLayer`] per hierarchy layer. Layer `i + 1` is
//! only populated while the node leads layer `i`, so the populated layers
//! always form a contiguous prefix of the table.

use core::ops::{Index, IndexMut};

use crate::types::{NodeId, MAX_LAYERS};

/// Members and leader of the local node's cluster at one layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterLayer {
    members: Vec<NodeId>,
    leader: Option<NodeId>,
    leader_confirmed: bool,
}

impl ClusterLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Duplicates and the unspecified address are ignored.
    pub fn add(&mut self, node: NodeId) -> bool {
        if node.is_unspecified() || self.members.contains(&node) {
            return false;
        }
        self.members.push(node);
        true
    }

    /// Remove a member. Losing the leader also clears the leader slot.
    pub fn remove(&mut self, node: &NodeId) -> bool {
        let Some(pos) = self.members.iter().position(|m| m == node) else {
            return false;
        };
        self.members.remove(pos);
        if self.leader == Some(*node) {
            self.leader = None;
            self.leader_confirmed = false;
        }
        true
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<NodeId> {
        self.members.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> + '_ {
        self.members.iter()
    }

    /// Members in insertion order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Members other than `node`.
    pub fn members_except(&self, node: &NodeId) -> Vec<NodeId> {
        self.members.iter().filter(|m| *m != node).copied().collect()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leader(&self, node: &NodeId) -> bool {
        self.leader == Some(*node)
    }

    /// Designate a leader. Confirmation is reset until the next heartbeat round.
    pub fn set_leader(&mut self, leader: NodeId) {
        if self.leader != Some(leader) {
            self.leader_confirmed = false;
        }
        self.leader = Some(leader);
    }

    pub fn confirm_leader(&mut self) {
        if self.leader.is_some() {
            self.leader_confirmed = true;
        }
    }

    pub fn is_leader_confirmed(&self) -> bool {
        self.leader_confirmed
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.leader = None;
        self.leader_confirmed = false;
    }
}

/// One [`ClusterLayer`] per hierarchy layer.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterTable {
    layers: Vec<ClusterLayer>,
}

impl Default for ClusterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterTable {
    pub fn new() -> Self {
        Self {
            layers: vec![ClusterLayer::new(); MAX_LAYERS],
        }
    }

    pub fn get(&self, layer: usize) -> Option<&ClusterLayer> {
        self.layers.get(layer)
    }

    pub fn get_mut(&mut self, layer: usize) -> Option<&mut ClusterLayer> {
        self.layers.get_mut(layer)
    }

    /// Highest layer the local node participates in.
    ///
    /// Walks up through the layers `local` leads; the first layer it does not
    /// lead is its highest one if it is a member there, otherwise the layer
    /// below it is. `None` until layer 0 is populated.
    pub fn highest_layer(&self, local: &NodeId) -> Option<usize> {
        if self.layers[0].is_empty() {
            return None;
        }
        let led = self
            .layers
            .iter()
            .take_while(|c| c.is_leader(local))
            .count();
        if led == MAX_LAYERS {
            return Some(MAX_LAYERS - 1);
        }
        if self.layers[led].contains(local) {
            Some(led)
        } else {
            led.checked_sub(1)
        }
    }

    /// Highest layer the local node leads.
    pub fn highest_leader_layer(&self, local: &NodeId) -> Option<usize> {
        let layer = self.highest_layer(local)?;
        if self.layers[layer].is_leader(local) {
            Some(layer)
        } else {
            layer.checked_sub(1)
        }
    }

    /// Clear every layer strictly above `layer`. Returns true if any held data.
    pub fn clear_above(&mut self, layer: usize) -> bool {
        let mut cleared = false;
        for cluster in self.layers.iter_mut().skip(layer + 1) {
            if !cluster.is_empty() || cluster.leader().is_some() {
                cluster.clear();
                cleared = true;
            }
        }
        cleared
    }

    /// Remove `node` from every layer. Returns the layers it was removed from.
    pub fn remove_everywhere(&mut self, node: &NodeId) -> Vec<usize> {
        self.layers
            .iter_mut()
            .enumerate()
            .filter_map(|(layer, cluster)| cluster.remove(node).then_some(layer))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterLayer> + '_ {
        self.layers.iter()
    }
}

impl Index<usize> for ClusterTable {
    type Output = ClusterLayer;

    fn index(&self, layer: usize) -> &ClusterLayer {
        &self.layers[layer]
    }
}

impl IndexMut<usize> for ClusterTable {
    fn index_mut(&mut self, layer: usize) -> &mut ClusterLayer {
        &mut self.layers[layer]
    }
}
