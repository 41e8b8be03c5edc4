//! Cluster merge.
//!
//! The leader of an undersized cluster hands its whole membership to the
//! nearest other leader of its supercluster and steps down.

use tracing::{debug, info};

use crate::config::NiceConfig;
use crate::node::Node;
use crate::time::Timestamp;
use crate::traits::{BootstrapOracle, Clock, Random, Transport};
use crate::types::{ClusterMergeRequest, Event, NodeId, MAX_LAYERS};
use crate::wire::Message;

impl<T, B, R, Clk, Cfg> Node<T, B, R, Clk, Cfg>
where
    T: Transport,
    B: BootstrapOracle,
    R: Random,
    Clk: Clock,
    Cfg: NiceConfig,
{
    /// Fold the cluster this node leads at `layer` into the nearest sibling.
    ///
    /// Nothing happens while no sibling has a measured distance.
    pub(crate) fn cluster_merge(&mut self, layer: usize) {
        let me = self.node_id;
        let above = layer + 1;
        debug_assert!(above < MAX_LAYERS);
        debug_assert!(self.clusters[layer].is_leader(&me));

        let target = self.clusters[above]
            .iter()
            .filter(|n| **n != me)
            .filter_map(|n| {
                self.peers
                    .distance(n)
                    .filter(|d| *d > 0.0)
                    .map(|d| (*n, d))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(n, _)| n);
        let Some(target) = target else {
            debug!(node = %me, layer, "no merge target with a known distance");
            return;
        };

        if !self.cluster_merge_request(target, layer) {
            return;
        }
        self.graceful_leave(above);

        let cluster = &mut self.clusters[layer];
        cluster.add(target);
        cluster.set_leader(target);
        cluster.confirm_leader();

        self.metrics.merges += 1;
        info!(node = %me, layer, into = %target, "cluster merged");
        self.push_event(Event::ClusterMerged {
            layer,
            into: target,
        });
    }

    /// Offer the membership of `layer` to `to`.
    ///
    /// Returns false without sending when this node has no led supercluster
    /// to merge within.
    pub(crate) fn cluster_merge_request(&mut self, to: NodeId, layer: usize) -> bool {
        let me = self.node_id;
        let Some(above) = self.clusters.get(layer + 1) else {
            return false;
        };
        let Some(new_cluster_leader) = above.leader().filter(|_| above.contains(&me)) else {
            debug!(node = %me, %to, layer, "no supercluster to merge within");
            return false;
        };
        let members = self.clusters[layer].members().to_vec();
        self.send(
            to,
            Message::ClusterMergeRequest(ClusterMergeRequest {
                src: me,
                layer: layer as u8,
                members,
                new_cluster_leader: Some(new_cluster_leader),
            }),
        );
        true
    }

    pub(crate) fn handle_cluster_merge_request(&mut self, msg: ClusterMergeRequest, now: Timestamp) {
        let me = self.node_id;
        let layer = msg.layer as usize;
        let Some(leader) = self.clusters[layer].leader() else {
            return;
        };
        if leader != me {
            if Cfg::ENHANCED_MODE {
                self.send(leader, Message::ClusterMergeRequest(msg));
            }
            return;
        }

        if let Some(above) = self.clusters.get_mut(layer + 1) {
            above.remove(&msg.src);
            if !above.is_leader(&me) {
                if let Some(new_leader) = msg.new_cluster_leader {
                    above.add(new_leader);
                    above.set_leader(new_leader);
                }
            }
        }
        for member in &msg.members {
            self.clusters[layer].add(*member);
            self.peers.ensure(*member, now);
        }
        debug!(node = %me, src = %msg.src, layer, size = self.clusters[layer].len(), "absorbed merging cluster");

        if Cfg::ENHANCED_MODE {
            self.send_heartbeats(now);
        }
    }
}
