//! Cluster split.
//!
//! An oversized cluster is cut in two halves whose graph centers become the
//! new leaders. Small clusters are partitioned exhaustively, picking the cut
//! whose worse half has the smallest minimax radius. Larger ones are cut by
//! position.

use itertools::Itertools;
use tracing::info;

use crate::config::NiceConfig;
use crate::distance::{find_center, find_center_or_random, DistanceView};
use crate::node::Node;
use crate::time::Timestamp;
use crate::traits::{BootstrapOracle, Clock, Random, Transport};
use crate::types::{Distance, Event, NodeId, SPLIT_EXHAUSTIVE_LIMIT};

/// Outcome of partitioning one cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitPlan {
    pub first: Vec<NodeId>,
    pub second: Vec<NodeId>,
    pub first_leader: NodeId,
    pub second_leader: NodeId,
}

impl SplitPlan {
    /// The half containing `node` and its leader.
    pub fn half_of(&self, node: &NodeId) -> (&[NodeId], NodeId) {
        if self.first.contains(node) {
            (self.first.as_slice(), self.first_leader)
        } else {
            (self.second.as_slice(), self.second_leader)
        }
    }
}

/// Partition `members` into two halves of (almost) equal size.
///
/// `keep` is forced to lead whichever half it lands in. Returns `None` for
/// fewer than two members.
pub fn plan_split<V, R>(
    view: &V,
    members: &[NodeId],
    random: &mut R,
    keep: Option<NodeId>,
) -> Option<SplitPlan>
where
    V: DistanceView + ?Sized,
    R: Random + ?Sized,
{
    let n = members.len();
    if n < 2 {
        return None;
    }

    let mut plan = if n < SPLIT_EXHAUSTIVE_LIMIT {
        exhaustive_split(view, members)?
    } else {
        let (first, second) = members.split_at(n / 2);
        let (first_leader, _) = find_center_or_random(view, first, random)?;
        let (second_leader, _) = find_center_or_random(view, second, random)?;
        SplitPlan {
            first: first.to_vec(),
            second: second.to_vec(),
            first_leader,
            second_leader,
        }
    };

    if let Some(keep) = keep {
        if plan.first.contains(&keep) {
            plan.first_leader = keep;
        } else if plan.second.contains(&keep) {
            plan.second_leader = keep;
        }
    }
    Some(plan)
}

fn exhaustive_split<V: DistanceView + ?Sized>(view: &V, members: &[NodeId]) -> Option<SplitPlan> {
    let mut best: Option<(Distance, SplitPlan)> = None;

    for first in members.iter().copied().combinations(members.len() / 2) {
        let second: Vec<NodeId> = members
            .iter()
            .filter(|m| !first.contains(m))
            .copied()
            .collect();
        let (Some((first_leader, r1)), Some((second_leader, r2))) =
            (find_center(view, &first), find_center(view, &second))
        else {
            continue;
        };

        let score = r1.max(r2);
        if best.as_ref().map_or(true, |(min, _)| score < *min) {
            best = Some((
                score,
                SplitPlan {
                    first,
                    second,
                    first_leader,
                    second_leader,
                },
            ));
        }
    }
    best.map(|(_, plan)| plan)
}

impl<T, B, R, Clk, Cfg> Node<T, B, R, Clk, Cfg>
where
    T: Transport,
    B: BootstrapOracle,
    R: Random,
    Clk: Clock,
    Cfg: NiceConfig,
{
    /// Split the cluster this node leads at `layer`.
    pub(crate) fn cluster_split(&mut self, layer: usize, now: Timestamp) {
        let me = self.node_id;
        let above = layer + 1;
        let members = self.clusters[layer].members().to_vec();
        let keep = self.is_rp.then_some(me);
        let Some(plan) = plan_split(&self.peers, &members, &mut self.random, keep) else {
            return;
        };

        if plan.first_leader != me && plan.second_leader != me {
            // Both halves go to other leaders; self steps out of the layer above
            assert!(
                !self.is_rp,
                "a split cannot move the rendezvous point out of its layer"
            );
            self.clusters[above].add(plan.first_leader);
            self.clusters[above].add(plan.second_leader);
            let supercluster = self.clusters[above].members().to_vec();
            let sc_leader = if self.highest_layer().is_some_and(|h| layer < h) {
                self.graceful_leave(above);
                self.clusters[above].leader()
            } else {
                Some(plan.first_leader)
            };

            self.send_leader_transfer(
                plan.first_leader,
                layer,
                plan.first.clone(),
                sc_leader,
                supercluster.clone(),
            );
            self.send_leader_transfer(
                plan.second_leader,
                layer,
                plan.second.clone(),
                sc_leader,
                supercluster,
            );
            self.clusters[above].clear();
        } else {
            if self.clusters[above].is_empty() {
                self.clusters[above].set_leader(me);
                self.clusters[above].confirm_leader();
            }
            self.clusters[above].add(plan.first_leader);
            self.clusters[above].add(plan.second_leader);
            let supercluster = self.clusters[above].members().to_vec();
            let sc_leader = self.clusters[above].leader();

            let (other, other_leader) = if plan.first_leader == me {
                (plan.second.clone(), plan.second_leader)
            } else {
                (plan.first.clone(), plan.first_leader)
            };
            self.send_leader_transfer(other_leader, layer, other, sc_leader, supercluster);
        }

        let (half, leader) = plan.half_of(&me);
        let cluster = &mut self.clusters[layer];
        cluster.clear();
        for member in half {
            cluster.add(*member);
        }
        cluster.set_leader(leader);
        cluster.confirm_leader();

        let sizes = (plan.first.len(), plan.second.len());
        self.metrics.splits += 1;
        info!(node = %me, layer, ?sizes, "cluster split");
        self.push_event(Event::ClusterSplit { layer, sizes });

        if Cfg::ENHANCED_MODE {
            self.send_heartbeats(now);
        }
    }
}
