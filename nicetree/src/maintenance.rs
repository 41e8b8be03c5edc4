//! Periodic maintenance pass.
//!
//! Runs once per maintenance interval:
//! 1. Purge silent peers and stale temporary peerings
//! 2. Replace a vanished leader of the highest layer, or rejoin through the
//!    RP when the layer 0 cluster is gone
//! 3. Split oversized and merge undersized clusters
//! 4. Re-join upward when leading the highest layer
//! 5. Drop stale layers above the highest one
//! 6. Move to a closer supercluster, or hand a cluster to a better center

use tracing::{debug, info, warn};

use crate::config::NiceConfig;
use crate::cluster::ClusterTable;
use crate::distance::{all_distances_known, find_center, max_distance, mean_distance};
use crate::node::Node;
use crate::time::Timestamp;
use crate::timer::TimerKind;
use crate::traits::{BootstrapOracle, Clock, Random, Transport};
use crate::types::{
    Distance, Event, NodeId, ProtocolState, MAX_LAYERS, MIN_IMPROVEMENT_FLOOR_MS,
    TEMP_PEER_TIMEOUT_HEARTBEATS,
};

/// Share of `value` given in percent.
fn percent(value: Distance, pct: f64) -> Distance {
    value / 100.0 * pct
}

impl<T, B, R, Clk, Cfg> Node<T, B, R, Clk, Cfg>
where
    T: Transport,
    B: BootstrapOracle,
    R: Random,
    Clk: Clock,
    Cfg: NiceConfig,
{
    pub(crate) fn maintenance(&mut self, now: Timestamp) {
        let me = self.node_id;
        let Some(highest) = self.highest_layer() else {
            self.clean_peers(now);
            self.rejoin_if_orphaned(now);
            return;
        };

        let old_leader = self.clusters[highest].leader();
        self.clean_peers(now);

        // Elect before restructuring, from the membership the leader left behind
        let mut successor = None;
        if let Some(old) = old_leader.filter(|_| self.clusters[highest].leader().is_none()) {
            if Some(old) == self.rendezvous_point {
                warn!(node = %me, rp = %old, "rendezvous point is unreachable");
            } else {
                warn!(node = %me, leader = %old, layer = highest, "cluster leader vanished");
                let members = self.clusters[highest].members().to_vec();
                successor = find_center(&self.peers, &members).map(|(center, _)| center);
            }
        }
        if successor.is_none() && self.rejoin_if_orphaned(now) {
            return;
        }

        self.split_needed(now);
        self.merge_needed();

        if let Some(new) = successor {
            self.replace_leader(highest, new, now);
        } else if !self.is_rp {
            let led = self.highest_leader_layer();
            if let Some(top) = self.highest_layer().filter(|h| Some(*h) == led) {
                self.poll_rp(now);
                self.basic_join_layer(Some(top + 1), now);
            }
        }

        self.clear_stale_layers();

        if self.is_rp {
            return;
        }
        if self.refine_supercluster(now) {
            return;
        }
        self.refine_leaders();
    }

    /// Purge temporary peerings and peers silent for longer than the timeout.
    pub(crate) fn clean_peers(&mut self, now: Timestamp) {
        let temp_timeout = Cfg::HEARTBEAT_INTERVAL * TEMP_PEER_TIMEOUT_HEARTBEATS;
        let before = self.temp_peers.len();
        self.temp_peers.retain(|_, since| now <= *since + temp_timeout);
        if self.temp_peers.len() < before {
            debug!(node = %self.node_id, expired = before - self.temp_peers.len(), "temporary peers expired");
        }

        for peer in self.peers.expire(now, Cfg::peer_timeout()) {
            let layers = self.clusters.remove_everywhere(&peer);
            self.metrics.peer_timeouts += 1;
            debug!(node = %self.node_id, %peer, ?layers, "peer timed out");
            self.push_event(Event::PeerTimedOut { peer });
        }
    }

    /// Start over at the RP when this member was dropped from layer 0 or its
    /// cluster lost the leader with no successor to follow.
    fn rejoin_if_orphaned(&mut self, now: Timestamp) -> bool {
        let me = self.node_id;
        if self.is_rp || self.state != ProtocolState::Ready || self.rendezvous_point.is_none() {
            return false;
        }
        let evaluating = self.eval_layer.is_some() && now < self.eval_start + Cfg::peer_timeout();
        if self.timers.is_armed(TimerKind::Query) || evaluating {
            return false;
        }
        let base = &self.clusters[0];
        let orphaned = !base.contains(&me)
            || base.leader().is_none()
            || (!base.is_leader(&me) && base.members_except(&me).is_empty());
        if !orphaned {
            return false;
        }

        warn!(node = %me, leader = ?base.leader(), "lost layer 0 cluster, rejoining");
        self.clusters = ClusterTable::new();
        self.eval_layer = None;
        self.metrics.rejoins += 1;
        self.basic_join_layer(None, now);
        true
    }

    fn replace_leader(&mut self, layer: usize, new: NodeId, now: Timestamp) {
        let me = self.node_id;
        if !self.clusters[layer].contains(&me) || !self.clusters[layer].contains(&new) {
            return;
        }
        self.clusters[layer].set_leader(new);
        if new == me {
            info!(node = %me, layer, "promoted after leader loss");
            if layer + 1 < MAX_LAYERS {
                self.clusters[layer + 1].add(me);
            }
            self.basic_join_layer(Some(layer + 1), now);
        } else {
            self.leader_transfer(layer, new);
        }
    }

    /// Split the lowest oversized layers this node leads.
    pub(crate) fn split_needed(&mut self, now: Timestamp) -> bool {
        let me = self.node_id;
        let Some(led) = self.highest_leader_layer() else {
            return false;
        };
        let mut split = false;
        for layer in 0..=led.min(MAX_LAYERS - 2) {
            if !self.clusters[layer].is_leader(&me) {
                break;
            }
            let cluster = &self.clusters[layer];
            let above = &self.clusters[layer + 1];
            if cluster.len() > Cfg::max_cluster_size()
                && cluster.is_leader_confirmed()
                && (above.is_empty() || above.is_leader_confirmed())
            {
                self.cluster_split(layer, now);
                split = true;
            }
        }
        split
    }

    /// Merge the lowest undersized layer this node leads. The RP never merges.
    pub(crate) fn merge_needed(&mut self) -> bool {
        if self.is_rp {
            return false;
        }
        let me = self.node_id;
        let Some(led) = self.highest_leader_layer() else {
            return false;
        };
        for layer in 0..=led.min(MAX_LAYERS - 2) {
            let cluster = &self.clusters[layer];
            if cluster.is_leader(&me)
                && cluster.len() < Cfg::K
                && cluster.is_leader_confirmed()
                && self.clusters[layer + 1].is_leader_confirmed()
            {
                self.cluster_merge(layer);
                if !self.clusters[layer + 1].contains(&me) {
                    return true;
                }
            }
        }
        false
    }

    /// Drop layers above the highest one. A plain member keeps the
    /// supercluster view its leader shares.
    fn clear_stale_layers(&mut self) {
        let Some(highest) = self.highest_layer() else {
            return;
        };
        let keep = if self.clusters[highest].is_leader(&self.node_id) {
            highest
        } else {
            highest + 1
        };
        if self.clusters.clear_above(keep) {
            info!(node = %self.node_id, above = keep, "cleared stale layers");
            self.push_event(Event::LayersCleared { above: keep });
        }
    }

    /// Switch to a sibling cluster whose leader is clearly closer than ours.
    fn refine_supercluster(&mut self, now: Timestamp) -> bool {
        let me = self.node_id;
        let Some(highest) = self.highest_layer().filter(|h| h + 1 < MAX_LAYERS) else {
            return false;
        };
        let siblings = self.clusters[highest + 1].members().to_vec();
        if siblings.len() <= 1 {
            return false;
        }
        let Some(leader) = self.clusters[highest].leader() else {
            return false;
        };
        let Some(current) = self.peers.distance(&leader).filter(|d| *d > 0.0) else {
            return false;
        };
        let current = current - percent(current, Cfg::SC_PROC_DISTANCE);

        let best = siblings
            .iter()
            .filter(|n| **n != leader && **n != me)
            .filter_map(|n| {
                self.peers
                    .distance(n)
                    .filter(|d| *d > 0.0)
                    .map(|d| (*n, d))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));
        let Some((candidate, smallest)) = best else {
            return false;
        };

        let min_gain =
            percent(mean_distance(&self.peers, &siblings), Cfg::SC_MIN_OFFSET).max(MIN_IMPROVEMENT_FLOOR_MS);
        if smallest < current && current - smallest > min_gain {
            info!(node = %me, layer = highest, from = %leader, to = %candidate, "moving to closer cluster");
            self.remove_from_layer(highest);
            self.clusters[highest].clear();
            self.join_cluster(candidate, highest, now);
            return true;
        }
        false
    }

    /// Hand a led cluster to its graph center when that is clearly better.
    fn refine_leaders(&mut self) {
        let me = self.node_id;
        let Some(led) = self.highest_leader_layer() else {
            return;
        };
        for layer in (0..=led).rev() {
            let cluster = &self.clusters[layer];
            if cluster.len() <= 1 || !cluster.is_leader_confirmed() {
                continue;
            }
            let members = cluster.members().to_vec();
            if !all_distances_known(&self.peers, &members) {
                continue;
            }
            let Some((center, _)) = find_center(&self.peers, &members) else {
                continue;
            };
            if center == me {
                continue;
            }

            let old = max_distance(&self.peers, &me, &members);
            let new = max_distance(&self.peers, &center, &members);
            let compare = old - percent(old, Cfg::CLUSTER_LEADER_COMPARE_DIST);
            let min_gain = percent(mean_distance(&self.peers, &members), Cfg::CLUSTER_LEADER_BOUND)
                .max(MIN_IMPROVEMENT_FLOOR_MS);
            if new < compare && compare - new > min_gain {
                info!(node = %me, layer, to = %center, old, new, "better cluster center found");
                self.hand_over_leadership(layer, center);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DefaultConfig;
    use crate::node::Node;
    use crate::time::Timestamp;
    use crate::traits::test_impls::{MockClock, MockOracle, MockRandom, MockTransport};
    use crate::types::{Control, Event, NodeId, ProtocolState, QueryResponse};
    use crate::wire::{Decode, Encode, Message};

    type TestNode = Node<MockTransport, MockOracle, MockRandom, MockClock, DefaultConfig>;

    fn node(n: u32) -> NodeId {
        NodeId::from_ipv4(n, 1024)
    }

    fn sent(node: &TestNode) -> Vec<(NodeId, Message)> {
        node.transport()
            .take_sent()
            .into_iter()
            .map(|d| (d.peer, Message::decode_from_slice(&d.data).unwrap()))
            .collect()
    }

    fn deliver(node: &mut TestNode, msg: Message, now: Timestamp) {
        let data = msg.encode_to_vec().unwrap();
        node.handle_transport_rx(&data, now);
    }

    fn drain_events(node: &TestNode) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(e) = node.events().try_receive() {
            events.push(e);
        }
        events
    }

    fn started(id: NodeId, rp: NodeId) -> TestNode {
        let mut n: TestNode = Node::new(
            id,
            MockTransport::new(),
            MockOracle::with_node(rp),
            MockRandom::new(),
            MockClock::new(),
        );
        n.bootstrap(Timestamp::ZERO);
        sent(&n);
        n
    }

    fn peer(n: &mut TestNode, id: NodeId, seen: Timestamp, distance: Option<f64>) {
        n.peers.touch_or_insert(id, seen);
        if let (Some(info), Some(d)) = (n.peers.get_mut(&id), distance) {
            info.set_distance(d);
        }
    }

    /// `me` joined layer 0 under `rp`.
    fn joined(me: NodeId, rp: NodeId) -> TestNode {
        let mut n = started(me, rp);
        deliver(
            &mut n,
            Message::QueryResponse(QueryResponse {
                src: rp,
                layer: 0,
                members: vec![],
            }),
            Timestamp::from_millis(10),
        );
        assert_eq!(n.state(), ProtocolState::Ready);
        sent(&n);
        n
    }

    #[test]
    fn test_orphaned_member_rejoins_through_rendezvous_point() {
        let rp = node(1);
        let me = node(5);
        let mut n = joined(me, rp);
        // The leader dropped us; only a leaderless view of ourselves is left
        n.clusters[0].remove(&rp);
        peer(&mut n, rp, Timestamp::from_secs(1), None);

        n.maintenance(Timestamp::from_secs(1));

        assert_eq!(n.highest_layer(), None);
        assert_eq!(n.target_layer, 0);
        assert_eq!(n.metrics().rejoins, 1);
        assert!(sent(&n).contains(&(rp, Message::Query(Control::new(me, None)))));

        // The outstanding query holds off another restart
        n.maintenance(Timestamp::from_secs(2));
        assert_eq!(n.metrics().rejoins, 1);
        assert!(!sent(&n).contains(&(rp, Message::Query(Control::new(me, None)))));

        // The answer restores membership
        deliver(
            &mut n,
            Message::QueryResponse(QueryResponse {
                src: rp,
                layer: 0,
                members: vec![node(7)],
            }),
            Timestamp::from_millis(2100),
        );
        assert_eq!(n.clusters()[0].leader(), Some(rp));
        assert!(n.clusters()[0].contains(&me));
        assert_eq!(n.state(), ProtocolState::Ready);
    }

    #[test]
    fn test_member_under_live_leader_stays() {
        let rp = node(1);
        let me = node(5);
        let mut n = joined(me, rp);
        peer(&mut n, rp, Timestamp::from_secs(1), None);

        n.maintenance(Timestamp::from_secs(1));

        assert_eq!(n.metrics().rejoins, 0);
        assert_eq!(n.clusters()[0].leader(), Some(rp));
        assert!(!sent(&n)
            .iter()
            .any(|(_, m)| matches!(m, Message::Query(_))));
    }

    #[test]
    fn test_vanished_leader_replaced_by_self() {
        let rp = node(1);
        let me = node(5);
        let mut n = started(me, rp);
        for m in [node(4), me, node(6)] {
            n.clusters[0].add(m);
        }
        n.clusters[0].set_leader(node(4));
        peer(&mut n, node(4), Timestamp::ZERO, None);
        peer(&mut n, node(6), Timestamp::from_secs(10), None);
        peer(&mut n, rp, Timestamp::from_secs(10), None);
        sent(&n);

        n.maintenance(Timestamp::from_secs(16));

        assert!(!n.clusters()[0].contains(&node(4)));
        assert!(n.clusters()[0].is_leader(&me));
        assert!(n.clusters()[1].contains(&me));
        assert_eq!(n.target_layer, 1);
        assert_eq!(n.metrics().peer_timeouts, 1);
        assert!(sent(&n).contains(&(rp, Message::Query(Control::new(me, None)))));
        assert!(drain_events(&n).contains(&Event::PeerTimedOut { peer: node(4) }));
    }

    #[test]
    fn test_vanished_leader_replaced_by_transfer() {
        let rp = node(1);
        let me = node(5);
        let mut n = started(me, rp);
        for m in [node(4), node(6), me] {
            n.clusters[0].add(m);
        }
        n.clusters[0].set_leader(node(4));
        peer(&mut n, node(4), Timestamp::ZERO, None);
        peer(&mut n, node(6), Timestamp::from_secs(10), None);
        peer(&mut n, rp, Timestamp::from_secs(10), None);
        sent(&n);

        n.maintenance(Timestamp::from_secs(16));

        assert!(n.clusters()[0].is_leader(&node(6)));
        let out = sent(&n);
        assert!(out
            .iter()
            .any(|(to, m)| *to == node(6) && m.kind() == "LEADERTRANSFER"));
    }

    #[test]
    fn test_oversized_cluster_split() {
        let rp = node(1);
        let mut n: TestNode = Node::new(
            rp,
            MockTransport::new(),
            MockOracle::new(),
            MockRandom::new(),
            MockClock::new(),
        );
        n.bootstrap(Timestamp::ZERO);
        let now = Timestamp::from_secs(1);
        for m in 2..=11 {
            deliver(&mut n, Message::JoinCluster(Control::new(node(m), Some(0))), now);
        }
        n.send_heartbeats(now);
        sent(&n);

        n.maintenance(now);

        assert_eq!(n.metrics().splits, 1);
        assert_eq!(n.clusters()[1].len(), 2);
        assert!(n.clusters()[0].len() <= 6);
        assert!(n.clusters()[0].is_leader(&rp));
        assert_eq!(n.highest_layer(), Some(1));
    }

    #[test]
    fn test_undersized_cluster_merged() {
        let rp = node(1);
        let me = node(5);
        let mut n = started(me, rp);
        let now = Timestamp::from_secs(1);
        n.clusters[0].add(me);
        n.clusters[0].add(node(2));
        n.clusters[0].set_leader(me);
        n.clusters[0].confirm_leader();
        for m in [rp, me, node(7)] {
            n.clusters[1].add(m);
        }
        n.clusters[1].set_leader(rp);
        n.clusters[1].confirm_leader();
        peer(&mut n, rp, now, Some(50.0));
        peer(&mut n, node(2), now, None);
        peer(&mut n, node(7), now, Some(10.0));

        n.maintenance(now);

        assert_eq!(n.metrics().merges, 1);
        assert!(n.clusters()[0].is_leader(&node(7)));
        assert!(!n.clusters()[1].contains(&me));
        let kinds: Vec<&str> = sent(&n).iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds, vec!["CLUSTER_MERGE_REQUEST", "REMOVE"]);
    }

    #[test]
    fn test_rp_never_merges() {
        let rp = node(1);
        let mut n: TestNode = Node::new(
            rp,
            MockTransport::new(),
            MockOracle::new(),
            MockRandom::new(),
            MockClock::new(),
        );
        n.bootstrap(Timestamp::ZERO);
        n.clusters[0].confirm_leader();
        assert!(!n.merge_needed());
    }

    #[test]
    fn test_moves_to_closer_supercluster_member() {
        let rp = node(1);
        let me = node(5);
        let leader = node(4);
        let mut n = started(me, rp);
        let now = Timestamp::from_secs(1);
        n.clusters[0].add(leader);
        n.clusters[0].add(me);
        n.clusters[0].set_leader(leader);
        n.clusters[1].add(leader);
        n.clusters[1].add(node(8));
        n.clusters[1].set_leader(leader);
        peer(&mut n, leader, now, Some(100.0));
        peer(&mut n, node(8), now, Some(20.0));

        n.maintenance(now);

        let out = sent(&n);
        assert_eq!(out[0], (leader, Message::Remove(Control::new(me, Some(0)))));
        assert_eq!(out[1], (node(8), Message::JoinCluster(Control::new(me, Some(0)))));
        assert!(n.clusters()[0].is_leader(&node(8)));
        assert!(!n.clusters()[0].contains(&leader));
    }

    #[test]
    fn test_stays_when_gain_is_small() {
        let rp = node(1);
        let me = node(5);
        let leader = node(4);
        let mut n = started(me, rp);
        let now = Timestamp::from_secs(1);
        n.clusters[0].add(leader);
        n.clusters[0].add(me);
        n.clusters[0].set_leader(leader);
        n.clusters[1].add(leader);
        n.clusters[1].add(node(8));
        n.clusters[1].set_leader(leader);
        peer(&mut n, leader, now, Some(40.0));
        peer(&mut n, node(8), now, Some(34.0));

        n.maintenance(now);

        assert!(sent(&n).is_empty());
        assert!(n.clusters()[0].is_leader(&leader));
    }

    #[test]
    fn test_leadership_moves_to_better_center() {
        let rp = node(1);
        let me = node(5);
        let (a, b) = (node(6), node(7));
        let mut n = started(me, rp);
        let now = Timestamp::from_secs(1);
        for m in [me, a, b] {
            n.clusters[0].add(m);
        }
        n.clusters[0].set_leader(me);
        n.clusters[0].confirm_leader();
        n.clusters[1].add(rp);
        n.clusters[1].add(me);
        n.clusters[1].set_leader(rp);

        // On a line: me at 0, a at 50, b at 100
        peer(&mut n, rp, now, Some(30.0));
        peer(&mut n, a, now, Some(50.0));
        peer(&mut n, b, now, Some(100.0));
        if let Some(info) = n.peers.get_mut(&a) {
            info.update_neighbor_distance(me, Some(50.0));
            info.update_neighbor_distance(b, Some(50.0));
        }
        if let Some(info) = n.peers.get_mut(&b) {
            info.update_neighbor_distance(me, Some(100.0));
            info.update_neighbor_distance(a, Some(50.0));
        }

        n.maintenance(now);

        assert!(n.clusters()[0].is_leader(&a));
        assert!(n.clusters()[0].contains(&me));
        let out = sent(&n);
        assert!(out.contains(&(rp, Message::Remove(Control::new(me, Some(1))))));
        assert!(out
            .iter()
            .any(|(to, m)| *to == a && m.kind() == "LEADERTRANSFER"));
    }

    #[test]
    fn test_temp_peers_expire() {
        let mut rp: TestNode = Node::new(
            node(1),
            MockTransport::new(),
            MockOracle::new(),
            MockRandom::new(),
            MockClock::new(),
        );
        rp.bootstrap(Timestamp::ZERO);
        deliver(
            &mut rp,
            Message::PeerTemporary(Control::new(node(9), None)),
            Timestamp::ZERO,
        );
        assert_eq!(rp.temp_peer_count(), 1);
        rp.maintenance(Timestamp::from_secs(15));
        assert_eq!(rp.temp_peer_count(), 1);
        rp.maintenance(Timestamp::from_secs(16));
        assert_eq!(rp.temp_peer_count(), 0);
    }

    #[test]
    fn test_stale_layers_cleared() {
        let rp = node(1);
        let me = node(5);
        let mut n = started(me, rp);
        let now = Timestamp::from_secs(1);
        n.clusters[0].add(rp);
        n.clusters[0].add(me);
        n.clusters[0].set_leader(rp);
        n.clusters[1].add(rp);
        n.clusters[1].set_leader(rp);
        n.clusters[2].add(node(9));
        peer(&mut n, rp, now, None);
        drain_events(&n);

        n.maintenance(now);

        assert!(!n.clusters()[1].is_empty());
        assert!(n.clusters()[2].is_empty());
        assert!(drain_events(&n).contains(&Event::LayersCleared { above: 1 }));
    }
}
