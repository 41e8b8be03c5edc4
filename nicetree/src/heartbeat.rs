//! Heartbeat protocol: distance measurement and membership refresh.
//!
//! Every heartbeat interval a node walks its layers from the top down. As a
//! layer's leader it sends LEADERHEARTBEAT to every member, carrying the
//! authoritative membership plus the supercluster one layer up. As a plain
//! member it sends HEARTBEAT to the other members. Each heartbeat is stamped
//! per recipient with a sequence number and the echo of the last one
//! received, from which both ends derive round-trip distances.
//!
//! Receiving a leader heartbeat also resolves leader collisions: two nodes
//! claiming the same layer settle deterministically on one winner.

use tracing::{debug, warn};

use crate::config::NiceConfig;
use crate::node::Node;
use crate::time::Timestamp;
use crate::traits::{BootstrapOracle, Clock, Random, Transport};
use crate::types::{
    Control, Distance, Event, Heartbeat, HeartbeatStamp, LeaderHeartbeat, NodeId,
    COLLISION_WINDOW, MAX_LAYERS,
};
use crate::wire::Message;

impl<T, B, R, Clk, Cfg> Node<T, B, R, Clk, Cfg>
where
    T: Transport,
    B: BootstrapOracle,
    R: Random,
    Clk: Clock,
    Cfg: NiceConfig,
{
    /// One heartbeat round over every layer, then ping probes.
    pub(crate) fn send_heartbeats(&mut self, now: Timestamp) {
        let me = self.node_id;
        let Some(top) = self.highest_layer() else {
            return;
        };

        for layer in (0..=top).rev() {
            let Some(leader) = self.clusters[layer].leader() else {
                continue;
            };
            let members = self.clusters[layer].members_except(&me);
            if leader == me {
                self.clusters[layer].confirm_leader();
                for member in members {
                    self.send_heartbeat_to(member, layer, now);
                }
            } else {
                for member in members {
                    self.send_member_heartbeat(member, layer, now);
                }
            }
        }

        self.send_ping_probes(top, now);
    }

    /// Leader heartbeat for a single member of `layer`.
    pub(crate) fn send_heartbeat_to(&mut self, to: NodeId, layer: usize, now: Timestamp) {
        let (members, distances) = self.membership_view(layer);
        let (supercluster_leader, supercluster_members) = self.supercluster_of(layer);
        let stamp = self.heartbeat_stamp(&to, now);
        self.send(
            to,
            Message::LeaderHeartbeat(LeaderHeartbeat {
                src: self.node_id,
                layer: layer as u8,
                stamp,
                members,
                distances,
                supercluster_leader,
                supercluster_members,
            }),
        );
        self.metrics.heartbeats_sent += 1;
    }

    fn send_member_heartbeat(&mut self, to: NodeId, layer: usize, now: Timestamp) {
        let (members, distances) = self.membership_view(layer);
        let sublayer_members = match layer.checked_sub(1) {
            Some(below) if self.clusters[below].is_leader(&self.node_id) => {
                self.clusters[below].len() as u32
            }
            _ => 0,
        };
        let stamp = self.heartbeat_stamp(&to, now);
        self.send(
            to,
            Message::Heartbeat(Heartbeat {
                src: self.node_id,
                layer: layer as u8,
                stamp,
                members,
                distances,
                sublayer_members,
            }),
        );
        self.metrics.heartbeats_sent += 1;
    }

    /// Members of `layer` and our distance to each of them.
    fn membership_view(&self, layer: usize) -> (Vec<NodeId>, Vec<Option<Distance>>) {
        let members = self.clusters[layer].members().to_vec();
        let distances = members.iter().map(|m| self.peers.distance(m)).collect();
        (members, distances)
    }

    /// Per-recipient sequence bookkeeping. Unknown peers get a blank stamp.
    fn heartbeat_stamp(&mut self, to: &NodeId, now: Timestamp) -> HeartbeatStamp {
        match self.peers.get_mut(to) {
            Some(info) => HeartbeatStamp {
                seq_no: info.record_heartbeat_sent(now),
                seq_rsp_no: info.last_recv_hb(),
                hb_delay: info.heartbeat_delay(now),
            },
            None => HeartbeatStamp::default(),
        }
    }

    /// Probe the other leaders of our supercluster so refinement can compare
    /// them with our own leader.
    fn send_ping_probes(&mut self, top: usize, now: Timestamp) {
        let me = self.node_id;
        let probe_layer = top + 1;
        if probe_layer >= MAX_LAYERS || self.clusters[probe_layer].is_empty() {
            return;
        }
        let Some(leader) = self.clusters[top].leader() else {
            return;
        };
        let targets: Vec<NodeId> = self.clusters[probe_layer]
            .iter()
            .filter(|m| **m != leader && **m != me)
            .copied()
            .collect();
        for target in targets {
            if let Some(info) = self.peers.ensure(target, now) {
                info.set_probe_start(now);
            }
            self.send(target, Message::PingProbe(Control::new(me, Some(probe_layer))));
        }
    }

    pub(crate) fn handle_ping_probe(&mut self, src: NodeId, layer: usize) {
        let me = self.node_id;
        if self.clusters[layer].contains(&me) {
            self.send(src, Message::PingProbeResponse(Control::new(me, Some(layer))));
        }
    }

    pub(crate) fn handle_ping_probe_response(&mut self, src: NodeId, layer: usize, now: Timestamp) {
        if self.highest_layer().map(|h| h + 1) != Some(layer) {
            return;
        }
        if let Some(info) = self.peers.get_mut(&src) {
            if let Some(start) = info.probe_start() {
                info.set_distance((now - start).as_millis_f64() / 2.0);
                info.touch(now);
            }
        }
    }

    /// Fold the distance bookkeeping of either heartbeat kind into `src`'s record.
    fn absorb_heartbeat(
        &mut self,
        src: NodeId,
        stamp: &HeartbeatStamp,
        members: &[NodeId],
        distances: &[Option<Distance>],
        now: Timestamp,
    ) {
        let Some(info) = self.peers.get_mut(&src) else {
            return;
        };
        info.record_heartbeat_received(stamp.seq_no, stamp.seq_rsp_no, stamp.hb_delay, now);
        for (member, distance) in members.iter().zip(distances) {
            info.update_neighbor_distance(*member, *distance);
        }
    }

    pub(crate) fn handle_heartbeat(&mut self, hb: Heartbeat, now: Timestamp) {
        self.metrics.heartbeats_received += 1;
        self.absorb_heartbeat(hb.src, &hb.stamp, &hb.members, &hb.distances, now);
        if let Some(info) = self.peers.get_mut(&hb.src) {
            info.set_sublayer_members(hb.sublayer_members);
        }
    }

    pub(crate) fn handle_leader_heartbeat(&mut self, hb: LeaderHeartbeat, now: Timestamp) {
        let me = self.node_id;
        let src = hb.src;
        if src == me {
            return;
        }
        let layer = hb.layer as usize;
        self.metrics.heartbeats_received += 1;

        if self.leader_flapping(src, layer, now) {
            return;
        }
        self.absorb_heartbeat(src, &hb.stamp, &hb.members, &hb.distances, now);

        if !self.highest_layer().is_some_and(|h| layer <= h) {
            debug!(node = %me, %src, layer, "leader heartbeat for a layer we are not in");
            self.send_remove_to(src, layer);
            return;
        }

        if self.clusters[layer].is_leader(&me) {
            let winner = self.collision_winner(me, src);
            let loser = if winner == me { src } else { me };
            self.metrics.leader_collisions += 1;
            warn!(node = %me, %winner, %loser, layer, "leader collision");
            self.push_event(Event::LeaderCollision {
                layer,
                winner,
                loser,
            });
            if winner == me {
                return;
            }
            self.clusters[layer].add(src);
            self.hand_over_leadership(layer, src);
        } else if let Some(old) = self.clusters[layer].leader().filter(|l| *l != src) {
            // Leadership moved; make sure the previous leader drops us
            self.send_remove_to(old, layer);
        }

        let leader_changed = self.clusters[layer].leader() != Some(src);
        for l in layer..MAX_LAYERS {
            self.clusters[l].clear();
        }
        for member in &hb.members {
            self.peers.ensure(*member, now);
            self.clusters[layer].add(*member);
        }
        self.peers.ensure(src, now);
        let cluster = &mut self.clusters[layer];
        cluster.add(src);
        cluster.add(me);
        cluster.set_leader(src);
        if !leader_changed {
            cluster.confirm_leader();
        }

        if !hb.supercluster_members.is_empty() && layer + 1 < MAX_LAYERS {
            for member in &hb.supercluster_members {
                self.peers.ensure(*member, now);
                self.clusters[layer + 1].add(*member);
            }
            if let Some(sc_leader) = hb.supercluster_leader {
                self.clusters[layer + 1].set_leader(sc_leader);
            }
        }
    }

    /// Winner of a leadership dispute: the RP, else the smaller address.
    pub(crate) fn collision_winner(&self, a: NodeId, b: NodeId) -> NodeId {
        if Some(a) == self.rendezvous_point {
            a
        } else if Some(b) == self.rendezvous_point {
            b
        } else {
            a.min(b)
        }
    }

    /// Detect two leaders alternating heartbeats for the same layer.
    ///
    /// Each layer keeps its own window of recent senders. On the pattern
    /// `[Y, X, Y, X]` within one heartbeat interval, REMOVE is sent to the
    /// loser. Returns true when the current heartbeat comes from the loser and
    /// must be ignored.
    fn leader_flapping(&mut self, src: NodeId, layer: usize, now: Timestamp) -> bool {
        let window = &mut self.leader_heartbeats[layer];
        window.push_back((src, now));
        while window.len() > COLLISION_WINDOW {
            window.pop_front();
        }
        if window.len() < COLLISION_WINDOW {
            return false;
        }

        let n = window.len();
        let (prev, prev_at) = window[n - 2];
        let flapping = now < prev_at + Cfg::HEARTBEAT_INTERVAL
            && prev != src
            && window[n - 3].0 == src
            && window[n - 4].0 == prev;
        if !flapping {
            return false;
        }

        let winner = self.collision_winner(src, prev);
        let loser = if winner == src { prev } else { src };
        warn!(node = %self.node_id, %winner, %loser, layer, "alternating leaders");
        self.send_remove_to(loser, layer);
        self.metrics.leader_collisions += 1;
        self.push_event(Event::LeaderCollision {
            layer,
            winner,
            loser,
        });
        loser == src
    }

    pub(crate) fn send_remove_to(&mut self, node: NodeId, layer: usize) {
        self.send(node, Message::Remove(Control::new(self.node_id, Some(layer))));
    }

    pub(crate) fn handle_remove(&mut self, src: NodeId, layer: usize) {
        let me = self.node_id;
        if src == me {
            return;
        }
        let leader = self.clusters[layer].leader();
        // A fellow member addresses us as its former leader, not as a relay
        if Cfg::ENHANCED_MODE && !self.clusters[layer].contains(&src) {
            if let Some(l) = leader.filter(|l| *l != me && *l != src) {
                self.send(l, Message::Remove(Control::new(src, Some(layer))));
                return;
            }
        }
        if leader == Some(me) && self.clusters[layer].remove(&src) {
            debug!(node = %me, %src, layer, "member removed");
        }
    }
}
