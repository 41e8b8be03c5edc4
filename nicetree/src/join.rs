//! Join protocol: locating and entering the right cluster.
//!
//! A newcomer asks the RP for its top layer and then descends one layer at a
//! time. At each step it probes the members of the returned cluster with
//! JOINEVAL and continues with whichever answers faster than the node that
//! answered the query. Once the descent reaches the target layer the node
//! sends JOIN_CLUSTER to that layer's leader.
//!
//! While descending, the newcomer is temporarily peered with the RP so it
//! receives multicast data before it has a cluster of its own.

use tracing::{debug, info};

use crate::config::NiceConfig;
use crate::node::Node;
use crate::time::Timestamp;
use crate::timer::TimerKind;
use crate::traits::{BootstrapOracle, Clock, Random, Transport};
use crate::types::{Control, Event, NodeId, ProtocolState, QueryResponse};
use crate::wire::Message;

impl<T, B, R, Clk, Cfg> Node<T, B, R, Clk, Cfg>
where
    T: Transport,
    B: BootstrapOracle,
    R: Random,
    Clk: Clock,
    Cfg: NiceConfig,
{
    /// Start a descent from the RP that ends in a cluster at `layer` (0 if None).
    pub(crate) fn basic_join_layer(&mut self, layer: Option<usize>, now: Timestamp) {
        let Some(rp) = self.rendezvous_point.filter(|_| !self.is_rp) else {
            return;
        };
        self.query(rp, None, now);
        self.target_layer = layer.unwrap_or(0);
        self.send(rp, Message::PeerTemporary(Control::new(self.node_id, None)));
        self.is_temp_peered = true;
    }

    /// Ask `dest` for its cluster at `layer` (None: its highest led layer).
    pub(crate) fn query(&mut self, dest: NodeId, layer: Option<usize>, now: Timestamp) {
        self.query_start = now;
        self.temp_resolver = Some(dest);
        self.join_layer = layer;
        self.timers.arm(TimerKind::Query, now + Cfg::QUERY_INTERVAL);
        debug!(node = %self.node_id, %dest, layer = ?layer, "query");
        self.send(dest, Message::Query(Control::new(self.node_id, layer)));
    }

    pub(crate) fn handle_query(&mut self, src: NodeId, layer: Option<usize>, now: Timestamp) {
        let me = self.node_id;
        let led = self.highest_leader_layer();

        if let Some(requested) = layer {
            if led.map_or(true, |h| requested > h) {
                if !self.is_rp {
                    debug!(node = %me, %src, requested, "query above own layers");
                    return;
                }
                // The RP grows the hierarchy on demand
                let start = led.map_or(0, |h| h + 1);
                for l in start..=requested {
                    self.clusters[l].add(me);
                    self.clusters[l].set_leader(me);
                }
                info!(node = %me, layer = requested, "rendezvous point extended hierarchy");
            }
        }

        let layer = match layer {
            Some(l) => l,
            None if self.is_rp => match self.highest_leader_layer() {
                Some(h) => h,
                None => return,
            },
            None => {
                if Cfg::ENHANCED_MODE {
                    if let Some(rp) = self.rendezvous_point {
                        self.send(rp, Message::Query(Control::new(src, None)));
                    }
                }
                return;
            }
        };

        let Some(leader) = self.clusters[layer].leader() else {
            debug!(node = %me, %src, layer, "query for leaderless layer");
            return;
        };
        if leader != me {
            if Cfg::ENHANCED_MODE {
                self.send(leader, Message::Query(Control::new(src, Some(layer))));
            }
            return;
        }

        let members = self.clusters[layer].members_except(&me);
        self.peers.ensure(src, now);
        self.send(
            src,
            Message::QueryResponse(QueryResponse {
                src: me,
                layer: layer as u8,
                members,
            }),
        );
    }

    pub(crate) fn handle_query_response(&mut self, resp: QueryResponse, now: Timestamp) {
        self.timers.cancel(TimerKind::Query);
        let me = self.node_id;
        let layer = resp.layer as usize;

        if layer == self.target_layer {
            for member in &resp.members {
                self.clusters[layer].add(*member);
                self.peers.ensure(*member, now);
            }
            self.clusters[layer].add(resp.src);
            self.join_cluster(resp.src, layer, now);
            self.change_state(ProtocolState::Ready, now);
            return;
        }

        if layer < self.target_layer {
            // The RP's hierarchy is lower than the layer we need: ask it to grow
            match self.rendezvous_point {
                Some(rp) if rp == resp.src => self.query(rp, Some(self.target_layer), now),
                _ => debug!(node = %me, layer, target = self.target_layer, "query response below target"),
            }
            return;
        }

        self.query_rtt = Some(now - self.query_start);
        if resp.members.is_empty() {
            self.query(resp.src, Some(layer - 1), now);
            return;
        }
        for member in &resp.members {
            self.send(*member, Message::JoinEval(Control::new(me, Some(layer))));
        }
        self.eval_layer = Some(layer);
        self.eval_start = now;
    }

    pub(crate) fn handle_join_eval(&mut self, src: NodeId, layer: usize) {
        self.send(
            src,
            Message::JoinEvalResponse(Control::new(self.node_id, Some(layer))),
        );
    }

    /// The first JOINEVAL answer decides where the descent continues.
    pub(crate) fn handle_join_eval_response(&mut self, src: NodeId, layer: usize, now: Timestamp) {
        if layer == 0 || self.eval_layer != Some(layer) {
            return;
        }
        self.eval_layer = None;
        let eval_rtt = now - self.eval_start;
        let next = match (self.query_rtt, self.temp_resolver) {
            (Some(query_rtt), Some(resolver)) if eval_rtt >= query_rtt => resolver,
            _ => src,
        };
        self.query(next, Some(layer - 1), now);
    }

    /// The resolver stayed silent. Retry at the RP.
    pub(crate) fn handle_query_timeout(&mut self, now: Timestamp) {
        self.metrics.query_timeouts += 1;
        let Some(rp) = self.rendezvous_point else {
            return;
        };
        let resolver_is_rp = self
            .temp_resolver
            .map_or(true, |r| r == rp || Some(r) == self.polled_rp);
        debug!(node = %self.node_id, resolver = ?self.temp_resolver, "query timed out");
        if resolver_is_rp {
            self.query(rp, self.join_layer, now);
        } else {
            // An intermediate leader went silent; restart the descent
            self.query(rp, None, now);
        }
    }

    /// Enter the cluster led by `leader` at `layer`.
    pub(crate) fn join_cluster(&mut self, leader: NodeId, layer: usize, now: Timestamp) {
        let me = self.node_id;
        self.send(leader, Message::JoinCluster(Control::new(me, Some(layer))));
        self.peers.ensure(leader, now);

        let cluster = &mut self.clusters[layer];
        cluster.add(me);
        cluster.add(leader);
        cluster.set_leader(leader);

        if !self.timers.is_armed(TimerKind::Heartbeat) {
            self.timers
                .arm(TimerKind::Heartbeat, now + Cfg::HEARTBEAT_INTERVAL);
        }
        if !self.timers.is_armed(TimerKind::Maintenance) {
            self.timers
                .arm(TimerKind::Maintenance, now + Cfg::HEARTBEAT_INTERVAL);
        }
        self.release_temp_peering();

        info!(node = %me, %leader, layer, "joined cluster");
        self.push_event(Event::JoinedCluster { layer, leader });
    }

    pub(crate) fn handle_join_cluster(&mut self, src: NodeId, layer: usize, now: Timestamp) {
        let me = self.node_id;
        let Some(leader) = self.clusters[layer].leader() else {
            debug!(node = %me, %src, layer, "join for leaderless layer");
            return;
        };
        if leader != me {
            if Cfg::ENHANCED_MODE {
                self.send(leader, Message::JoinCluster(Control::new(src, Some(layer))));
            }
            return;
        }

        if self.clusters[layer].add(src) {
            self.metrics.joins_accepted += 1;
            debug!(node = %me, %src, layer, "accepted member");
        }
        self.peers.ensure(src, now);
        if Cfg::ENHANCED_MODE {
            self.send_heartbeat_to(src, layer, now);
        }
    }

    /// Check the RP is alive; re-polled until it answers.
    pub(crate) fn poll_rp(&mut self, now: Timestamp) {
        let Some(rp) = self.rendezvous_point.filter(|_| !self.is_rp) else {
            return;
        };
        self.send(rp, Message::PollRp(Control::new(self.node_id, None)));
        self.timers
            .arm(TimerKind::RpPoll, now + Cfg::RP_POLL_INTERVAL);
        self.polled_rp = Some(rp);
    }

    pub(crate) fn handle_poll_rp(&mut self, src: NodeId) {
        if !self.is_rp {
            return;
        }
        let layer = self.highest_leader_layer();
        self.send(src, Message::PollRpResponse(Control::new(self.node_id, layer)));
    }

    pub(crate) fn handle_poll_rp_response(&mut self, src: NodeId) {
        if self.polled_rp == Some(src) && self.rendezvous_point == Some(src) {
            self.polled_rp = None;
            self.timers.cancel(TimerKind::RpPoll);
        }
    }

    pub(crate) fn handle_peer_temporary(&mut self, src: NodeId, now: Timestamp) {
        self.temp_peers.insert(src, now);
    }

    pub(crate) fn handle_peer_temporary_release(&mut self, src: NodeId) {
        self.temp_peers.remove(&src);
    }
}
