//! Leadership hand-off and layer departure.
//!
//! Every change of leadership goes through LEADERTRANSFER. The sender only
//! informs the new leader of what it inherits; the receiver completes the
//! transition once it starts heartbeating the layer.

use tracing::{debug, info};

use crate::config::NiceConfig;
use crate::distance::find_center;
use crate::node::Node;
use crate::time::Timestamp;
use crate::traits::{BootstrapOracle, Clock, Random, Transport};
use crate::types::{Event, LeaderTransfer, NodeId, MAX_LAYERS};
use crate::wire::Message;

impl<T, B, R, Clk, Cfg> Node<T, B, R, Clk, Cfg>
where
    T: Transport,
    B: BootstrapOracle,
    R: Random,
    Clk: Clock,
    Cfg: NiceConfig,
{
    /// Leader and members of the cluster one layer above `layer`.
    pub(crate) fn supercluster_of(&self, layer: usize) -> (Option<NodeId>, Vec<NodeId>) {
        match self.clusters.get(layer + 1) {
            Some(above) => (above.leader(), above.members().to_vec()),
            None => (None, Vec::new()),
        }
    }

    /// Hand `layer` with its current membership and supercluster to `to`.
    pub(crate) fn leader_transfer(&mut self, layer: usize, to: NodeId) {
        assert!(
            !self.is_rp,
            "the rendezvous point cannot hand off leadership"
        );
        debug_assert!(self.clusters[layer].contains(&to));

        let members = self.clusters[layer].members().to_vec();
        let (supercluster_leader, supercluster_members) = self.supercluster_of(layer);
        self.send_leader_transfer(to, layer, members, supercluster_leader, supercluster_members);
    }

    pub(crate) fn send_leader_transfer(
        &mut self,
        to: NodeId,
        layer: usize,
        members: Vec<NodeId>,
        supercluster_leader: Option<NodeId>,
        supercluster_members: Vec<NodeId>,
    ) {
        info!(node = %self.node_id, %to, layer, "transferring leadership");
        self.send(
            to,
            Message::LeaderTransfer(LeaderTransfer {
                src: self.node_id,
                layer: layer as u8,
                members,
                supercluster_leader,
                supercluster_members,
            }),
        );
        self.push_event(Event::LeadershipTransferred { layer, to });
    }

    /// Give the leadership of `layer` to `new` while staying a member.
    ///
    /// The layers above are vacated first, since only a leader of `layer`
    /// belongs there.
    pub(crate) fn hand_over_leadership(&mut self, layer: usize, new: NodeId) {
        if self.highest_layer().is_some_and(|top| layer < top) {
            self.graceful_leave(layer + 1);
        }
        self.clusters[layer].set_leader(new);
        self.leader_transfer(layer, new);
    }

    /// Leave `layer`: tell its leader and drop self from the local view.
    pub(crate) fn remove_from_layer(&mut self, layer: usize) {
        let me = self.node_id;
        if let Some(leader) = self.clusters[layer].leader() {
            self.send_remove_to(leader, layer);
        }
        self.clusters[layer].remove(&me);
    }

    /// Vacate every layer from the top down to `bottom`.
    ///
    /// At a layer where self is a plain member it simply leaves. Every layer
    /// self leads is handed to the graph center of the remaining members.
    pub(crate) fn graceful_leave(&mut self, bottom: usize) {
        assert!(
            !self.is_rp,
            "the rendezvous point cannot leave a layer"
        );
        let me = self.node_id;
        let Some(top) = self.highest_layer().filter(|top| *top >= bottom) else {
            return;
        };
        debug!(node = %me, top, bottom, "graceful leave");

        if self.clusters[top].leader().is_some_and(|l| l != me) {
            self.remove_from_layer(top);
        }

        let Some(led) = self.highest_leader_layer() else {
            return;
        };
        for layer in (bottom..=led).rev() {
            self.remove_from_layer(layer);
            let members = self.clusters[layer].members().to_vec();
            let Some((center, _)) = find_center(&self.peers, &members) else {
                continue;
            };
            self.clusters[layer].set_leader(center);
            self.leader_transfer(layer, center);
        }
    }

    pub(crate) fn handle_leader_transfer(&mut self, msg: LeaderTransfer, now: Timestamp) {
        let me = self.node_id;
        let layer = msg.layer as usize;
        let Some(leader) = self.clusters[layer].leader() else {
            debug!(node = %me, src = %msg.src, layer, "transfer for a layer we are not in");
            return;
        };

        if leader == me {
            // Already leading: fold the sender's view in
            for member in &msg.members {
                self.clusters[layer].add(*member);
                self.peers.ensure(*member, now);
            }
        } else {
            let cluster = &mut self.clusters[layer];
            cluster.clear();
            cluster.add(me);
            cluster.set_leader(me);
            for member in &msg.members {
                self.clusters[layer].add(*member);
                self.peers.touch_or_insert(*member, now);
            }
            info!(node = %me, src = %msg.src, layer, size = self.clusters[layer].len(), "took over leadership");
            self.adopt_supercluster(&msg, now);
        }

        if Cfg::ENHANCED_MODE {
            self.send_heartbeats(now);
        }
    }

    /// Enter the supercluster a transfer names, or find one through the RP.
    fn adopt_supercluster(&mut self, msg: &LeaderTransfer, now: Timestamp) {
        let me = self.node_id;
        let above = msg.layer as usize + 1;
        if above >= MAX_LAYERS {
            return;
        }

        if msg.supercluster_members.is_empty() {
            if !self.is_rp && self.rendezvous_point != Some(msg.src) {
                self.basic_join_layer(Some(above), now);
            }
            return;
        }

        self.clusters[above].clear();
        for member in &msg.supercluster_members {
            self.clusters[above].add(*member);
            self.peers.touch_or_insert(*member, now);
        }
        self.clusters[above].add(me);

        if let Some(sc_leader) = msg.supercluster_leader {
            self.clusters[above].set_leader(sc_leader);
            if sc_leader != me {
                self.join_cluster(sc_leader, above, now);
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
    use crate::types::{Control, Event, LeaderTransfer, NodeId};
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

    /// A non-RP node that has started bootstrapping through `rp`.
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

    #[test]
    fn test_graceful_leave_hands_layer_to_center() {
        let rp = node(1);
        let me = node(5);
        let mut n = started(me, rp);
        for m in [me, node(6), node(7)] {
            n.clusters[0].add(m);
        }
        n.clusters[0].set_leader(me);
        n.clusters[1].add(rp);
        n.clusters[1].add(me);
        n.clusters[1].set_leader(rp);

        n.graceful_leave(0);

        assert_eq!(n.highest_layer(), None);
        assert_eq!(n.clusters()[0].leader(), Some(node(6)));
        let out = sent(&n);
        assert_eq!(out[0], (rp, Message::Remove(Control::new(me, Some(1)))));
        assert_eq!(
            out[1],
            (
                node(6),
                Message::LeaderTransfer(LeaderTransfer {
                    src: me,
                    layer: 0,
                    members: vec![node(6), node(7)],
                    supercluster_leader: Some(rp),
                    supercluster_members: vec![rp],
                })
            )
        );
        assert_eq!(out.len(), 2);
        assert_eq!(
            n.events().try_receive().ok(),
            Some(Event::LeadershipTransferred {
                layer: 0,
                to: node(6)
            })
        );
    }

    #[test]
    fn test_hand_over_keeps_membership() {
        let rp = node(1);
        let me = node(5);
        let mut n = started(me, rp);
        for m in [me, node(6)] {
            n.clusters[0].add(m);
        }
        n.clusters[0].set_leader(me);
        n.clusters[1].add(rp);
        n.clusters[1].add(me);
        n.clusters[1].set_leader(rp);

        n.hand_over_leadership(0, node(6));

        assert!(n.clusters()[0].contains(&me));
        assert_eq!(n.clusters()[0].leader(), Some(node(6)));
        assert!(!n.clusters()[1].contains(&me));
        let kinds: Vec<&str> = sent(&n).iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds, vec!["REMOVE", "LEADERTRANSFER"]);
    }

    #[test]
    fn test_transfer_promotes_receiver_and_joins_supercluster() {
        let rp = node(1);
        let old = node(4);
        let me = node(5);
        let mut n = started(me, rp);
        n.clusters[0].add(old);
        n.clusters[0].add(me);
        n.clusters[0].set_leader(old);

        deliver(
            &mut n,
            Message::LeaderTransfer(LeaderTransfer {
                src: old,
                layer: 0,
                members: vec![me, node(6)],
                supercluster_leader: Some(rp),
                supercluster_members: vec![rp],
            }),
            Timestamp::from_secs(1),
        );

        assert!(n.clusters()[0].is_leader(&me));
        assert_eq!(n.clusters()[0].members(), &[me, node(6)]);
        assert_eq!(n.clusters()[1].leader(), Some(rp));
        assert!(n.clusters()[1].contains(&me));
        assert_eq!(n.highest_layer(), Some(1));

        let out = sent(&n);
        assert!(out.contains(&(rp, Message::JoinCluster(Control::new(me, Some(1))))));
        assert!(out
            .iter()
            .any(|(to, m)| *to == node(6) && m.kind() == "LEADERHEARTBEAT"));
    }

    #[test]
    fn test_transfer_without_supercluster_rejoins_through_rp() {
        let rp = node(1);
        let old = node(4);
        let me = node(5);
        let mut n = started(me, rp);
        n.clusters[0].add(old);
        n.clusters[0].add(me);
        n.clusters[0].set_leader(old);

        deliver(
            &mut n,
            Message::LeaderTransfer(LeaderTransfer {
                src: old,
                layer: 0,
                members: vec![me],
                supercluster_leader: None,
                supercluster_members: vec![],
            }),
            Timestamp::from_secs(1),
        );

        assert_eq!(n.target_layer, 1);
        let out = sent(&n);
        assert!(out.contains(&(rp, Message::Query(Control::new(me, None)))));
        assert!(out.contains(&(rp, Message::PeerTemporary(Control::new(me, None)))));
    }

    #[test]
    fn test_transfer_to_current_leader_merges_members() {
        let rp = node(1);
        let me = node(5);
        let mut n = started(me, rp);
        n.clusters[0].add(me);
        n.clusters[0].set_leader(me);

        deliver(
            &mut n,
            Message::LeaderTransfer(LeaderTransfer {
                src: node(9),
                layer: 0,
                members: vec![me, node(6), node(7)],
                supercluster_leader: None,
                supercluster_members: vec![],
            }),
            Timestamp::from_secs(1),
        );
        assert_eq!(n.clusters()[0].members(), &[me, node(6), node(7)]);
        assert!(n.peers().contains(&node(7)));
        assert!(n.clusters()[1].is_empty());
    }

    #[test]
    #[should_panic(expected = "rendezvous point cannot hand off")]
    fn test_rp_cannot_hand_off() {
        let mut rp: TestNode = Node::new(
            node(1),
            MockTransport::new(),
            MockOracle::new(),
            MockRandom::new(),
            MockClock::new(),
        );
        rp.bootstrap(Timestamp::ZERO);
        rp.clusters[0].add(node(2));
        rp.leader_transfer(0, node(2));
    }
}
