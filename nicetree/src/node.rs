//! Node implementation - the per-peer protocol state machine.
//!
//! The Node struct owns all protocol state of one overlay member and is fully
//! event-driven:
//! - Incoming datagrams are decoded and dispatched to the protocol handlers
//! - Application payloads from the outgoing channel are multicast to the group
//! - Expired timer slots trigger heartbeats, maintenance and join retries
//!
//! Handlers run to completion for one event and never block. Hosts either
//! call the synchronous entry points (`handle_transport_rx`, `fire_timer`,
//! ...) directly or spawn the async `run()` loop.
//!
//! # Usage
//!
//! ```ignore
//! let mut node = Node::<_, _, _, _, DefaultConfig>::new(id, transport, oracle, random, clock);
//!
//! // Spawn the node's run loop
//! spawn(async move {
//!     node.run().await;
//! });
//!
//! // Multicast to the group
//! node.outgoing().send(payload).await;
//!
//! // Receive data multicast by other nodes
//! let data = node.incoming().receive().await;
//! ```

use core::marker::PhantomData;
use std::collections::VecDeque;

use embassy_sync::channel::Channel;
use hashbrown::HashMap;
use tracing::{debug, info, trace, warn};

use crate::cluster::ClusterTable;
use crate::config::{DefaultConfig, NiceConfig};
use crate::peer::PeerDirectory;
use crate::time::{Duration, Timestamp};
use crate::timer::{TimerId, TimerKind, Timers};
use crate::traits::{
    AppInChannel, AppOutChannel, BootstrapOracle, Clock, Datagram, EventChannel, IncomingData,
    Random, Transport,
};
use crate::types::{
    Control, Error, Event, NodeId, NodeMetrics, Payload, ProtocolState, MAX_LAYERS,
};
use crate::wire::{Decode, Encode, Message};

/// The main protocol node.
///
/// Generic over:
/// - `T`: Transport implementation
/// - `B`: Bootstrap oracle locating the rendezvous point
/// - `R`: Random number generator
/// - `Clk`: Clock/timer implementation
/// - `Cfg`: Protocol tunables
pub struct Node<T, B, R, Clk, Cfg = DefaultConfig> {
    // Dependencies (injected)
    pub(crate) transport: T,
    pub(crate) oracle: B,
    pub(crate) random: R,
    pub(crate) clock: Clk,

    // Application-level channels
    app_incoming: AppInChannel,
    app_outgoing: AppOutChannel,
    events: EventChannel,

    // Identity
    pub(crate) node_id: NodeId,
    pub(crate) rendezvous_point: Option<NodeId>,
    pub(crate) is_rp: bool,
    pub(crate) state: ProtocolState,

    // Hierarchy
    pub(crate) clusters: ClusterTable,
    pub(crate) peers: PeerDirectory,
    /// Joining nodes temporarily attached to this node (RP only), with the
    /// time they attached.
    pub(crate) temp_peers: HashMap<NodeId, Timestamp>,
    pub(crate) is_temp_peered: bool,

    // Join descent
    pub(crate) target_layer: usize,
    pub(crate) join_layer: Option<usize>,
    pub(crate) temp_resolver: Option<NodeId>,
    pub(crate) polled_rp: Option<NodeId>,
    pub(crate) query_start: Timestamp,
    pub(crate) query_rtt: Option<Duration>,
    pub(crate) eval_layer: Option<usize>,
    pub(crate) eval_start: Timestamp,

    /// Recent leader heartbeat senders per layer, for flapping detection.
    pub(crate) leader_heartbeats: [VecDeque<(NodeId, Timestamp)>; MAX_LAYERS],

    // Scheduling
    pub(crate) timers: Timers,

    // Metrics
    pub(crate) metrics: NodeMetrics,

    _config: PhantomData<Cfg>,
}

impl<T, B, R, Clk, Cfg> Node<T, B, R, Clk, Cfg>
where
    T: Transport,
    B: BootstrapOracle,
    R: Random,
    Clk: Clock,
    Cfg: NiceConfig,
{
    /// Create a node in the INIT state. Nothing is sent until `bootstrap`.
    pub fn new(node_id: NodeId, transport: T, oracle: B, random: R, clock: Clk) -> Self {
        Self {
            transport,
            oracle,
            random,
            clock,

            app_incoming: Channel::new(),
            app_outgoing: Channel::new(),
            events: Channel::new(),

            node_id,
            rendezvous_point: None,
            is_rp: false,
            state: ProtocolState::Init,

            clusters: ClusterTable::new(),
            peers: PeerDirectory::new(node_id),
            temp_peers: HashMap::new(),
            is_temp_peered: false,

            target_layer: 0,
            join_layer: None,
            temp_resolver: None,
            polled_rp: None,
            query_start: Timestamp::ZERO,
            query_rtt: None,
            eval_layer: None,
            eval_start: Timestamp::ZERO,

            leader_heartbeats: std::array::from_fn(|_| VecDeque::new()),

            timers: Timers::new(),

            metrics: NodeMetrics::new(),

            _config: PhantomData,
        }
    }

    /// Get this node's identity.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_rendezvous_point(&self) -> bool {
        self.is_rp
    }

    /// The RP as learned at bootstrap.
    pub fn rendezvous_point(&self) -> Option<NodeId> {
        self.rendezvous_point
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Local view of every cluster layer.
    pub fn clusters(&self) -> &ClusterTable {
        &self.clusters
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Highest layer this node participates in.
    pub fn highest_layer(&self) -> Option<usize> {
        self.clusters.highest_layer(&self.node_id)
    }

    /// Highest layer this node leads.
    pub fn highest_leader_layer(&self) -> Option<usize> {
        self.clusters.highest_leader_layer(&self.node_id)
    }

    /// Number of joining nodes currently attached through temporary peering.
    pub fn temp_peer_count(&self) -> usize {
        self.temp_peers.len()
    }

    /// Channel for receiving multicast data from other nodes.
    pub fn incoming(&self) -> &AppInChannel {
        &self.app_incoming
    }

    /// Channel for submitting payloads to multicast to the group.
    pub fn outgoing(&self) -> &AppOutChannel {
        &self.app_outgoing
    }

    /// Channel for protocol events.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Get the transport reference.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the clock reference.
    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    /// Get the current timestamp from the clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Protocol counters for monitoring.
    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Earliest armed timer deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Timer armings since the last call, for hosts that schedule callbacks
    /// themselves and hand them back through `fire_timer`.
    pub fn drain_armed_timers(&mut self) -> Vec<(TimerId, Timestamp)> {
        self.timers.drain_armed()
    }

    /// Leave INIT and start joining the overlay. No-op once started.
    pub fn bootstrap(&mut self, now: Timestamp) {
        if self.state != ProtocolState::Init {
            return;
        }
        self.change_state(ProtocolState::Bootstrap, now);
    }

    /// Leave the overlay, handing every led layer over to a successor.
    ///
    /// The node returns to INIT and may bootstrap again later. The RP is the
    /// fixed root of the hierarchy and refuses to leave.
    pub fn leave(&mut self) -> Result<(), Error> {
        if self.is_rp {
            return Err(Error::RendezvousPointDeparture);
        }
        if self.highest_layer().is_some() {
            self.graceful_leave(0);
        }
        self.release_temp_peering();
        for kind in TimerKind::ALL {
            self.timers.cancel(kind);
        }
        self.clusters = ClusterTable::new();
        for window in &mut self.leader_heartbeats {
            window.clear();
        }
        self.eval_layer = None;
        self.polled_rp = None;
        self.state = ProtocolState::Init;
        info!(node = %self.node_id, "left the overlay");
        Ok(())
    }

    /// Run the node's main loop.
    ///
    /// Bootstraps if still in INIT, then serves incoming datagrams,
    /// application payloads and timers forever.
    pub async fn run(&mut self) -> ! {
        use embassy_futures::select::{select3, Either3};

        if self.state == ProtocolState::Init {
            let now = self.clock.now();
            self.bootstrap(now);
        }

        loop {
            let wake = self
                .timers
                .next_deadline()
                .unwrap_or_else(|| self.clock.now() + Cfg::HEARTBEAT_INTERVAL);

            // Wait for: incoming message, outgoing app data, or timer
            let result = select3(
                self.transport.incoming().receive(),
                self.app_outgoing.receive(),
                self.clock.sleep_until(wake),
            )
            .await;

            match result {
                Either3::First(datagram) => {
                    let now = self.clock.now();
                    self.handle_transport_rx(&datagram.data, now);
                }
                Either3::Second(payload) => self.handle_app_send(payload),
                Either3::Third(()) => {
                    let now = self.clock.now();
                    self.handle_timer(now);
                }
            }
        }
    }

    /// Handle one incoming datagram.
    pub fn handle_transport_rx(&mut self, data: &[u8], now: Timestamp) {
        let msg = match Message::decode_from_slice(data) {
            Ok(m) => m,
            Err(err) => {
                self.metrics.decode_errors += 1;
                debug!(node = %self.node_id, %err, "dropping undecodable datagram");
                return;
            }
        };
        self.handle_message(msg, now);
    }

    /// Multicast an application payload to the group.
    pub fn handle_app_send(&mut self, payload: Payload) {
        if self.state == ProtocolState::Init {
            debug!(node = %self.node_id, "not bootstrapped, dropping application payload");
            return;
        }
        self.originate_multicast(payload);
    }

    /// Fire every timer slot that is due.
    pub fn handle_timer(&mut self, now: Timestamp) {
        for id in self.timers.due(now) {
            self.fire_timer(id, now);
        }
    }

    /// Fire one timer. Stale ids (re-armed or cancelled since) are ignored.
    pub fn fire_timer(&mut self, id: TimerId, now: Timestamp) {
        if !self.timers.take(id) {
            trace!(node = %self.node_id, kind = ?id.kind, "stale timer");
            return;
        }
        match id.kind {
            TimerKind::Heartbeat => {
                self.send_heartbeats(now);
                self.timers
                    .arm(TimerKind::Heartbeat, now + Cfg::HEARTBEAT_INTERVAL);
            }
            TimerKind::Maintenance => {
                self.maintenance(now);
                self.timers
                    .arm(TimerKind::Maintenance, now + Cfg::MAINTENANCE_INTERVAL);
            }
            TimerKind::Query => self.handle_query_timeout(now),
            TimerKind::RpPoll => self.poll_rp(now),
        }
    }

    /// Route a decoded message to its handler.
    pub(crate) fn handle_message(&mut self, msg: Message, now: Timestamp) {
        if self.state == ProtocolState::Init {
            trace!(node = %self.node_id, kind = msg.kind(), "not bootstrapped, dropping");
            return;
        }
        self.metrics.messages_received += 1;
        if !msg.has_valid_layer() {
            debug!(node = %self.node_id, kind = msg.kind(), layer = ?msg.layer(), "layer out of range");
            return;
        }

        let src = msg.src();
        let kind = msg.kind();
        let layer = msg.layer().map(usize::from);
        self.peers.touch(&src, now);
        trace!(node = %self.node_id, kind, %src, layer = ?layer, "received");

        match msg {
            Message::Query(m) => self.handle_query(m.src, layer, now),
            Message::QueryResponse(m) => self.handle_query_response(m, now),
            Message::PollRp(m) => self.handle_poll_rp(m.src),
            Message::PollRpResponse(m) => self.handle_poll_rp_response(m.src),
            Message::Heartbeat(hb) => self.handle_heartbeat(hb, now),
            Message::LeaderHeartbeat(hb) => self.handle_leader_heartbeat(hb, now),
            Message::LeaderTransfer(m) => self.handle_leader_transfer(m, now),
            Message::PeerTemporary(m) => self.handle_peer_temporary(m.src, now),
            Message::PeerTemporaryRelease(m) => self.handle_peer_temporary_release(m.src),
            Message::ClusterMergeRequest(m) => self.handle_cluster_merge_request(m, now),
            Message::Multicast(m) => self.handle_multicast(m),
            Message::JoinCluster(m) => {
                if let Some(layer) = self.required_layer(kind, layer) {
                    self.handle_join_cluster(m.src, layer, now);
                }
            }
            Message::JoinEval(m) => {
                if let Some(layer) = self.required_layer(kind, layer) {
                    self.handle_join_eval(m.src, layer);
                }
            }
            Message::JoinEvalResponse(m) => {
                if let Some(layer) = self.required_layer(kind, layer) {
                    self.handle_join_eval_response(m.src, layer, now);
                }
            }
            Message::Remove(m) => {
                if let Some(layer) = self.required_layer(kind, layer) {
                    self.handle_remove(m.src, layer);
                }
            }
            Message::PingProbe(m) => {
                if let Some(layer) = self.required_layer(kind, layer) {
                    self.handle_ping_probe(m.src, layer);
                }
            }
            Message::PingProbeResponse(m) => {
                if let Some(layer) = self.required_layer(kind, layer) {
                    self.handle_ping_probe_response(m.src, layer, now);
                }
            }
            Message::ForceMerge(m) => {
                if let Some(layer) = self.required_layer(kind, layer) {
                    self.cluster_merge_request(m.src, layer);
                }
            }
        }
    }

    fn required_layer(&self, kind: &'static str, layer: Option<usize>) -> Option<usize> {
        if layer.is_none() {
            debug!(node = %self.node_id, kind, "missing layer, dropping");
        }
        layer
    }

    /// Move to `state`, performing its entry actions.
    pub(crate) fn change_state(&mut self, state: ProtocolState, now: Timestamp) {
        let previous = self.state;
        self.state = state;
        match state {
            ProtocolState::Init => {}
            ProtocolState::Bootstrap => {
                let me = self.node_id;
                match self.oracle.get_node().filter(|rp| *rp != me) {
                    None => self.become_rendezvous_point(now),
                    Some(rp) => {
                        debug!(node = %me, %rp, "bootstrapping through rendezvous point");
                        self.rendezvous_point = Some(rp);
                        self.peers.ensure(rp, now);
                        self.poll_rp(now);
                        self.basic_join_layer(None, now);
                    }
                }
            }
            ProtocolState::Ready => {
                self.timers
                    .arm(TimerKind::Heartbeat, now + Cfg::HEARTBEAT_INTERVAL);
                self.timers
                    .arm(TimerKind::Maintenance, now + Cfg::MAINTENANCE_INTERVAL);
                if !self.is_rp {
                    self.oracle.remove_node(self.node_id);
                }
                if previous != ProtocolState::Ready {
                    info!(node = %self.node_id, layer = ?self.highest_layer(), "ready");
                    self.push_event(Event::Ready);
                }
            }
        }
    }

    /// No RP exists yet: found the overlay as its sole member.
    fn become_rendezvous_point(&mut self, now: Timestamp) {
        let me = self.node_id;
        self.is_rp = true;
        self.rendezvous_point = Some(me);
        self.clusters[0].add(me);
        self.clusters[0].set_leader(me);
        self.oracle.register_node(me);
        info!(node = %me, "became rendezvous point");
        self.push_event(Event::BecameRendezvousPoint);
        self.change_state(ProtocolState::Ready, now);
    }

    /// Drop the temporary attachment to the RP used while joining.
    pub(crate) fn release_temp_peering(&mut self) {
        if !self.is_temp_peered {
            return;
        }
        self.is_temp_peered = false;
        if let Some(rp) = self.rendezvous_point {
            self.send(rp, Message::PeerTemporaryRelease(Control::new(self.node_id, None)));
        }
    }

    /// Encode and queue a message. Sending to self is suppressed.
    pub(crate) fn send(&mut self, to: NodeId, msg: Message) {
        if to == self.node_id || to.is_unspecified() {
            return;
        }
        let data = match msg.encode_to_vec() {
            Ok(data) => data,
            Err(err) => {
                warn!(node = %self.node_id, kind = msg.kind(), %err, "failed to encode");
                self.metrics.messages_dropped += 1;
                return;
            }
        };
        match self.transport.outgoing().try_send(Datagram { peer: to, data }) {
            Ok(()) => self.metrics.messages_sent += 1,
            Err(_) => {
                trace!(node = %self.node_id, kind = msg.kind(), %to, "outgoing queue full");
                self.metrics.messages_dropped += 1;
            }
        }
    }

    /// Push an event to the events channel.
    pub(crate) fn push_event(&mut self, event: Event) {
        let _ = self.events.try_send(event);
    }

    /// Push incoming data to the app_incoming channel.
    pub(crate) fn push_incoming_data(&mut self, origin: NodeId, payload: Payload) {
        let _ = self.app_incoming.try_send(IncomingData { origin, payload });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::test_impls::{MockClock, MockOracle, MockRandom, MockTransport};
    use crate::types::QueryResponse;

    type TestNode = Node<MockTransport, MockOracle, MockRandom, MockClock, DefaultConfig>;

    fn node(n: u32) -> NodeId {
        NodeId::from_ipv4(n, 1024)
    }

    fn make_node(id: NodeId, oracle: MockOracle) -> TestNode {
        Node::new(
            id,
            MockTransport::new(),
            oracle,
            MockRandom::new(),
            MockClock::new(),
        )
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

    #[test]
    fn test_node_creation() {
        let n = make_node(node(1), MockOracle::new());
        assert_eq!(n.node_id(), node(1));
        assert_eq!(n.state(), ProtocolState::Init);
        assert!(!n.is_rendezvous_point());
        assert_eq!(n.highest_layer(), None);
        assert_eq!(n.next_deadline(), None);
    }

    #[test]
    fn test_first_node_becomes_rp() {
        let oracle = MockOracle::new();
        let mut n = make_node(node(1), oracle.clone());
        n.bootstrap(Timestamp::ZERO);

        assert!(n.is_rendezvous_point());
        assert_eq!(n.state(), ProtocolState::Ready);
        assert_eq!(n.clusters()[0].members(), &[node(1)]);
        assert!(n.clusters()[0].is_leader(&node(1)));
        assert_eq!(oracle.nodes(), vec![node(1)]);
        assert_eq!(n.events().try_receive().ok(), Some(Event::BecameRendezvousPoint));
        assert_eq!(n.events().try_receive().ok(), Some(Event::Ready));
        assert!(sent(&n).is_empty());
    }

    #[test]
    fn test_bootstrap_queries_rp() {
        let rp = node(1);
        let mut n = make_node(node(2), MockOracle::with_node(rp));
        n.bootstrap(Timestamp::ZERO);

        assert_eq!(n.state(), ProtocolState::Bootstrap);
        assert_eq!(n.rendezvous_point(), Some(rp));
        let out = sent(&n);
        let kinds: Vec<&str> = out.iter().map(|(_, m)| m.kind()).collect();
        assert_eq!(kinds, vec!["POLL_RP", "QUERY", "PEER_TEMPORARY"]);
        assert!(out.iter().all(|(to, _)| *to == rp));
        assert_eq!(out[1].1, Message::Query(Control::new(node(2), None)));
    }

    #[test]
    fn test_messages_dropped_in_init() {
        let mut n = make_node(node(2), MockOracle::new());
        deliver(
            &mut n,
            Message::Query(Control::new(node(3), None)),
            Timestamp::ZERO,
        );
        assert_eq!(n.metrics().messages_received, 0);
        assert!(sent(&n).is_empty());
    }

    #[test]
    fn test_undecodable_datagram_counted() {
        let mut n = make_node(node(1), MockOracle::new());
        n.bootstrap(Timestamp::ZERO);
        n.handle_transport_rx(&[0xff, 0xff, 0xff], Timestamp::ZERO);
        assert_eq!(n.metrics().decode_errors, 1);
    }

    #[test]
    fn test_out_of_range_layer_dropped() {
        let mut n = make_node(node(1), MockOracle::new());
        n.bootstrap(Timestamp::ZERO);
        deliver(
            &mut n,
            Message::Query(Control::new(node(3), Some(crate::types::MAX_LAYERS))),
            Timestamp::ZERO,
        );
        // RP would have self-promoted had the layer been accepted
        assert!(n.clusters()[1].is_empty());
        assert!(sent(&n).is_empty());
    }

    #[test]
    fn test_stale_timer_is_noop() {
        let mut n = make_node(node(1), MockOracle::new());
        n.bootstrap(Timestamp::ZERO);
        let armed = n.drain_armed_timers();
        let (hb, _) = armed
            .iter()
            .copied()
            .find(|(id, _)| id.kind == TimerKind::Heartbeat)
            .unwrap();

        // Re-arming makes the drained id stale
        n.change_state(ProtocolState::Ready, Timestamp::from_secs(1));
        n.fire_timer(hb, Timestamp::from_secs(5));
        assert_eq!(n.metrics().heartbeats_sent, 0);
        assert_eq!(
            n.timers.deadline(TimerKind::Heartbeat),
            Some(Timestamp::from_secs(1) + DefaultConfig::HEARTBEAT_INTERVAL)
        );
    }

    #[test]
    fn test_rp_cannot_leave() {
        let mut n = make_node(node(1), MockOracle::new());
        n.bootstrap(Timestamp::ZERO);
        assert!(matches!(n.leave(), Err(Error::RendezvousPointDeparture)));
        assert_eq!(n.state(), ProtocolState::Ready);
    }

    #[test]
    fn test_member_leave_notifies_leader() {
        let rp = node(1);
        let mut n = make_node(node(2), MockOracle::with_node(rp));
        n.bootstrap(Timestamp::ZERO);
        deliver(
            &mut n,
            Message::QueryResponse(QueryResponse {
                src: rp,
                layer: 0,
                members: vec![],
            }),
            Timestamp::from_millis(40),
        );
        sent(&n);

        assert!(n.leave().is_ok());
        assert_eq!(n.state(), ProtocolState::Init);
        assert_eq!(n.highest_layer(), None);
        assert_eq!(n.next_deadline(), None);
        let out = sent(&n);
        assert_eq!(
            out,
            vec![(rp, Message::Remove(Control::new(node(2), Some(0))))]
        );
    }

    #[test]
    fn test_send_to_self_suppressed() {
        let mut n = make_node(node(1), MockOracle::new());
        n.send(node(1), Message::Query(Control::new(node(1), None)));
        assert!(sent(&n).is_empty());
        assert_eq!(n.metrics().messages_sent, 0);
    }
}
