//! SimNode wrapper and simulated collaborators for nicetree nodes.

use std::cell::{Cell, RefCell};
use std::future::{ready, Ready};
use std::rc::Rc;

use embassy_sync::channel::Channel;
use nicetree::config::FastConfig;
use nicetree::traits::{
    BootstrapOracle, Clock, Datagram, IncomingData, Random, Transport, TransportInChannel,
    TransportOutChannel,
};
use nicetree::{Duration, Event, Node, NodeId, ProtocolState, TimerId, Timestamp};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Transport whose queues are drained and filled by the simulator.
pub struct SimTransport {
    outgoing: TransportOutChannel,
    incoming: TransportInChannel,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            outgoing: Channel::new(),
            incoming: Channel::new(),
        }
    }

    /// Take all queued outgoing datagrams in send order.
    pub fn take_sent(&self) -> Vec<Datagram> {
        let mut datagrams = Vec::new();
        while let Ok(d) = self.outgoing.try_receive() {
            datagrams.push(d);
        }
        datagrams
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn outgoing(&self) -> &TransportOutChannel {
        &self.outgoing
    }

    fn incoming(&self) -> &TransportInChannel {
        &self.incoming
    }
}

/// Clock for simulation.
///
/// Time is controlled externally by the simulator.
pub struct SimClock {
    current: Cell<Timestamp>,
}

impl SimClock {
    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Cell::new(time),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }

    pub fn advance(&self, duration: Duration) {
        self.current.set(self.current.get() + duration);
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Timestamp {
        self.current.get()
    }

    fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
        ready(())
    }
}

/// Seeded random source.
pub struct SimRandom {
    rng: SmallRng,
}

impl SimRandom {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Random for SimRandom {
    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..max)
    }
}

/// Bootstrap registry shared by every node of one simulation.
#[derive(Clone, Default)]
pub struct SimOracle {
    nodes: Rc<RefCell<Vec<NodeId>>>,
}

impl SimOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.borrow().clone()
    }
}

impl BootstrapOracle for SimOracle {
    fn get_node(&self) -> Option<NodeId> {
        self.nodes.borrow().first().copied()
    }

    fn register_node(&self, node: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }

    fn remove_node(&self, node: NodeId) {
        self.nodes.borrow_mut().retain(|n| *n != node);
    }
}

/// Type alias for simulated nodes.
pub type SimNodeInner = Node<SimTransport, SimOracle, SimRandom, SimClock, FastConfig>;

/// Wrapper around a nicetree Node for simulation.
///
/// Keeps every protocol event and delivered payload, since the node's own
/// channels are bounded.
pub struct SimNode {
    inner: SimNodeInner,
    /// When the node was created.
    pub created_at: Timestamp,
    events: Vec<Event>,
    delivered: Vec<IncomingData>,
}

impl SimNode {
    pub fn new(id: NodeId, oracle: SimOracle, seed: u64, created_at: Timestamp) -> Self {
        let inner = Node::new(
            id,
            SimTransport::new(),
            oracle,
            SimRandom::with_seed(seed),
            SimClock::at(created_at),
        );
        Self {
            inner,
            created_at,
            events: Vec::new(),
            delivered: Vec::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id()
    }

    /// Get a reference to the inner node.
    pub fn inner(&self) -> &SimNodeInner {
        &self.inner
    }

    /// Get a mutable reference to the inner node.
    pub fn inner_mut(&mut self) -> &mut SimNodeInner {
        &mut self.inner
    }

    pub fn state(&self) -> ProtocolState {
        self.inner.state()
    }

    pub fn is_rendezvous_point(&self) -> bool {
        self.inner.is_rendezvous_point()
    }

    pub fn highest_layer(&self) -> Option<usize> {
        self.inner.highest_layer()
    }

    /// Leader of the node's layer 0 cluster.
    pub fn cluster_leader(&self) -> Option<NodeId> {
        self.inner.clusters()[0].leader()
    }

    pub fn cluster_size(&self) -> usize {
        self.inner.clusters()[0].len()
    }

    pub fn bootstrap(&mut self, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.bootstrap(now);
        self.collect();
    }

    pub fn handle_transport_rx(&mut self, data: &[u8], now: Timestamp) {
        // Keep clock.now() in step for code that reads it
        self.inner.clock().set(now);
        self.inner.handle_transport_rx(data, now);
        self.collect();
    }

    pub fn fire_timer(&mut self, id: TimerId, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.fire_timer(id, now);
        self.collect();
    }

    pub fn app_send(&mut self, payload: Vec<u8>, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.handle_app_send(payload);
        self.collect();
    }

    /// Leave the overlay gracefully. Refused for the RP.
    pub fn leave(&mut self, now: Timestamp) -> Result<(), nicetree::Error> {
        self.inner.clock().set(now);
        let result = self.inner.leave();
        self.collect();
        result
    }

    /// Take all outgoing datagrams from the transport.
    pub fn take_outgoing(&self) -> Vec<Datagram> {
        self.inner.transport().take_sent()
    }

    /// Timer armings since the last call.
    pub fn take_armed_timers(&mut self) -> Vec<(TimerId, Timestamp)> {
        self.inner.drain_armed_timers()
    }

    /// Every protocol event emitted so far.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Every multicast payload delivered so far.
    pub fn delivered(&self) -> &[IncomingData] {
        &self.delivered
    }

    fn collect(&mut self) {
        while let Ok(event) = self.inner.events().try_receive() {
            self.events.push(event);
        }
        while let Ok(data) = self.inner.incoming().try_receive() {
            self.delivered.push(data);
        }
    }
}
