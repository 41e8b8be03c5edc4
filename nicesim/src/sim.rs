//! Discrete event simulator for nicetree overlays.

use std::collections::BinaryHeap;

use hashbrown::HashMap;
use nicetree::{Duration, NodeId, Timestamp};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{total_node_metrics, HierarchySnapshot, NodeView, SimMetrics, SimulationResult};
use crate::node::{SimNode, SimOracle};
use crate::topology::Topology;

/// Discrete event simulator for nicetree overlays.
pub struct Simulator {
    /// All live nodes in the simulation.
    nodes: HashMap<NodeId, SimNode>,
    /// Bootstrap registry shared by all nodes.
    oracle: SimOracle,
    /// Network topology.
    topology: Topology,
    /// Current simulation time.
    current_time: Timestamp,
    /// Priority queue of scheduled events.
    event_queue: BinaryHeap<ScheduledEvent>,
    /// Collected metrics.
    metrics: SimMetrics,
    /// Next sequence number for event ordering.
    next_seq: u64,
    /// RNG for packet loss.
    rng: SmallRng,
    /// Interval for automatic snapshots.
    snapshot_interval: Option<Duration>,
    /// Next snapshot time.
    next_snapshot: Option<Timestamp>,
}

impl Simulator {
    /// Create a new simulator with given RNG seed.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            oracle: SimOracle::new(),
            topology: Topology::new(),
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng: SmallRng::seed_from_u64(seed),
            snapshot_interval: None,
            next_snapshot: None,
        }
    }

    /// Set the network topology.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the snapshot interval for automatic hierarchy recording.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.current_time + interval);
        self
    }

    /// Add a node in INIT. It joins once a `Join` action fires.
    pub fn add_node(&mut self, id: NodeId, seed: u64) -> NodeId {
        let node = SimNode::new(id, self.oracle.clone(), seed, self.current_time);
        self.nodes.insert(id, node);
        id
    }

    /// Get a reference to a node.
    pub fn node(&self, id: &NodeId) -> Option<&SimNode> {
        self.nodes.get(id)
    }

    /// Get a mutable reference to a node.
    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut SimNode> {
        self.nodes.get_mut(id)
    }

    /// Get all live node IDs, sorted.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Get the current simulation time.
    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    /// Get the topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Get mutable topology.
    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    /// Get collected metrics.
    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    /// Schedule an event.
    pub fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    /// Schedule a scenario action.
    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    /// Schedule an application multicast.
    pub fn schedule_multicast(&mut self, time: Timestamp, from: NodeId, payload: Vec<u8>) {
        self.schedule(time, Event::AppSend { from, payload });
    }

    /// Run simulation until specified time.
    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while self.event_queue.peek().is_some_and(|e| e.time <= end_time) {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
            self.maybe_take_snapshot();
        }

        // Advance to end_time even if no more events
        self.advance_time(end_time);
        self.take_snapshot();
        self.result()
    }

    /// Run simulation for specified duration.
    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    fn result(&self) -> SimulationResult {
        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            node_totals: total_node_metrics(self.nodes.values().map(|n| n.inner().metrics())),
            queue_exhausted: self.event_queue.is_empty(),
        }
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        let now = self.current_time;
        match event {
            Event::MessageDelivery { to, from, data } => {
                let Some(node) = self.nodes.get_mut(&to) else {
                    trace!(%from, %to, "receiver gone");
                    self.metrics.messages_dropped += 1;
                    return;
                };
                node.handle_transport_rx(&data, now);
                self.metrics.messages_delivered += 1;
                self.flush(to);
            }
            Event::TimerFire { node, timer } => {
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.fire_timer(timer, now);
                    self.metrics.timer_fires += 1;
                    self.flush(node);
                }
            }
            Event::AppSend { from, payload } => {
                if let Some(n) = self.nodes.get_mut(&from) {
                    n.app_send(payload, now);
                    self.flush(from);
                }
            }
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    /// Route a node's outgoing datagrams and schedule its new timers.
    fn flush(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let outgoing = node.take_outgoing();
        let timers = node.take_armed_timers();

        let now = self.current_time;
        for (timer, deadline) in timers {
            self.schedule(deadline.max(now), Event::TimerFire { node: id, timer });
        }
        for datagram in outgoing {
            self.route_message(id, datagram.peer, datagram.data);
        }
    }

    /// Schedule delivery of one datagram over the topology.
    fn route_message(&mut self, from: NodeId, to: NodeId, data: Vec<u8>) {
        self.metrics.messages_sent += 1;
        if !self.topology.is_connected(from, to) {
            self.metrics.messages_dropped += 1;
            return;
        }
        let link = self.topology.link(from, to);
        if link.loss_rate > 0.0 && self.rng.gen::<f64>() < link.loss_rate {
            self.metrics.messages_dropped += 1;
            return;
        }
        let at = self.current_time + link.delay;
        self.schedule(at, Event::MessageDelivery { to, from, data });
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        let now = self.current_time;
        match action {
            ScenarioAction::Join { node } => {
                if let Some(n) = self.nodes.get_mut(&node) {
                    debug!(%node, "joining");
                    n.bootstrap(now);
                    self.flush(node);
                }
            }
            ScenarioAction::Leave { node } => {
                let Some(n) = self.nodes.get_mut(&node) else {
                    return;
                };
                match n.leave(now) {
                    Ok(()) => {
                        debug!(%node, "leaving");
                        self.flush(node);
                        self.nodes.remove(&node);
                    }
                    Err(err) => warn!(%node, %err, "leave refused"),
                }
            }
            ScenarioAction::Crash { node } => {
                debug!(%node, "crashing");
                self.nodes.remove(&node);
            }
            ScenarioAction::Partition { groups } => self.topology.partition(&groups),
            ScenarioAction::HealPartition => self.topology.heal(),
            ScenarioAction::SetLossRate { rate } => self.topology.set_global_loss_rate(rate),
            ScenarioAction::TakeSnapshot => self.take_snapshot(),
        }
    }

    fn maybe_take_snapshot(&mut self) {
        if let Some(next) = self.next_snapshot {
            if self.current_time >= next {
                self.take_snapshot();
                if let Some(interval) = self.snapshot_interval {
                    self.next_snapshot = Some(next + interval);
                }
            }
        }
    }

    /// Take a hierarchy snapshot of every live node.
    pub fn take_snapshot(&mut self) {
        let mut snapshot = HierarchySnapshot::new(self.current_time);
        for (id, node) in &self.nodes {
            snapshot.record_node(
                *id,
                NodeView {
                    state: node.state(),
                    is_rp: node.is_rendezvous_point(),
                    highest_layer: node.highest_layer(),
                    cluster_leader: node.cluster_leader(),
                    cluster_size: node.cluster_size(),
                },
            );
        }
        self.metrics.add_snapshot(snapshot);
    }
}
