//! Scenario builder for setting up and running simulations.

use nicetree::{Duration, NodeId, Timestamp};

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::sim::Simulator;
use crate::topology::{Link, Topology};

/// Type of topology to generate.
#[derive(Debug, Clone)]
enum TopologyType {
    /// Every pair shares the default link.
    Uniform,
    /// Seeded positions in a unit square; delay grows with distance.
    Plane { max_delay: Duration },
    /// Custom topology provided by user.
    Custom(Topology),
}

/// An action that names nodes by their index in the scenario.
#[derive(Debug, Clone)]
enum PlannedAction {
    Leave(usize),
    Crash(usize),
    Partition(Vec<Vec<usize>>),
    Heal,
    LossRate(f64),
    Multicast(usize, Vec<u8>),
    Snapshot,
}

/// Builder for simulation scenarios.
pub struct ScenarioBuilder {
    /// Number of nodes to create.
    num_nodes: usize,
    /// RNG seed for determinism.
    seed: u64,
    topology_type: TopologyType,
    /// Global packet loss rate.
    loss_rate: f64,
    /// Base one-way link delay.
    delay: Duration,
    /// Gap between consecutive joins. Node 0 joins first and becomes the RP.
    join_interval: Duration,
    /// Scheduled actions.
    actions: Vec<(Timestamp, PlannedAction)>,
    /// Snapshot interval.
    snapshot_interval: Option<Duration>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// Create a new scenario with the specified number of nodes.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: TopologyType::Uniform,
            loss_rate: 0.0,
            delay: Duration::from_millis(10),
            join_interval: Duration::from_millis(200),
            actions: Vec::new(),
            snapshot_interval: None,
        }
    }

    /// Set the RNG seed for deterministic simulation.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set a custom network topology.
    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = TopologyType::Custom(topo);
        self
    }

    /// Use a uniform topology.
    pub fn uniform(mut self) -> Self {
        self.topology_type = TopologyType::Uniform;
        self
    }

    /// Place nodes on a plane so distances differ between pairs.
    pub fn plane(mut self, max_delay: Duration) -> Self {
        self.topology_type = TopologyType::Plane { max_delay };
        self
    }

    /// Set global packet loss rate.
    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set base link delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the gap between consecutive node joins.
    pub fn with_join_interval(mut self, interval: Duration) -> Self {
        self.join_interval = interval;
        self
    }

    /// Set snapshot interval for metrics collection.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Node `index` leaves gracefully at `time`.
    pub fn leave_at(mut self, time: Timestamp, index: usize) -> Self {
        self.actions.push((time, PlannedAction::Leave(index)));
        self
    }

    /// Node `index` crashes at `time`.
    pub fn crash_at(mut self, time: Timestamp, index: usize) -> Self {
        self.actions.push((time, PlannedAction::Crash(index)));
        self
    }

    /// Schedule a network partition at the specified time.
    pub fn partition_at(mut self, time: Timestamp, groups: Vec<Vec<usize>>) -> Self {
        self.actions.push((time, PlannedAction::Partition(groups)));
        self
    }

    /// Schedule partition healing at the specified time.
    pub fn heal_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, PlannedAction::Heal));
        self
    }

    /// Change the loss rate of every link at `time`.
    pub fn loss_rate_at(mut self, time: Timestamp, rate: f64) -> Self {
        self.actions.push((time, PlannedAction::LossRate(rate)));
        self
    }

    /// Node `index` multicasts `payload` at `time`.
    pub fn multicast_at(mut self, time: Timestamp, index: usize, payload: Vec<u8>) -> Self {
        self.actions.push((time, PlannedAction::Multicast(index, payload)));
        self
    }

    /// Schedule a snapshot at the specified time.
    pub fn snapshot_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, PlannedAction::Snapshot));
        self
    }

    /// Build the simulator with all nodes and topology.
    pub fn build(self) -> (Simulator, Vec<NodeId>) {
        let node_ids: Vec<NodeId> = (0..self.num_nodes).map(scenario_node_id).collect();

        let mut topo = match self.topology_type {
            TopologyType::Uniform => Topology::new(),
            TopologyType::Plane { max_delay } => Topology::plane(&node_ids, self.seed, max_delay),
            TopologyType::Custom(t) => t,
        };
        let base = topo.default_link().clone();
        topo = topo.with_default_link(Link {
            delay: self.delay,
            ..base
        });
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }

        let mut sim = Simulator::new(self.seed).with_topology(topo);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }

        let mut join_time = Timestamp::ZERO;
        for (i, id) in node_ids.iter().enumerate() {
            sim.add_node(*id, self.seed.wrapping_add(i as u64 * 1000));
            sim.schedule_action(join_time, ScenarioAction::Join { node: *id });
            join_time += self.join_interval;
        }

        let lookup = |i: usize| node_ids.get(i).copied();
        for (time, action) in self.actions {
            match action {
                PlannedAction::Leave(i) => {
                    if let Some(node) = lookup(i) {
                        sim.schedule_action(time, ScenarioAction::Leave { node });
                    }
                }
                PlannedAction::Crash(i) => {
                    if let Some(node) = lookup(i) {
                        sim.schedule_action(time, ScenarioAction::Crash { node });
                    }
                }
                PlannedAction::Partition(groups) => {
                    let groups = groups
                        .into_iter()
                        .map(|g| g.into_iter().filter_map(lookup).collect())
                        .collect();
                    sim.schedule_action(time, ScenarioAction::Partition { groups });
                }
                PlannedAction::Heal => sim.schedule_action(time, ScenarioAction::HealPartition),
                PlannedAction::LossRate(rate) => {
                    sim.schedule_action(time, ScenarioAction::SetLossRate { rate })
                }
                PlannedAction::Multicast(i, payload) => {
                    if let Some(from) = lookup(i) {
                        sim.schedule_multicast(time, from, payload);
                    }
                }
                PlannedAction::Snapshot => sim.schedule_action(time, ScenarioAction::TakeSnapshot),
            }
        }

        (sim, node_ids)
    }

    /// Build and run the simulation for the specified duration.
    pub fn run_for(self, duration: Duration) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_for(duration)
    }

    /// Build and run until the specified time.
    pub fn run_until(self, time: Timestamp) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_until(time)
    }
}

/// Address of the node at `index` in a scenario: 10.0.0.(index+1):5000.
pub fn scenario_node_id(index: usize) -> NodeId {
    NodeId::from_ipv4(0x0A00_0000 + index as u32 + 1, 5000)
}

/// Convenience function to create a simple N-node uniform scenario.
pub fn simple_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).uniform()
}
