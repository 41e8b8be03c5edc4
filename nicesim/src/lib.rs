//! nicesim - Discrete event simulator for the nicetree overlay protocol.
//!
//! Runs many nicetree nodes in one process without real-time delays. Every
//! run is deterministic for a given seed.
//!
//! # Features
//!
//! - **Discrete event simulation**: events ordered by (time, sequence number)
//! - **Latency model**: uniform links or seeded positions on a plane
//! - **Faults**: packet loss, partitions, crashes, graceful departures
//! - **Scenario builder**: staggered joins and scheduled actions by node index
//! - **Metrics**: hierarchy snapshots, datagram counts, summed node counters
//!
//! # Example
//!
//! ```
//! use nicesim::{Duration, ScenarioBuilder};
//!
//! let result = ScenarioBuilder::new(4)
//!     .with_seed(42)
//!     .run_for(Duration::from_secs(10));
//!
//! assert!(result.stable());
//! ```
//!
//! # Architecture
//!
//! The main loop pops the next event, advances simulation time and calls the
//! node's synchronous handlers (`handle_transport_rx`, `fire_timer`,
//! `handle_app_send`) instead of its async `run()` loop. Afterwards the node's
//! outgoing datagrams are routed through the topology and its newly armed
//! timers are scheduled as events.

pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use metrics::{HierarchySnapshot, NodeView, SimMetrics, SimulationResult};
pub use nicetree::{Duration, NodeId, Timestamp};
pub use node::SimNode;
pub use scenario::{scenario_node_id, simple_scenario, ScenarioBuilder};
pub use sim::Simulator;
pub use topology::{Link, Topology};

/// Send protocol logs to the test writer, filtered by `RUST_LOG`.
///
/// Safe to call repeatedly; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
