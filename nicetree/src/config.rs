//! Compile-time protocol configuration.
//!
//! The `NiceConfig` trait carries the tunables of the protocol as associated
//! constants. Every constant has a default, so a custom configuration only
//! overrides what differs.
//!
//! # Example
//!
//! ```ignore
//! use nicetree::{Node, NiceConfig, DefaultConfig, FastConfig};
//!
//! // Wide-area deployment (default)
//! let node = Node::<_, _, _, _, DefaultConfig>::new(id, transport, oracle, random, clock);
//!
//! // Custom configuration
//! struct LargeClusters;
//! impl NiceConfig for LargeClusters {
//!     const K: usize = 5;
//! }
//! ```

use crate::time::Duration;

/// Protocol tunables.
///
/// Percentages are expressed in percent (10.0 = 10%).
pub trait NiceConfig {
    /// Cluster size parameter: clusters hold between `K` and `3K+1` members.
    const K: usize = 3;

    /// Interval between heartbeat rounds.
    const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

    /// Interval between maintenance passes.
    const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

    /// Query timeout before retrying.
    const QUERY_INTERVAL: Duration = Duration::from_secs(2);

    /// Interval for re-polling an unresponsive RP.
    const RP_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// Heartbeat intervals of silence before a peer is pronounced dead.
    const PEER_TIMEOUT_HEARTBEATS: u64 = 3;

    /// Forward misdirected requests to the proper leader and send heartbeats
    /// right after structural changes.
    const ENHANCED_MODE: bool = true;

    /// Minimum gain of a new leader, relative to the mean cluster distance.
    const CLUSTER_LEADER_BOUND: f64 = 10.0;

    /// Discount applied to the current leader's max distance before comparing.
    const CLUSTER_LEADER_COMPARE_DIST: f64 = 10.0;

    /// Discount applied to the current supercluster leader's distance.
    const SC_PROC_DISTANCE: f64 = 10.0;

    /// Minimum gain of a new supercluster leader, relative to the mean distance.
    const SC_MIN_OFFSET: f64 = 10.0;

    /// Upper bound on cluster size before a split.
    fn max_cluster_size() -> usize {
        3 * Self::K + 1
    }

    /// Silence after which a peer is dropped.
    fn peer_timeout() -> Duration {
        Self::HEARTBEAT_INTERVAL * Self::PEER_TIMEOUT_HEARTBEATS
    }
}

/// Wide-area defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl NiceConfig for DefaultConfig {}

/// Intervals scaled down 10x for LAN deployments and simulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastConfig;

impl NiceConfig for FastConfig {
    const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
    const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(1000);
    const QUERY_INTERVAL: Duration = Duration::from_millis(200);
    const RP_POLL_INTERVAL: Duration = Duration::from_millis(500);
}
