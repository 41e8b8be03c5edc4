//! Collaborator traits for transport, bootstrap, time, and randomness.
//!
//! The node never performs IO itself. It is handed:
//! - a `Transport` exposing an incoming and an outgoing datagram queue
//! - a `BootstrapOracle` locating the rendezvous point
//! - a `Clock` (real time or simulated time)
//! - a `Random` source used by the split heuristic

use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::time::Timestamp;
use crate::types::{Event, NodeId, Payload};

/// Queue size for transport channels.
///
/// A leader of several layers emits one heartbeat per member per layer in a
/// single event, so this is sized well above `MAX_LAYERS * (3k+1)` for k=3.
pub(crate) const TRANSPORT_QUEUE_SIZE: usize = 128;

/// Queue size for application-level channels.
pub(crate) const APP_QUEUE_SIZE: usize = 16;

/// Queue size for the event channel.
pub(crate) const EVENT_QUEUE_SIZE: usize = 32;

/// Mutex type used for channels.
pub(crate) type ChannelMutex = CriticalSectionRawMutex;

/// A datagram exchanged with a peer.
///
/// For incoming datagrams `peer` is the sender; for outgoing ones it is the
/// destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub peer: NodeId,
    pub data: Vec<u8>,
}

/// Incoming transport datagram channel type.
pub type TransportInChannel = Channel<ChannelMutex, Datagram, TRANSPORT_QUEUE_SIZE>;

/// Outgoing transport datagram channel type.
///
/// Sending is best-effort: when the queue is full the datagram is dropped.
pub type TransportOutChannel = Channel<ChannelMutex, Datagram, TRANSPORT_QUEUE_SIZE>;

/// Multicast data delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingData {
    /// Node that originated the multicast.
    pub origin: NodeId,
    pub payload: Payload,
}

/// Application-level incoming data channel.
pub type AppInChannel = Channel<ChannelMutex, IncomingData, APP_QUEUE_SIZE>;

/// Application-level outgoing channel: payloads to multicast to the group.
pub type AppOutChannel = Channel<ChannelMutex, Payload, APP_QUEUE_SIZE>;

/// Protocol event channel.
pub type EventChannel = Channel<ChannelMutex, Event, EVENT_QUEUE_SIZE>;

/// Datagram transport.
///
/// Delivery is unordered and unreliable; the protocol tolerates both.
pub trait Transport {
    /// Queue drained by the host's transmit task.
    fn outgoing(&self) -> &TransportOutChannel;

    /// Queue filled by the host's receive task.
    fn incoming(&self) -> &TransportInChannel;
}

/// Well-known registry used once, during bootstrap, to find the RP.
pub trait BootstrapOracle {
    /// A registered node, if any. The first node to bootstrap finds none.
    fn get_node(&self) -> Option<NodeId>;

    /// Register a node as a bootstrap candidate.
    fn register_node(&self, node: NodeId);

    /// Remove a node from the registry.
    fn remove_node(&self, node: NodeId);
}

/// Time source.
///
/// Implementations might use:
/// - Real hardware time (embassy_time, std::time)
/// - Simulated time (for testing)
pub trait Clock {
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    /// Current monotonic time.
    fn now(&self) -> Timestamp;

    /// Sleep until the given time.
    fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_>;
}

/// Random number source.
pub trait Random {
    /// Uniform value in `[min, max)`. Returns `min` when the range is empty.
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    /// Uniform index into a collection of `len` elements.
    fn gen_index(&mut self, len: usize) -> usize {
        self.gen_range(0, len as u64) as usize
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and doc tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use core::cell::{Cell, RefCell};
    use core::future::{ready, Ready};
    use std::rc::Rc;

    use super::*;

    /// Mock transport backed by the real channel types.
    pub struct MockTransport {
        outgoing: TransportOutChannel,
        incoming: TransportInChannel,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self {
                outgoing: Channel::new(),
                incoming: Channel::new(),
            }
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Inject a datagram as if it was received (for testing).
        pub fn inject_rx(&self, from: NodeId, data: Vec<u8>) {
            let _ = self.incoming.try_send(Datagram { peer: from, data });
        }

        /// Take all sent datagrams in send order (for testing).
        pub fn take_sent(&self) -> Vec<Datagram> {
            let mut msgs = Vec::new();
            while let Ok(msg) = self.outgoing.try_receive() {
                msgs.push(msg);
            }
            msgs
        }
    }

    impl Transport for MockTransport {
        fn outgoing(&self) -> &TransportOutChannel {
            &self.outgoing
        }

        fn incoming(&self) -> &TransportInChannel {
            &self.incoming
        }
    }

    /// Mock clock for testing (synchronous, time advances manually).
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self {
                current: Cell::new(Timestamp::ZERO),
            }
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(time: Timestamp) -> Self {
            Self {
                current: Cell::new(time),
            }
        }

        /// Jump to the given timestamp.
        pub fn set(&self, time: Timestamp) {
            self.current.set(time);
        }

        /// Advance time by the given duration.
        pub fn advance(&self, duration: crate::time::Duration) {
            self.current.set(self.current.get() + duration);
        }
    }

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Timestamp {
            self.current.get()
        }

        fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
            // In synchronous tests, sleep completes immediately.
            ready(())
        }
    }

    /// Mock random for testing (deterministic).
    pub struct MockRandom {
        pub state: u64,
    }

    impl Default for MockRandom {
        fn default() -> Self {
            Self { state: 12345 }
        }
    }

    impl MockRandom {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_seed(seed: u64) -> Self {
            Self { state: seed }
        }
    }

    impl Random for MockRandom {
        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            // Simple LCG
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            if max <= min {
                return min;
            }
            min + (self.state % (max - min))
        }
    }

    /// Shared in-memory bootstrap registry.
    ///
    /// Clones share the same registry, so several nodes in one test see each
    /// other's registrations.
    #[derive(Clone, Default)]
    pub struct MockOracle {
        nodes: Rc<RefCell<Vec<NodeId>>>,
    }

    impl MockOracle {
        pub fn new() -> Self {
            Self::default()
        }

        /// Registry pre-seeded with an existing RP.
        pub fn with_node(node: NodeId) -> Self {
            let oracle = Self::default();
            oracle.register_node(node);
            oracle
        }

        /// Snapshot of the registered nodes.
        pub fn nodes(&self) -> Vec<NodeId> {
            self.nodes.borrow().clone()
        }
    }

    impl BootstrapOracle for MockOracle {
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
}
