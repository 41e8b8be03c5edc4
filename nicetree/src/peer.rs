//! Peer directory: per-peer distance and heartbeat bookkeeping.
//!
//! The directory exclusively owns every `PeerInfo`. Other components keep
//! only `NodeId`s and look records up on demand, so purging a peer never
//! leaves a dangling reference behind.

use hashbrown::HashMap;

use crate::time::{Duration, Timestamp};
use crate::types::{Distance, NodeId, EMA_WEIGHT};

/// State tracked for one remote peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Smoothed round-trip estimate, `None` until the first sample.
    distance: Option<Distance>,
    last_sent_hb: u32,
    last_recv_hb: u32,
    /// Two most recent (seq, sent_at) pairs; `pending_slot` points at the older one.
    pending: [Option<(u32, Timestamp)>; 2],
    pending_slot: usize,
    /// When the peer's last heartbeat arrived.
    last_hb_arrival: Option<Timestamp>,
    /// Last time anything was received from the peer.
    activity: Timestamp,
    /// Size of the peer's own cluster one layer down.
    sublayer_members: u32,
    /// Distances the peer reported to its own neighbors.
    neighbor_distances: HashMap<NodeId, Distance>,
    /// Start of an outstanding ping probe.
    probe_start: Option<Timestamp>,
}

impl PeerInfo {
    pub fn new(now: Timestamp) -> Self {
        Self {
            distance: None,
            last_sent_hb: 0,
            last_recv_hb: 0,
            pending: [None; 2],
            pending_slot: 0,
            last_hb_arrival: None,
            activity: now,
            sublayer_members: 0,
            neighbor_distances: HashMap::new(),
            probe_start: None,
        }
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.activity = now;
    }

    pub fn activity(&self) -> Timestamp {
        self.activity
    }

    pub fn distance(&self) -> Option<Distance> {
        self.distance
    }

    pub fn set_distance(&mut self, distance: Distance) {
        self.distance = Some(distance);
    }

    /// Allocate the next heartbeat sequence number and remember when it left.
    pub fn record_heartbeat_sent(&mut self, now: Timestamp) -> u32 {
        self.last_sent_hb = self.last_sent_hb.wrapping_add(1);
        self.pending[self.pending_slot] = Some((self.last_sent_hb, now));
        self.pending_slot ^= 1;
        self.last_sent_hb
    }

    /// Send time of a still-pending heartbeat.
    pub fn pending_sent_at(&self, seq: u32) -> Option<Timestamp> {
        self.pending
            .iter()
            .flatten()
            .find(|(s, _)| *s == seq)
            .map(|(_, at)| *at)
    }

    /// Fold a heartbeat answer into the distance estimate.
    ///
    /// `acked_seq` is the sequence number the peer echoes back and
    /// `reported_delay` the time it held our heartbeat before answering.
    /// Returns the new sample when one was taken.
    pub fn record_heartbeat_received(
        &mut self,
        seq_no: u32,
        acked_seq: u32,
        reported_delay: Duration,
        now: Timestamp,
    ) -> Option<Distance> {
        self.last_hb_arrival = Some(now);
        self.last_recv_hb = seq_no;

        let sent_at = self.pending_sent_at(acked_seq)?;
        let round_trip = (now - sent_at).as_millis_f64() - reported_delay.as_millis_f64();
        if round_trip < 0.0 {
            return None;
        }
        let sample = round_trip / 2.0;
        self.distance = Some(match self.distance {
            Some(old) if old > 0.0 => EMA_WEIGHT * sample + (1.0 - EMA_WEIGHT) * old,
            _ => sample,
        });
        Some(sample)
    }

    pub fn last_recv_hb(&self) -> u32 {
        self.last_recv_hb
    }

    /// How long we have been holding the peer's last heartbeat.
    pub fn heartbeat_delay(&self, now: Timestamp) -> Duration {
        self.last_hb_arrival
            .map_or(Duration::ZERO, |arrival| now - arrival)
    }

    pub fn sublayer_members(&self) -> u32 {
        self.sublayer_members
    }

    pub fn set_sublayer_members(&mut self, count: u32) {
        self.sublayer_members = count;
    }

    /// Distance the peer reported to `node`.
    pub fn distance_to(&self, node: &NodeId) -> Option<Distance> {
        self.neighbor_distances.get(node).copied()
    }

    /// Record a distance the peer reported. An unknown report forgets the old value.
    pub fn update_neighbor_distance(&mut self, node: NodeId, distance: Option<Distance>) {
        match distance {
            Some(d) if d >= 0.0 => {
                self.neighbor_distances.insert(node, d);
            }
            _ => {
                self.neighbor_distances.remove(&node);
            }
        }
    }

    pub fn probe_start(&self) -> Option<Timestamp> {
        self.probe_start
    }

    pub fn set_probe_start(&mut self, at: Timestamp) {
        self.probe_start = Some(at);
    }
}

/// All peers known to the local node.
#[derive(Debug)]
pub struct PeerDirectory {
    local: NodeId,
    peers: HashMap<NodeId, PeerInfo>,
}

impl PeerDirectory {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn get(&self, node: &NodeId) -> Option<&PeerInfo> {
        self.peers.get(node)
    }

    pub fn get_mut(&mut self, node: &NodeId) -> Option<&mut PeerInfo> {
        self.peers.get_mut(node)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.peers.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Record for `node`, created on first reference. Never creates one for
    /// the local node.
    pub fn ensure(&mut self, node: NodeId, now: Timestamp) -> Option<&mut PeerInfo> {
        if node == self.local || node.is_unspecified() {
            return None;
        }
        Some(self.peers.entry(node).or_insert_with(|| PeerInfo::new(now)))
    }

    /// Update `lastActivity` of a known peer.
    pub fn touch(&mut self, node: &NodeId, now: Timestamp) {
        if let Some(info) = self.peers.get_mut(node) {
            info.touch(now);
        }
    }

    /// Touch a peer, creating its record if needed.
    pub fn touch_or_insert(&mut self, node: NodeId, now: Timestamp) {
        if let Some(info) = self.ensure(node, now) {
            info.touch(now);
        }
    }

    pub fn remove(&mut self, node: &NodeId) -> Option<PeerInfo> {
        self.peers.remove(node)
    }

    /// Direct distance estimate; zero for the local node.
    pub fn distance(&self, node: &NodeId) -> Option<Distance> {
        if *node == self.local {
            return Some(0.0);
        }
        self.peers.get(node).and_then(PeerInfo::distance)
    }

    /// Remove every peer silent since before `now - timeout`, in id order.
    pub fn expire(&mut self, now: Timestamp, timeout: Duration) -> Vec<NodeId> {
        let mut dead: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, info)| now > info.activity() + timeout)
            .map(|(id, _)| *id)
            .collect();
        dead.sort();
        for id in &dead {
            self.peers.remove(id);
        }
        dead
    }

    pub fn iter(&self) -> hashbrown::hash_map::Iter<'_, NodeId, PeerInfo> {
        self.peers.iter()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn node(n: u32) -> NodeId {
        NodeId::from_ipv4(n, 1024)
    }

    #[test]
    fn test_first_sample_sets_distance() {
        let mut info = PeerInfo::new(Timestamp::ZERO);
        let seq = info.record_heartbeat_sent(Timestamp::from_millis(1000));

        // Round trip of 100ms, 20ms of which the peer held our heartbeat
        let sample = info.record_heartbeat_received(
            1,
            seq,
            Duration::from_millis(20),
            Timestamp::from_millis(1100),
        );
        assert_eq!(sample, Some(40.0));
        assert_eq!(info.distance(), Some(40.0));
        assert_eq!(info.last_recv_hb(), 1);
    }

    #[test]
    fn test_ema_update() {
        let mut info = PeerInfo::new(Timestamp::ZERO);
        info.set_distance(100.0);
        let seq = info.record_heartbeat_sent(Timestamp::ZERO);
        info.record_heartbeat_received(1, seq, Duration::ZERO, Timestamp::from_millis(400));

        // 0.1 * 200 + 0.9 * 100
        let d = info.distance().unwrap();
        assert!((d - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_sequence_ignored() {
        let mut info = PeerInfo::new(Timestamp::ZERO);
        info.record_heartbeat_sent(Timestamp::ZERO);
        let sample =
            info.record_heartbeat_received(1, 99, Duration::ZERO, Timestamp::from_millis(50));
        assert_eq!(sample, None);
        assert_eq!(info.distance(), None);
    }

    #[test]
    fn test_pending_ring_keeps_two_rounds() {
        let mut info = PeerInfo::new(Timestamp::ZERO);
        let s1 = info.record_heartbeat_sent(Timestamp::from_millis(0));
        let s2 = info.record_heartbeat_sent(Timestamp::from_millis(10));
        assert_eq!(info.pending_sent_at(s1), Some(Timestamp::from_millis(0)));
        assert_eq!(info.pending_sent_at(s2), Some(Timestamp::from_millis(10)));

        // Third round evicts the oldest
        let s3 = info.record_heartbeat_sent(Timestamp::from_millis(20));
        assert_eq!(info.pending_sent_at(s1), None);
        assert_eq!(info.pending_sent_at(s2), Some(Timestamp::from_millis(10)));
        assert_eq!(info.pending_sent_at(s3), Some(Timestamp::from_millis(20)));
    }

    #[test]
    fn test_out_of_order_answer_matches() {
        let mut info = PeerInfo::new(Timestamp::ZERO);
        let s1 = info.record_heartbeat_sent(Timestamp::from_millis(0));
        let _s2 = info.record_heartbeat_sent(Timestamp::from_millis(500));

        // Answer to the older round arrives after the newer one left
        let sample =
            info.record_heartbeat_received(1, s1, Duration::ZERO, Timestamp::from_millis(600));
        assert_eq!(sample, Some(300.0));
    }

    #[test]
    fn test_negative_round_trip_discarded() {
        let mut info = PeerInfo::new(Timestamp::ZERO);
        let seq = info.record_heartbeat_sent(Timestamp::from_millis(100));
        let sample = info.record_heartbeat_received(
            1,
            seq,
            Duration::from_millis(500),
            Timestamp::from_millis(200),
        );
        assert_eq!(sample, None);
        assert_eq!(info.distance(), None);
    }

    #[test]
    fn test_heartbeat_delay() {
        let mut info = PeerInfo::new(Timestamp::ZERO);
        assert_eq!(info.heartbeat_delay(Timestamp::from_millis(70)), Duration::ZERO);
        info.record_heartbeat_received(1, 0, Duration::ZERO, Timestamp::from_millis(30));
        assert_eq!(
            info.heartbeat_delay(Timestamp::from_millis(70)),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn test_directory_never_tracks_local() {
        let mut dir = PeerDirectory::new(node(1));
        assert!(dir.ensure(node(1), Timestamp::ZERO).is_none());
        assert!(dir.ensure(NodeId::UNSPECIFIED, Timestamp::ZERO).is_none());
        assert!(dir.ensure(node(2), Timestamp::ZERO).is_some());
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.distance(&node(1)), Some(0.0));
        assert_eq!(dir.distance(&node(2)), None);
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let mut dir = PeerDirectory::new(node(1));
        if let Some(peer) = dir.ensure(node(2), Timestamp::ZERO) {
            peer.set_distance(12.0);
        }
        dir.ensure(node(2), Timestamp::from_secs(1));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.distance(&node(2)), Some(12.0));
    }

    #[test]
    fn test_expire() {
        let mut dir = PeerDirectory::new(node(1));
        dir.touch_or_insert(node(2), Timestamp::from_secs(0));
        dir.touch_or_insert(node(3), Timestamp::from_secs(10));

        let dead = dir.expire(Timestamp::from_secs(16), Duration::from_secs(15));
        assert_eq!(dead, vec![node(2)]);
        assert!(!dir.contains(&node(2)));
        assert!(dir.contains(&node(3)));
    }

    #[test]
    fn test_neighbor_distances() {
        let mut info = PeerInfo::new(Timestamp::ZERO);
        info.update_neighbor_distance(node(5), Some(12.5));
        info.update_neighbor_distance(node(6), None);
        info.update_neighbor_distance(node(7), Some(-1.0));
        assert_eq!(info.distance_to(&node(5)), Some(12.5));
        assert_eq!(info.distance_to(&node(6)), None);
        assert_eq!(info.distance_to(&node(7)), None);

        // A later unknown report clears the stale value
        info.update_neighbor_distance(node(5), None);
        assert_eq!(info.distance_to(&node(5)), None);
    }

    proptest! {
        /// With a constant one-way delay and no jitter the estimate converges
        /// geometrically (factor 0.9) to the true delay.
        #[test]
        fn prop_ema_converges(initial in 1.0f64..2000.0, delay in 1u64..500, hold in 0u64..100) {
            let mut info = PeerInfo::new(Timestamp::ZERO);
            info.set_distance(initial);
            let mut now = Timestamp::ZERO;
            let target = delay as f64;

            for round in 0..120u32 {
                let seq = info.record_heartbeat_sent(now);
                now += Duration::from_millis(2 * delay + hold);
                info.record_heartbeat_received(round + 1, seq, Duration::from_millis(hold), now);
                now += Duration::from_millis(1000);
            }

            let err = (info.distance().unwrap() - target).abs();
            let bound = (initial - target).abs() * 0.9f64.powi(120) + 1e-6;
            prop_assert!(err <= bound, "err {} bound {}", err, bound);
        }
    }
}
