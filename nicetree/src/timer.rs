//! Generation-checked timer slots.
//!
//! Each protocol timer is a slot holding a generation counter and an optional
//! deadline. Re-arming or cancelling a slot bumps its generation, so a firing
//! captured under an older generation is recognized as stale and ignored.
//!
//! Hosts that schedule callbacks themselves (the simulator) drain the armed
//! log to learn about new deadlines; hosts using `Node::run` poll
//! `next_deadline` instead.

use crate::time::Timestamp;

/// Protocol timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Heartbeat,
    Maintenance,
    Query,
    RpPoll,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Heartbeat,
        TimerKind::Maintenance,
        TimerKind::Query,
        TimerKind::RpPoll,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::Heartbeat => 0,
            TimerKind::Maintenance => 1,
            TimerKind::Query => 2,
            TimerKind::RpPoll => 3,
        }
    }
}

/// Identity of one arming of a timer slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    pub generation: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct TimerSlot {
    generation: u32,
    deadline: Option<Timestamp>,
}

/// The node's timer slots plus the log of armings not yet seen by the host.
#[derive(Debug, Default)]
pub struct Timers {
    slots: [TimerSlot; 4],
    armed: Vec<(TimerId, Timestamp)>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` for `deadline`, replacing any earlier arming.
    pub fn arm(&mut self, kind: TimerKind, deadline: Timestamp) -> TimerId {
        let slot = &mut self.slots[kind.slot()];
        slot.generation = slot.generation.wrapping_add(1);
        slot.deadline = Some(deadline);
        let id = TimerId {
            kind,
            generation: slot.generation,
        };
        // Older entries of the same kind are stale, keep the log bounded
        self.armed.retain(|(old, _)| old.kind != kind);
        self.armed.push((id, deadline));
        id
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        let slot = &mut self.slots[kind.slot()];
        slot.generation = slot.generation.wrapping_add(1);
        slot.deadline = None;
        self.armed.retain(|(old, _)| old.kind != kind);
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.slot()].deadline.is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Timestamp> {
        self.slots[kind.slot()].deadline
    }

    /// True if `id` is the live arming of its slot.
    pub fn is_current(&self, id: TimerId) -> bool {
        let slot = &self.slots[id.kind.slot()];
        slot.generation == id.generation && slot.deadline.is_some()
    }

    /// Consume a firing. Returns false for stale or cancelled ids.
    pub fn take(&mut self, id: TimerId) -> bool {
        if !self.is_current(id) {
            return false;
        }
        self.slots[id.kind.slot()].deadline = None;
        true
    }

    /// Live armings due at `now`, earliest first.
    pub fn due(&self, now: Timestamp) -> Vec<TimerId> {
        let mut due: Vec<(Timestamp, TimerId)> = TimerKind::ALL
            .iter()
            .filter_map(|kind| {
                let slot = &self.slots[kind.slot()];
                slot.deadline.filter(|d| *d <= now).map(|d| {
                    (
                        d,
                        TimerId {
                            kind: *kind,
                            generation: slot.generation,
                        },
                    )
                })
            })
            .collect();
        due.sort_by_key(|(d, _)| *d);
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.slots.iter().filter_map(|s| s.deadline).min()
    }

    /// Armings since the last drain.
    pub fn drain_armed(&mut self) -> Vec<(TimerId, Timestamp)> {
        core::mem::take(&mut self.armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rearm_makes_old_id_stale() {
        let mut timers = Timers::new();
        let first = timers.arm(TimerKind::Query, Timestamp::from_millis(100));
        let second = timers.arm(TimerKind::Query, Timestamp::from_millis(200));

        assert!(!timers.is_current(first));
        assert!(timers.is_current(second));
        assert!(!timers.take(first));
        assert!(timers.take(second));

        // A firing is consumed exactly once
        assert!(!timers.take(second));
        assert!(!timers.is_armed(TimerKind::Query));
    }

    #[test]
    fn test_cancel() {
        let mut timers = Timers::new();
        let id = timers.arm(TimerKind::RpPoll, Timestamp::from_millis(100));
        timers.cancel(TimerKind::RpPoll);
        assert!(!timers.take(id));
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.drain_armed().is_empty());
    }

    #[test]
    fn test_due_in_deadline_order() {
        let mut timers = Timers::new();
        timers.arm(TimerKind::Maintenance, Timestamp::from_millis(300));
        timers.arm(TimerKind::Heartbeat, Timestamp::from_millis(100));
        timers.arm(TimerKind::Query, Timestamp::from_millis(900));

        let due = timers.due(Timestamp::from_millis(500));
        let kinds: Vec<TimerKind> = due.iter().map(|id| id.kind).collect();
        assert_eq!(kinds, vec![TimerKind::Heartbeat, TimerKind::Maintenance]);
        assert_eq!(timers.next_deadline(), Some(Timestamp::from_millis(100)));
    }

    #[test]
    fn test_armed_log_keeps_latest_per_kind() {
        let mut timers = Timers::new();
        timers.arm(TimerKind::Heartbeat, Timestamp::from_millis(100));
        let latest = timers.arm(TimerKind::Heartbeat, Timestamp::from_millis(150));
        timers.arm(TimerKind::Maintenance, Timestamp::from_millis(200));

        let log = timers.drain_armed();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], (latest, Timestamp::from_millis(150)));
        assert!(timers.drain_armed().is_empty());
    }
}
