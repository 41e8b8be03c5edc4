//! Distance estimator: graph-center and aggregate distance helpers.
//!
//! The local node measures its own distances directly (heartbeat round
//! trips); for every other pair it relies on the distance tables peers
//! report in their heartbeats. [`DistanceView`] abstracts that lookup so the
//! helpers below work over any member list.

use crate::peer::PeerDirectory;
use crate::traits::Random;
use crate::types::{Distance, NodeId};

/// Pairwise distance lookup as known to the local node.
pub trait DistanceView {
    /// Distance from `from` to `to`, if known.
    fn pairwise(&self, from: &NodeId, to: &NodeId) -> Option<Distance>;

    /// The local node, whose distances are measured rather than reported.
    fn local(&self) -> NodeId;
}

impl DistanceView for PeerDirectory {
    fn pairwise(&self, from: &NodeId, to: &NodeId) -> Option<Distance> {
        if from == to {
            return Some(0.0);
        }
        if *from == self.local() {
            return self.distance(to);
        }
        self.get(from).and_then(|info| info.distance_to(to))
    }

    fn local(&self) -> NodeId {
        PeerDirectory::local(self)
    }
}

/// Largest known distance from `member` to any node of `set` (0 if none known).
pub fn max_distance<V: DistanceView + ?Sized>(view: &V, member: &NodeId, set: &[NodeId]) -> Distance {
    set.iter()
        .filter_map(|other| view.pairwise(member, other))
        .fold(0.0, f64::max)
}

/// Mean of the local node's positive distances to the members of `set`.
pub fn mean_distance<V: DistanceView + ?Sized>(view: &V, set: &[NodeId]) -> Distance {
    let local = view.local();
    let (sum, count) = set
        .iter()
        .filter(|n| **n != local)
        .filter_map(|n| view.pairwise(&local, n))
        .filter(|d| *d > 0.0)
        .fold((0.0, 0u32), |(sum, count), d| (sum + d, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Member minimizing its maximum distance to the rest, among members with a
/// positive known maximum.
fn minimax<V: DistanceView + ?Sized>(view: &V, members: &[NodeId]) -> Option<(NodeId, Distance)> {
    let mut best: Option<(NodeId, Distance)> = None;
    for member in members {
        let d = max_distance(view, member, members);
        if d > 0.0 && best.map_or(true, |(_, min)| d < min) {
            best = Some((*member, d));
        }
    }
    best
}

/// Graph center of `members`, falling back to the first member when no
/// distances are known. `None` only for an empty set.
pub fn find_center<V: DistanceView + ?Sized>(
    view: &V,
    members: &[NodeId],
) -> Option<(NodeId, Distance)> {
    minimax(view, members).or_else(|| members.first().map(|m| (*m, 0.0)))
}

/// Like [`find_center`], but picks an arbitrary member when no distances are
/// known. Used for sets too large to evaluate exhaustively.
pub fn find_center_or_random<V, R>(
    view: &V,
    members: &[NodeId],
    random: &mut R,
) -> Option<(NodeId, Distance)>
where
    V: DistanceView + ?Sized,
    R: Random + ?Sized,
{
    if members.is_empty() {
        return None;
    }
    minimax(view, members).or_else(|| Some((members[random.gen_index(members.len())], 0.0)))
}

/// True when every member's distance from the local node and every pairwise
/// distance reported by the other members is known.
pub fn all_distances_known<V: DistanceView + ?Sized>(view: &V, members: &[NodeId]) -> bool {
    let local = view.local();
    members.iter().all(|m| {
        view.pairwise(&local, m).is_some()
            && (*m == local || members.iter().all(|other| view.pairwise(m, other).is_some()))
    })
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;
    use proptest::prelude::*;

    use super::*;
    use crate::time::Timestamp;
    use crate::traits::test_impls::MockRandom;

    fn node(n: u32) -> NodeId {
        NodeId::from_ipv4(n, 1024)
    }

    /// Symmetric distance matrix over nodes 0..n, local node is node(0).
    struct Matrix {
        d: HashMap<(NodeId, NodeId), Distance>,
    }

    impl Matrix {
        fn new(rows: &[Vec<f64>]) -> Self {
            let mut d = HashMap::new();
            for (i, row) in rows.iter().enumerate() {
                for (j, v) in row.iter().enumerate() {
                    if *v >= 0.0 {
                        d.insert((node(i as u32), node(j as u32)), *v);
                    }
                }
            }
            Self { d }
        }
    }

    impl DistanceView for Matrix {
        fn pairwise(&self, from: &NodeId, to: &NodeId) -> Option<Distance> {
            if from == to {
                return Some(0.0);
            }
            self.d.get(&(*from, *to)).copied()
        }

        fn local(&self) -> NodeId {
            node(0)
        }
    }

    #[test]
    fn test_find_center_minimax() {
        // node(1) sits in the middle of a line 0 - 1 - 2
        let m = Matrix::new(&[
            vec![0.0, 10.0, 20.0],
            vec![10.0, 0.0, 10.0],
            vec![20.0, 10.0, 0.0],
        ]);
        let members = [node(0), node(1), node(2)];
        assert_eq!(find_center(&m, &members), Some((node(1), 10.0)));
    }

    #[test]
    fn test_find_center_without_knowledge() {
        let m = Matrix::new(&[]);
        let members = [node(3), node(4)];
        assert_eq!(find_center(&m, &members), Some((node(3), 0.0)));
        assert_eq!(find_center(&m, &[]), None);

        let mut rng = MockRandom::new();
        let (picked, _) = find_center_or_random(&m, &members, &mut rng).unwrap();
        assert!(members.contains(&picked));
        assert_eq!(find_center_or_random(&m, &[], &mut rng), None);
    }

    #[test]
    fn test_mean_distance_skips_unknown_and_self() {
        let m = Matrix::new(&[vec![0.0, 10.0, 30.0, -1.0]]);
        let members = [node(0), node(1), node(2), node(3)];
        assert_eq!(mean_distance(&m, &members), 20.0);
        assert_eq!(mean_distance(&m, &[node(0)]), 0.0);
    }

    #[test]
    fn test_max_distance_unknown_is_zero() {
        let m = Matrix::new(&[]);
        assert_eq!(max_distance(&m, &node(1), &[node(2), node(3)]), 0.0);
    }

    #[test]
    fn test_all_distances_known() {
        let full = Matrix::new(&[
            vec![0.0, 5.0, 7.0],
            vec![5.0, 0.0, 3.0],
            vec![7.0, 3.0, 0.0],
        ]);
        let members = [node(0), node(1), node(2)];
        assert!(all_distances_known(&full, &members));

        let partial = Matrix::new(&[
            vec![0.0, 5.0, 7.0],
            vec![5.0, 0.0, -1.0],
            vec![7.0, 3.0, 0.0],
        ]);
        assert!(!all_distances_known(&partial, &members));
    }

    #[test]
    fn test_directory_view() {
        let mut dir = PeerDirectory::new(node(0));
        let now = Timestamp::ZERO;
        if let Some(p) = dir.ensure(node(1), now) {
            p.set_distance(8.0);
            p.update_neighbor_distance(node(2), Some(4.0));
        }

        assert_eq!(dir.pairwise(&node(0), &node(1)), Some(8.0));
        assert_eq!(dir.pairwise(&node(1), &node(2)), Some(4.0));
        assert_eq!(dir.pairwise(&node(2), &node(1)), None);
        assert_eq!(dir.pairwise(&node(2), &node(2)), Some(0.0));
    }

    proptest! {
        #[test]
        fn prop_center_is_minimax(raw in proptest::collection::vec(1.0f64..100.0, 15)) {
            // 6 nodes, symmetric matrix from the upper triangle
            let n = 6;
            let mut rows = vec![vec![0.0; n]; n];
            let mut k = 0;
            for i in 0..n {
                for j in (i + 1)..n {
                    rows[i][j] = raw[k];
                    rows[j][i] = raw[k];
                    k += 1;
                }
            }
            let m = Matrix::new(&rows);
            let members: Vec<NodeId> = (0..n as u32).map(node).collect();

            let (center, d) = find_center(&m, &members).unwrap();
            prop_assert_eq!(d, max_distance(&m, &center, &members));
            for other in &members {
                prop_assert!(d <= max_distance(&m, other, &members));
            }
        }
    }
}
