//! Replica placement policy
//!
//! Pure decision logic: given a placement code and a capacity snapshot of
//! the candidate nodes, pick the nodes that will host a new volume.
//!
//! The primary is tried in order of most free slots (ties by node id). For a
//! primary, the remaining copies are filled in three steps:
//! 1. `z` other nodes in the primary's rack
//! 2. `y` nodes in distinct other racks of the primary's data center
//! 3. `x` nodes in distinct other data centers
//!
//! Each step prefers the node with most free slots, then the lowest id, so
//! the same snapshot always yields the same answer.

use crate::common::{Error, ReplicaPlacement, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A node that may receive a new volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub data_center: String,
    pub rack: String,
    pub free_slots: u32,
}

/// Optional constraint on where the primary copy lives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementHint {
    pub data_center: Option<String>,
    pub rack: Option<String>,
}

impl PlacementHint {
    fn admits(&self, c: &Candidate) -> bool {
        self.data_center
            .as_deref()
            .map_or(true, |dc| dc == c.data_center)
            && self.rack.as_deref().map_or(true, |rack| rack == c.rack)
    }
}

/// Most free slots first, then node id
fn by_capacity(a: &Candidate, b: &Candidate) -> Ordering {
    b.free_slots.cmp(&a.free_slots).then_with(|| a.id.cmp(&b.id))
}

/// Best candidate per group key, groups ordered by their best candidate
fn best_per_group<'a, K: Ord>(
    nodes: impl Iterator<Item = &'a Candidate>,
    key: impl Fn(&Candidate) -> K,
) -> Vec<&'a Candidate> {
    let mut groups: BTreeMap<K, &'a Candidate> = BTreeMap::new();
    for node in nodes {
        let entry = groups.entry(key(node)).or_insert(node);
        if by_capacity(node, *entry) == Ordering::Less {
            *entry = node;
        }
    }
    let mut best: Vec<&'a Candidate> = groups.into_values().collect();
    best.sort_by(|a, b| by_capacity(a, b));
    best
}

fn place_around<'a>(
    policy: &ReplicaPlacement,
    primary: &'a Candidate,
    usable: &[&'a Candidate],
) -> Option<Vec<String>> {
    let mut chosen = vec![primary.id.clone()];

    let same_rack: Vec<&Candidate> = usable
        .iter()
        .copied()
        .filter(|c| {
            c.id != primary.id && c.data_center == primary.data_center && c.rack == primary.rack
        })
        .take(policy.same_rack as usize)
        .collect();
    if same_rack.len() < policy.same_rack as usize {
        return None;
    }
    chosen.extend(same_rack.iter().map(|c| c.id.clone()));

    let other_racks = best_per_group(
        usable
            .iter()
            .copied()
            .filter(|c| c.data_center == primary.data_center && c.rack != primary.rack),
        |c| c.rack.clone(),
    );
    if other_racks.len() < policy.diff_rack as usize {
        return None;
    }
    chosen.extend(
        other_racks
            .iter()
            .take(policy.diff_rack as usize)
            .map(|c| c.id.clone()),
    );

    let other_dcs = best_per_group(
        usable
            .iter()
            .copied()
            .filter(|c| c.data_center != primary.data_center),
        |c| c.data_center.clone(),
    );
    if other_dcs.len() < policy.diff_data_center as usize {
        return None;
    }
    chosen.extend(
        other_dcs
            .iter()
            .take(policy.diff_data_center as usize)
            .map(|c| c.id.clone()),
    );

    Some(chosen)
}

/// Choose the nodes for one volume. The primary comes first.
pub fn choose_placement(
    policy: &ReplicaPlacement,
    candidates: &[Candidate],
    hint: &PlacementHint,
) -> Result<Vec<String>> {
    let mut usable: Vec<&Candidate> = candidates.iter().filter(|c| c.free_slots > 0).collect();
    usable.sort_by(|a, b| by_capacity(a, b));

    if usable.len() < policy.copy_count() {
        return Err(insufficient(
            policy,
            format!(
                "{} nodes with free slots, {} copies required",
                usable.len(),
                policy.copy_count()
            ),
        ));
    }

    usable
        .iter()
        .copied()
        .filter(|c| hint.admits(c))
        .find_map(|primary| place_around(policy, primary, &usable))
        .ok_or_else(|| insufficient(policy, "no node combination satisfies the spread".into()))
}

/// Plan `count` volumes against one snapshot, consuming a slot on every
/// chosen node per volume. Either every volume gets a placement or none does.
pub fn plan_volumes(
    policy: &ReplicaPlacement,
    candidates: &[Candidate],
    count: usize,
    hint: &PlacementHint,
) -> Result<Vec<Vec<String>>> {
    let mut snapshot = candidates.to_vec();
    let mut plans = Vec::with_capacity(count);

    for i in 0..count {
        let nodes = choose_placement(policy, &snapshot, hint).map_err(|e| match e {
            Error::InsufficientCapacity { placement, reason } => Error::InsufficientCapacity {
                placement,
                reason: format!("volume {} of {}: {}", i + 1, count, reason),
            },
            other => other,
        })?;
        for node in &nodes {
            if let Some(c) = snapshot.iter_mut().find(|c| &c.id == node) {
                c.free_slots = c.free_slots.saturating_sub(1);
            }
        }
        plans.push(nodes);
    }

    Ok(plans)
}

/// Check that `nodes` (primary first) realise `policy` given each node's
/// `(data_center, rack)`. Used to re-validate a placement at commit time.
pub fn satisfies_spread(policy: &ReplicaPlacement, locations: &[(&str, &str)]) -> bool {
    let Some(&(primary_dc, primary_rack)) = locations.first() else {
        return false;
    };
    if locations.len() != policy.copy_count() {
        return false;
    }

    let rest = &locations[1..];
    let same_rack = rest
        .iter()
        .filter(|(dc, rack)| *dc == primary_dc && *rack == primary_rack)
        .count();
    let mut other_racks: Vec<&str> = rest
        .iter()
        .filter(|(dc, rack)| *dc == primary_dc && *rack != primary_rack)
        .map(|(_, rack)| *rack)
        .collect();
    let mut other_dcs: Vec<&str> = rest
        .iter()
        .filter(|(dc, _)| *dc != primary_dc)
        .map(|(dc, _)| *dc)
        .collect();

    let racks_total = other_racks.len();
    let dcs_total = other_dcs.len();
    other_racks.sort_unstable();
    other_racks.dedup();
    other_dcs.sort_unstable();
    other_dcs.dedup();

    same_rack == policy.same_rack as usize
        && racks_total == policy.diff_rack as usize
        && other_racks.len() == racks_total
        && dcs_total == policy.diff_data_center as usize
        && other_dcs.len() == dcs_total
}

fn insufficient(policy: &ReplicaPlacement, reason: String) -> Error {
    Error::InsufficientCapacity {
        placement: policy.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, dc: &str, rack: &str, free: u32) -> Candidate {
        Candidate {
            id: id.to_string(),
            data_center: dc.to_string(),
            rack: rack.to_string(),
            free_slots: free,
        }
    }

    fn rp(code: &str) -> ReplicaPlacement {
        code.parse().unwrap()
    }

    #[test]
    fn test_single_copy_prefers_most_free() {
        let nodes = vec![node("a", "dc1", "r1", 2), node("b", "dc1", "r1", 5)];
        let chosen = choose_placement(&rp("000"), &nodes, &PlacementHint::default()).unwrap();
        assert_eq!(chosen, vec!["b"]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let nodes = vec![node("b", "dc1", "r1", 3), node("a", "dc1", "r1", 3)];
        let chosen = choose_placement(&rp("000"), &nodes, &PlacementHint::default()).unwrap();
        assert_eq!(chosen, vec!["a"]);
    }

    #[test]
    fn test_different_rack_never_same_rack() {
        let nodes = vec![
            node("a", "dc1", "r1", 7),
            node("b", "dc1", "r1", 6),
            node("c", "dc1", "r2", 1),
        ];
        let chosen = choose_placement(&rp("010"), &nodes, &PlacementHint::default()).unwrap();
        assert_eq!(chosen, vec!["a", "c"]);
    }

    #[test]
    fn test_different_rack_fails_with_one_rack() {
        let nodes = vec![node("a", "dc1", "r1", 7), node("b", "dc1", "r1", 7)];
        let err = choose_placement(&rp("010"), &nodes, &PlacementHint::default()).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_different_data_center() {
        let nodes = vec![
            node("a", "dc1", "r1", 7),
            node("b", "dc1", "r2", 1),
            node("c", "dc2", "r1", 2),
            node("d", "dc2", "r1", 1),
        ];
        let chosen = choose_placement(&rp("100"), &nodes, &PlacementHint::default()).unwrap();
        assert_eq!(chosen, vec!["a", "c"]);
    }

    #[test]
    fn test_primary_falls_back_when_best_cannot_satisfy() {
        // "001" needs two nodes in one rack; the freest node is alone in its rack
        let nodes = vec![
            node("solo", "dc1", "r1", 9),
            node("x", "dc1", "r2", 1),
            node("y", "dc1", "r2", 1),
        ];
        let chosen = choose_placement(&rp("001"), &nodes, &PlacementHint::default()).unwrap();
        assert_eq!(chosen, vec!["x", "y"]);
    }

    #[test]
    fn test_full_nodes_are_skipped() {
        let nodes = vec![node("a", "dc1", "r1", 0), node("b", "dc2", "r1", 1)];
        let err = choose_placement(&rp("100"), &nodes, &PlacementHint::default()).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_hint_constrains_primary() {
        let nodes = vec![node("a", "dc1", "r1", 7), node("b", "dc2", "r1", 1)];
        let hint = PlacementHint {
            data_center: Some("dc2".into()),
            rack: None,
        };
        let chosen = choose_placement(&rp("100"), &nodes, &hint).unwrap();
        assert_eq!(chosen, vec!["b", "a"]);
    }

    #[test]
    fn test_plan_volumes_consumes_capacity() {
        let nodes = vec![
            node("a", "dc1", "r1", 7),
            node("b", "dc1", "r2", 1),
            node("c", "dc2", "r1", 2),
            node("d", "dc2", "r2", 1),
        ];
        let plans = plan_volumes(&rp("100"), &nodes, 3, &PlacementHint::default()).unwrap();
        assert_eq!(plans.len(), 3);
        for plan in &plans {
            assert_eq!(plan.len(), 2);
        }

        // dc2 only has three slots in total
        let err = plan_volumes(&rp("100"), &nodes, 4, &PlacementHint::default()).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_satisfies_spread() {
        assert!(satisfies_spread(&rp("100"), &[("dc1", "r1"), ("dc2", "r1")]));
        assert!(!satisfies_spread(&rp("100"), &[("dc1", "r1"), ("dc1", "r2")]));
        assert!(satisfies_spread(&rp("011"), &[("dc1", "r1"), ("dc1", "r1"), ("dc1", "r2")]));
        assert!(!satisfies_spread(&rp("020"), &[("dc1", "r1"), ("dc1", "r2"), ("dc1", "r2")]));
        assert!(!satisfies_spread(&rp("000"), &[]));
    }

    #[test]
    fn test_deterministic() {
        let nodes = vec![
            node("n3", "dc1", "r1", 4),
            node("n1", "dc1", "r2", 4),
            node("n2", "dc2", "r1", 4),
            node("n4", "dc2", "r2", 4),
        ];
        let first = choose_placement(&rp("110"), &nodes, &PlacementHint::default()).unwrap();
        for _ in 0..10 {
            let again = choose_placement(&rp("110"), &nodes, &PlacementHint::default()).unwrap();
            assert_eq!(first, again);
        }
        assert_eq!(first, vec!["n1", "n3", "n2"]);
    }
}
