//! Rebalance planning and application
//!
//! `recommend` computes a plan that brings every replica set to its ideal
//! share of partitions while moving as few partitions as possible. It never
//! mutates state. `apply` validates a plan for every cube it names and swaps
//! all affected assignments in a single commit, or changes nothing.

use crate::common::{Error, Result};
use crate::coordinator::assignment::validate_assignment;
use crate::coordinator::leadership::LeadershipManager;
use crate::coordinator::model::{CubeAssignment, Partition, RebalancePlan, ReplicaSetId};
use crate::coordinator::topology::{TopologySnapshot, TopologyStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Ideal partition count per replica set.
///
/// Replica sets without nodes get zero; the remainder of the integer
/// division goes to the lowest ids first.
pub fn ideal_shares(
    snapshot: &TopologySnapshot,
    total: usize,
) -> Result<BTreeMap<ReplicaSetId, usize>> {
    let eligible: Vec<ReplicaSetId> = snapshot
        .replica_sets
        .values()
        .filter(|rs| rs.can_own_partitions())
        .map(|rs| rs.id)
        .collect();
    if eligible.is_empty() {
        return Err(Error::NoReplicaSetAvailable);
    }

    let base = total / eligible.len();
    let remainder = total % eligible.len();
    let mut shares: BTreeMap<ReplicaSetId, usize> =
        snapshot.replica_sets.keys().map(|id| (*id, 0)).collect();
    for (i, id) in eligible.iter().enumerate() {
        shares.insert(*id, base + usize::from(i < remainder));
    }
    Ok(shares)
}

/// Compute a recommended plan over all cubes and replica sets.
pub fn recommend_plan(snapshot: &TopologySnapshot) -> Result<RebalancePlan> {
    // replica set -> (cube, partition) currently held
    let mut holdings: BTreeMap<ReplicaSetId, Vec<(String, Partition)>> =
        snapshot.replica_sets.keys().map(|id| (*id, Vec::new())).collect();
    for assignment in snapshot.assignments.values() {
        for (id, partitions) in &assignment.replica_sets {
            let held = holdings.entry(*id).or_default();
            held.extend(partitions.iter().map(|p| (assignment.cube.clone(), p.clone())));
        }
    }

    let total: usize = holdings.values().map(Vec::len).sum();
    let shares = ideal_shares(snapshot, total)?;

    // Partitions of each cube sitting on over-share replica sets
    let mut movable: BTreeMap<String, usize> = BTreeMap::new();
    for (id, held) in &holdings {
        if held.len() > shares.get(id).copied().unwrap_or(0) {
            for (cube, _) in held {
                *movable.entry(cube.clone()).or_default() += 1;
            }
        }
    }

    let mut donated: Vec<(String, Partition)> = Vec::new();
    for (id, held) in holdings.iter_mut() {
        let share = shares.get(id).copied().unwrap_or(0);
        while held.len() > share {
            let Some(pick) = pick_donation(held, &movable) else {
                break;
            };
            let (cube, partition) = held.remove(pick);
            if let Some(count) = movable.get_mut(&cube) {
                *count = count.saturating_sub(1);
            }
            donated.push((cube, partition));
        }
    }

    let mut deficits: BTreeMap<ReplicaSetId, usize> = holdings
        .iter()
        .filter_map(|(id, held)| {
            let share = shares.get(id).copied().unwrap_or(0);
            (held.len() < share).then(|| (*id, share - held.len()))
        })
        .collect();

    for (cube, partition) in donated {
        // Most deficient first, lowest id on ties
        let Some((&target, _)) = deficits
            .iter()
            .filter(|(_, deficit)| **deficit > 0)
            .max_by(|(a_id, a), (b_id, b)| a.cmp(b).then(b_id.cmp(a_id)))
        else {
            return Err(Error::Internal(
                "rebalance donated more partitions than replica sets lack".into(),
            ));
        };
        if let Some(deficit) = deficits.get_mut(&target) {
            *deficit -= 1;
        }
        holdings.entry(target).or_default().push((cube, partition));
    }

    let mut plan = RebalancePlan::new();
    for (id, held) in holdings {
        let cubes = plan.entry(id).or_default();
        for (cube, partition) in held {
            cubes.entry(cube).or_default().push(partition);
        }
        for partitions in cubes.values_mut() {
            partitions.sort();
        }
    }
    Ok(plan)
}

/// Index of the partition a donor gives up next: the one whose cube has the
/// most movable partitions left, highest partition first within the cube.
fn pick_donation(held: &[(String, Partition)], movable: &BTreeMap<String, usize>) -> Option<usize> {
    held.iter()
        .enumerate()
        .max_by(|(_, (a_cube, a_part)), (_, (b_cube, b_part))| {
            let a_count = movable.get(a_cube).copied().unwrap_or(0);
            let b_count = movable.get(b_cube).copied().unwrap_or(0);
            a_count
                .cmp(&b_count)
                .then_with(|| b_cube.cmp(a_cube))
                .then_with(|| a_part.cmp(b_part))
        })
        .map(|(i, _)| i)
}

/// Number of partitions whose owner differs between the snapshot and the plan
pub fn moved_partitions(snapshot: &TopologySnapshot, plan: &RebalancePlan) -> usize {
    let mut moved = 0;
    for (id, cubes) in plan {
        for (cube, partitions) in cubes {
            let Some(assignment) = snapshot.assignments.get(cube) else {
                moved += partitions.len();
                continue;
            };
            moved += partitions
                .iter()
                .filter(|p| assignment.owner_of(p) != Some(*id))
                .count();
        }
    }
    moved
}

/// Per-cube target assignments described by a plan
fn plan_by_cube(plan: &RebalancePlan) -> BTreeMap<String, BTreeMap<ReplicaSetId, Vec<Partition>>> {
    let mut by_cube: BTreeMap<String, BTreeMap<ReplicaSetId, Vec<Partition>>> = BTreeMap::new();
    for (id, cubes) in plan {
        for (cube, partitions) in cubes {
            by_cube
                .entry(cube.clone())
                .or_default()
                .entry(*id)
                .or_default()
                .extend(partitions.iter().cloned());
        }
    }
    by_cube
}

/// Validate every cube a plan names; all violations are reported together.
pub fn validate_plan(
    snapshot: &TopologySnapshot,
    plan: &RebalancePlan,
) -> Result<Vec<CubeAssignment>> {
    let mut violations = BTreeMap::new();
    let mut targets = Vec::new();

    for (cube, proposed) in plan_by_cube(plan) {
        let Some(current) = snapshot.assignments.get(&cube) else {
            violations.insert(cube, "cube is not assigned".to_string());
            continue;
        };
        match validate_assignment(&cube, &current.partitions(), &proposed, snapshot) {
            Ok(target) => targets.push(target),
            Err(violation) => {
                violations.insert(cube, violation.to_string());
            }
        }
    }

    if violations.is_empty() {
        Ok(targets)
    } else {
        Err(Error::InvalidPlan { violations })
    }
}

/// Outcome of an applied plan
#[derive(Debug, Clone)]
pub struct AppliedPlan {
    pub cubes: BTreeSet<String>,
    pub moved: usize,
    pub before: Arc<TopologySnapshot>,
    pub after: Arc<TopologySnapshot>,
}

pub struct RebalancePlanner {
    topology: Arc<TopologyStore>,
    leadership: Arc<LeadershipManager>,
}

impl RebalancePlanner {
    pub fn new(topology: Arc<TopologyStore>, leadership: Arc<LeadershipManager>) -> Self {
        Self {
            topology,
            leadership,
        }
    }

    /// Advisory plan over the latest snapshot
    pub fn recommend(&self) -> Result<RebalancePlan> {
        let snapshot = self.topology.snapshot();
        let plan = recommend_plan(&snapshot)?;
        info!(
            version = snapshot.version,
            moved = moved_partitions(&snapshot, &plan),
            "Rebalance recommended"
        );
        Ok(plan)
    }

    /// Apply a plan atomically: every named cube is swapped, or none is
    pub async fn apply(&self, plan: &RebalancePlan) -> Result<AppliedPlan> {
        self.leadership.check_leader()?;
        let base = self.topology.snapshot();
        let ((cubes, moved, before), after) = self
            .topology
            .update(self.leadership.as_ref(), |snap| {
                let before = Arc::new(snap.clone());
                let moved = moved_partitions(snap, plan);
                let targets = validate_plan(snap, plan)?;
                let mut cubes = BTreeSet::new();
                for target in targets {
                    cubes.insert(target.cube.clone());
                    snap.assignments.insert(target.cube.clone(), target);
                }
                Ok((cubes, moved, before))
            })
            .await
            .inspect_err(|e| warn!(version = base.version, error = %e, "Rebalance plan rejected"))?;

        info!(
            cubes = ?cubes,
            moved,
            version = after.version,
            "Rebalance plan applied"
        );
        Ok(AppliedPlan {
            cubes,
            moved,
            before,
            after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::model::Node;

    fn snapshot(sets: &[(ReplicaSetId, usize)]) -> TopologySnapshot {
        let mut snap = TopologySnapshot::default();
        for (id, nodes) in sets {
            let nodes: Vec<Node> = (0..*nodes)
                .map(|n| Node::new(format!("rs{}-n{}", id, n), 9000))
                .collect();
            for node in &nodes {
                snap.register_node(node.clone());
            }
            snap.create_replica_set(Some(*id), &nodes).unwrap();
        }
        snap
    }

    fn assign(snap: &mut TopologySnapshot, cube: &str, owned: &[(ReplicaSetId, &[u32])]) {
        let mut assignment = CubeAssignment::new(cube);
        for (id, partitions) in owned {
            assignment.replica_sets.insert(
                *id,
                partitions.iter().map(|p| Partition::new(cube, *p)).collect(),
            );
        }
        snap.assignments.insert(cube.to_string(), assignment.normalize());
    }

    fn count(plan: &RebalancePlan, id: ReplicaSetId) -> usize {
        plan.get(&id).map(|c| c.values().map(Vec::len).sum()).unwrap_or(0)
    }

    #[test]
    fn test_ideal_shares_remainder_to_lowest_ids() {
        let snap = snapshot(&[(1, 1), (2, 1), (3, 1)]);
        let shares = ideal_shares(&snap, 8).unwrap();
        assert_eq!(shares[&1], 3);
        assert_eq!(shares[&2], 3);
        assert_eq!(shares[&3], 2);
    }

    #[test]
    fn test_balanced_cluster_needs_no_moves() {
        let mut snap = snapshot(&[(1, 1), (2, 1)]);
        assign(&mut snap, "x", &[(1, &[0, 1]), (2, &[2, 3])]);
        let plan = recommend_plan(&snap).unwrap();
        assert_eq!(moved_partitions(&snap, &plan), 0);
    }

    #[test]
    fn test_spreads_single_owner_evenly() {
        let mut snap = snapshot(&[(1, 1), (2, 1), (3, 1)]);
        assign(&mut snap, "x", &[(1, &[0, 1, 2, 3, 4, 5])]);

        let plan = recommend_plan(&snap).unwrap();
        assert_eq!(count(&plan, 1), 2);
        assert_eq!(count(&plan, 2), 2);
        assert_eq!(count(&plan, 3), 2);
        assert_eq!(moved_partitions(&snap, &plan), 4);
        // the donor keeps its lowest partitions
        assert_eq!(
            plan[&1]["x"],
            vec![Partition::new("x", 0), Partition::new("x", 1)]
        );
        assert!(validate_plan(&snap, &plan).is_ok());
    }

    #[test]
    fn test_donations_spread_across_cubes() {
        let mut snap = snapshot(&[(1, 1), (2, 1)]);
        assign(&mut snap, "a", &[(1, &[0, 1, 2])]);
        assign(&mut snap, "b", &[(1, &[0, 1, 2])]);

        let plan = recommend_plan(&snap).unwrap();
        assert_eq!(count(&plan, 1), 3);
        assert_eq!(count(&plan, 2), 3);
        // churn is shared: replica set 2 receives partitions of both cubes
        assert!(plan[&2].contains_key("a"));
        assert!(plan[&2].contains_key("b"));
    }

    #[test]
    fn test_drains_replica_set_without_nodes() {
        let mut snap = snapshot(&[(1, 1), (2, 1)]);
        snap.create_replica_set(Some(3), &[]).unwrap();
        assign(&mut snap, "x", &[(1, &[0]), (2, &[1]), (3, &[2, 3])]);

        let plan = recommend_plan(&snap).unwrap();
        assert_eq!(count(&plan, 3), 0);
        assert_eq!(count(&plan, 1), 2);
        assert_eq!(count(&plan, 2), 2);
        assert_eq!(moved_partitions(&snap, &plan), 2);
    }

    #[test]
    fn test_no_replica_sets() {
        let snap = TopologySnapshot::default();
        assert!(matches!(
            recommend_plan(&snap),
            Err(Error::NoReplicaSetAvailable)
        ));
    }

    #[test]
    fn test_validate_plan_collects_every_cube() {
        let mut snap = snapshot(&[(1, 1), (2, 1)]);
        assign(&mut snap, "a", &[(1, &[0, 1])]);
        assign(&mut snap, "b", &[(2, &[0, 1])]);

        let mut plan = RebalancePlan::new();
        plan.entry(1).or_default().insert("a".into(), vec![Partition::new("a", 0)]);
        plan.entry(2).or_default().insert(
            "b".into(),
            vec![Partition::new("b", 0), Partition::new("b", 0), Partition::new("b", 1)],
        );
        plan.entry(2).or_default().insert("ghost".into(), vec![Partition::new("ghost", 0)]);

        match validate_plan(&snap, &plan) {
            Err(Error::InvalidPlan { violations }) => {
                assert!(violations["a"].contains("missing partitions [a-1]"));
                assert!(violations["b"].contains("duplicated partitions [b-0]"));
                assert_eq!(violations["ghost"], "cube is not assigned");
            }
            other => panic!("expected InvalidPlan, got {:?}", other),
        }
    }
}
