//! Assignment of a cube's partitions to replica sets
//!
//! Invariant: for every assigned cube, the partition lists of its replica
//! sets are pairwise disjoint and together cover the cube's full partition
//! set. Every path that writes an assignment goes through
//! [`validate_assignment`] or builds one by construction.

use crate::common::{AssignmentViolation, Error, Result};
use crate::coordinator::catalog::CubeCatalog;
use crate::coordinator::leadership::LeadershipManager;
use crate::coordinator::model::{CubeAssignment, Partition, ReplicaSetId};
use crate::coordinator::topology::{TopologySnapshot, TopologyStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Distribute partitions over the least-loaded replica sets.
///
/// Replica sets able to own partitions are ordered by current partition
/// count, then by id, and receive partitions round-robin in that order.
pub fn initial_assignment(
    cube: &str,
    partitions: &[Partition],
    snapshot: &TopologySnapshot,
) -> Result<CubeAssignment> {
    let mut candidates: Vec<(usize, ReplicaSetId)> = snapshot
        .replica_sets
        .values()
        .filter(|rs| rs.can_own_partitions())
        .map(|rs| (snapshot.partition_count(rs.id), rs.id))
        .collect();
    if candidates.is_empty() {
        return Err(Error::NoReplicaSetAvailable);
    }
    candidates.sort();

    let mut assignment = CubeAssignment::new(cube);
    for (i, partition) in partitions.iter().enumerate() {
        let (_, replica_set) = candidates[i % candidates.len()];
        assignment
            .replica_sets
            .entry(replica_set)
            .or_default()
            .push(partition.clone());
    }
    Ok(assignment.normalize())
}

/// Check a proposed mapping against the cube's full partition set.
pub fn validate_assignment(
    cube: &str,
    expected: &BTreeSet<Partition>,
    proposed: &BTreeMap<ReplicaSetId, Vec<Partition>>,
    snapshot: &TopologySnapshot,
) -> std::result::Result<CubeAssignment, AssignmentViolation> {
    let mut violation = AssignmentViolation::default();
    let mut seen = BTreeSet::new();
    let mut duplicated = BTreeSet::new();

    for (id, partitions) in proposed {
        if partitions.is_empty() {
            continue;
        }
        match snapshot.replica_sets.get(id) {
            None => violation.unknown_replica_sets.push(*id),
            Some(rs) if !rs.can_own_partitions() => violation.empty_replica_sets.push(*id),
            Some(_) => {}
        }
        for partition in partitions {
            if !seen.insert(partition.clone()) {
                duplicated.insert(partition.clone());
            }
        }
    }

    violation.duplicated = duplicated.into_iter().collect();
    violation.missing = expected.difference(&seen).cloned().collect();
    violation.unexpected = seen.difference(expected).cloned().collect();

    if !violation.is_empty() {
        return Err(violation);
    }

    Ok(CubeAssignment {
        cube: cube.to_string(),
        replica_sets: proposed.clone(),
    }
    .normalize())
}

/// Previous and new assignment of a reassigned cube
#[derive(Debug, Clone)]
pub struct Reassignment {
    pub previous: CubeAssignment,
    pub current: CubeAssignment,
    pub snapshot: Arc<TopologySnapshot>,
}

pub struct AssignmentManager {
    topology: Arc<TopologyStore>,
    leadership: Arc<LeadershipManager>,
    catalog: Arc<dyn CubeCatalog>,
}

impl AssignmentManager {
    pub fn new(
        topology: Arc<TopologyStore>,
        leadership: Arc<LeadershipManager>,
        catalog: Arc<dyn CubeCatalog>,
    ) -> Self {
        Self {
            topology,
            leadership,
            catalog,
        }
    }

    pub fn assignment(&self, cube: &str) -> Result<CubeAssignment> {
        self.topology.snapshot().assignment(cube).cloned()
    }

    /// Assign a cube that has no assignment yet
    pub async fn assign_cube(&self, cube: &str) -> Result<CubeAssignment> {
        self.leadership.check_leader()?;
        let partitions = self.catalog.partitions(cube)?;
        if partitions.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "cube {} has no partitions",
                cube
            )));
        }

        let (assignment, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| {
                if snap.assignments.contains_key(cube) {
                    return Err(Error::AlreadyAssigned(cube.to_string()));
                }
                let assignment = initial_assignment(cube, &partitions, snap)?;
                snap.assignments
                    .insert(cube.to_string(), assignment.clone());
                Ok(assignment)
            })
            .await
            .inspect_err(|e| warn!(cube, error = %e, "Assign rejected"))?;

        info!(
            cube,
            replica_sets = ?assignment.replica_sets.keys().collect::<Vec<_>>(),
            partitions = assignment.partition_count(),
            version = snapshot.version,
            "Cube assigned"
        );
        Ok(assignment)
    }

    /// Remove a cube's assignment entirely, returning it
    pub async fn unassign_cube(
        &self,
        cube: &str,
    ) -> Result<(CubeAssignment, Arc<TopologySnapshot>)> {
        self.leadership.check_leader()?;
        let (removed, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| {
                let removed = snap
                    .assignments
                    .remove(cube)
                    .ok_or_else(|| Error::NotAssigned(cube.to_string()))?;
                snap.consumer_states.remove(cube);
                snap.builds.forget_cube(cube);
                Ok(removed)
            })
            .await
            .inspect_err(|e| warn!(cube, error = %e, "Unassign rejected"))?;

        info!(cube, version = snapshot.version, "Cube unassigned");
        Ok((removed, snapshot))
    }

    /// Replace a cube's assignment with an operator-supplied mapping
    pub async fn reassign_cube(
        &self,
        cube: &str,
        proposed: BTreeMap<ReplicaSetId, Vec<Partition>>,
    ) -> Result<Reassignment> {
        self.leadership.check_leader()?;
        let ((previous, current), snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| {
                let previous = snap.assignment(cube)?.clone();
                let current =
                    validate_assignment(cube, &previous.partitions(), &proposed, snap).map_err(
                        |violation| Error::InvalidAssignment {
                            cube: cube.to_string(),
                            violation,
                        },
                    )?;
                snap.assignments.insert(cube.to_string(), current.clone());
                Ok((previous, current))
            })
            .await
            .inspect_err(|e| warn!(cube, error = %e, "Reassign rejected"))?;

        info!(
            cube,
            replica_sets = ?current.replica_sets.keys().collect::<Vec<_>>(),
            version = snapshot.version,
            "Cube reassigned"
        );
        Ok(Reassignment {
            previous,
            current,
            snapshot,
        })
    }
}
