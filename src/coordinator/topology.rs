//! Topology store
//!
//! The cluster topology (registered nodes, replica sets, cube assignments,
//! desired consumer states and segment build reports) is held as one immutable, versioned
//! [`TopologySnapshot`]. Readers load the current snapshot without locking.
//! Writers serialize on a single in-process lock, build the next snapshot as
//! a value, persist it to the durable store and only then publish it, so a
//! failed or timed-out persist leaves the published state untouched.

use crate::common::{Error, Result};
use crate::coordinator::build_trigger::BuildLedger;
use crate::coordinator::metadata::TopologyPersistence;
use crate::coordinator::model::{
    ConsumerState, CubeAssignment, Node, ReplicaSet, ReplicaSetId,
};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

/// One committed version of the cluster topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub nodes: BTreeSet<Node>,
    pub replica_sets: BTreeMap<ReplicaSetId, ReplicaSet>,
    pub assignments: BTreeMap<String, CubeAssignment>,
    pub consumer_states: BTreeMap<String, ConsumerState>,
    pub builds: BuildLedger,
}

impl TopologySnapshot {
    // === Reads ===

    pub fn replica_set(&self, id: ReplicaSetId) -> Result<&ReplicaSet> {
        self.replica_sets
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("replica set {}", id)))
    }

    pub fn assignment(&self, cube: &str) -> Result<&CubeAssignment> {
        self.assignments
            .get(cube)
            .ok_or_else(|| Error::NotAssigned(cube.to_string()))
    }

    pub fn require_node(&self, node: &Node) -> Result<()> {
        if self.nodes.contains(node) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("node {}", node)))
        }
    }

    /// Replica set the node currently belongs to
    pub fn replica_set_of(&self, node: &Node) -> Option<ReplicaSetId> {
        self.replica_sets
            .values()
            .find(|rs| rs.contains(node))
            .map(|rs| rs.id)
    }

    /// Partitions owned by a replica set across all cubes
    pub fn partition_count(&self, replica_set: ReplicaSetId) -> usize {
        self.assignments
            .values()
            .map(|a| a.partitions_of(replica_set).len())
            .sum()
    }

    /// Cubes with at least one partition on the replica set
    pub fn cubes_owned_by(&self, replica_set: ReplicaSetId) -> Vec<String> {
        self.assignments
            .values()
            .filter(|a| a.owns(replica_set))
            .map(|a| a.cube.clone())
            .collect()
    }

    /// Nodes of every replica set owning a partition of the cube
    pub fn nodes_for_cube(&self, cube: &str) -> BTreeSet<Node> {
        let Some(assignment) = self.assignments.get(cube) else {
            return BTreeSet::new();
        };
        assignment
            .replica_sets
            .keys()
            .filter_map(|id| self.replica_sets.get(id))
            .flat_map(|rs| rs.nodes.iter().cloned())
            .collect()
    }

    /// One past the highest existing id
    pub fn next_replica_set_id(&self) -> Result<ReplicaSetId> {
        match self.replica_sets.keys().next_back() {
            Some(id) => id.checked_add(1).ok_or_else(|| {
                Error::InvalidRequest("replica set ids exhausted, pass an explicit id".into())
            }),
            None => Ok(0),
        }
    }

    // === Membership mutations (applied to a private copy by writers) ===

    /// Registration is idempotent
    pub fn register_node(&mut self, node: Node) {
        self.nodes.insert(node);
    }

    /// Unregister a node, dropping it from its replica set
    pub fn unregister_node(&mut self, node: &Node) -> Result<Option<ReplicaSetId>> {
        self.require_node(node)?;
        let owner = self.replica_set_of(node);
        if let Some(id) = owner {
            self.remove_node(id, node)?;
        }
        self.nodes.remove(node);
        Ok(owner)
    }

    pub fn create_replica_set(
        &mut self,
        id: Option<ReplicaSetId>,
        nodes: &[Node],
    ) -> Result<ReplicaSetId> {
        let id = match id {
            Some(id) => id,
            None => self.next_replica_set_id()?,
        };
        if self.replica_sets.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("replica set {}", id)));
        }
        self.replica_sets.insert(id, ReplicaSet::new(id));
        for node in nodes {
            self.add_node(id, node.clone())?;
        }
        Ok(id)
    }

    pub fn delete_replica_set(&mut self, id: ReplicaSetId) -> Result<ReplicaSet> {
        self.replica_set(id)?;
        let cubes = self.cubes_owned_by(id);
        if !cubes.is_empty() {
            return Err(Error::ReplicaSetInUse {
                replica_set: id,
                cubes,
            });
        }
        self.replica_sets
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("replica set {}", id)))
    }

    /// A node belongs to at most one replica set
    pub fn add_node(&mut self, id: ReplicaSetId, node: Node) -> Result<()> {
        self.replica_set(id)?;
        self.require_node(&node)?;
        match self.replica_set_of(&node) {
            Some(owner) if owner == id => return Ok(()),
            Some(owner) => {
                return Err(Error::NodeAlreadyInReplicaSet {
                    replica_set: owner,
                    node,
                })
            }
            None => {}
        }
        if let Some(rs) = self.replica_sets.get_mut(&id) {
            rs.nodes.insert(node);
        }
        Ok(())
    }

    /// Removing the leader leaves the replica set leaderless
    pub fn remove_node(&mut self, id: ReplicaSetId, node: &Node) -> Result<()> {
        let rs = self
            .replica_sets
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("replica set {}", id)))?;
        if !rs.nodes.remove(node) {
            return Err(Error::NotMember {
                replica_set: id,
                node: node.clone(),
            });
        }
        if rs.leader.as_ref() == Some(node) {
            rs.leader = None;
        }
        Ok(())
    }

    pub fn set_leader(&mut self, id: ReplicaSetId, node: Node) -> Result<()> {
        let rs = self
            .replica_sets
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("replica set {}", id)))?;
        if !rs.contains(&node) {
            return Err(Error::NotMember {
                replica_set: id,
                node,
            });
        }
        rs.leader = Some(node);
        Ok(())
    }
}

/// Last check run by a writer right before the durable persist.
pub trait CommitGate: Send + Sync {
    fn check(&self) -> Result<()>;
}

/// Single-writer, versioned topology store.
pub struct TopologyStore {
    current: ArcSwap<TopologySnapshot>,
    writer: Mutex<()>,
    persistence: Arc<dyn TopologyPersistence>,
    persist_timeout: Duration,
}

impl TopologyStore {
    /// Open the store, loading the last committed snapshot (or starting empty)
    pub async fn open(
        persistence: Arc<dyn TopologyPersistence>,
        persist_timeout: Duration,
    ) -> Result<Self> {
        let initial = load_with_timeout(persistence.as_ref(), persist_timeout)
            .await?
            .unwrap_or_default();
        info!(version = initial.version, "Topology loaded");

        Ok(Self {
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
            persistence,
            persist_timeout,
        })
    }

    /// Latest committed snapshot
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Acquire the single-writer lock
    pub async fn writer(&self) -> TopologyWriter<'_> {
        TopologyWriter {
            store: self,
            _guard: self.writer.lock().await,
        }
    }

    /// Clone the current snapshot, apply `f` and commit the result.
    ///
    /// Nothing is persisted when `f` leaves the snapshot unchanged.
    pub async fn update<T>(
        &self,
        gate: &dyn CommitGate,
        f: impl FnOnce(&mut TopologySnapshot) -> Result<T>,
    ) -> Result<(T, Arc<TopologySnapshot>)> {
        let writer = self.writer().await;
        let current = writer.current();
        let mut next = TopologySnapshot::clone(&current);
        let value = f(&mut next)?;
        if next == *current {
            debug!(version = current.version, "Topology unchanged, skipping commit");
            return Ok((value, current));
        }
        let committed = writer.commit(next, gate).await?;
        Ok((value, committed))
    }

    /// Replace the published snapshot with the durable store's copy
    pub async fn reload(&self) -> Result<u64> {
        let _writer = self.writer().await;
        let loaded = load_with_timeout(self.persistence.as_ref(), self.persist_timeout)
            .await?
            .unwrap_or_default();
        let version = loaded.version;
        self.current.store(Arc::new(loaded));
        info!(version, "Topology reloaded from durable store");
        Ok(version)
    }
}

/// Holder of the single-writer lock.
pub struct TopologyWriter<'a> {
    store: &'a TopologyStore,
    _guard: MutexGuard<'a, ()>,
}

impl TopologyWriter<'_> {
    /// Snapshot the writer builds on
    pub fn current(&self) -> Arc<TopologySnapshot> {
        self.store.current.load_full()
    }

    /// Persist `next` as the following version, then publish it.
    pub async fn commit(
        &self,
        mut next: TopologySnapshot,
        gate: &dyn CommitGate,
    ) -> Result<Arc<TopologySnapshot>> {
        next.version = self.store.current.load().version + 1;
        next.updated_at = Some(Utc::now());

        gate.check()?;

        let timeout = self.store.persist_timeout;
        match tokio::time::timeout(timeout, self.store.persistence.save(&next)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(version = next.version, error = %e, "Topology persist failed");
                return Err(e);
            }
            Err(_) => {
                error!(version = next.version, ?timeout, "Topology persist timed out");
                return Err(Error::PersistTimeout(timeout));
            }
        }

        let next = Arc::new(next);
        self.store.current.store(next.clone());
        debug!(version = next.version, "Topology committed");
        Ok(next)
    }
}

async fn load_with_timeout(
    persistence: &dyn TopologyPersistence,
    timeout: Duration,
) -> Result<Option<TopologySnapshot>> {
    tokio::time::timeout(timeout, persistence.load())
        .await
        .map_err(|_| Error::PersistTimeout(timeout))?
}
