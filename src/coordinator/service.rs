//! Coordinator service
//!
//! Composition root for the coordination API. Every mutating entry point
//! checks cluster leadership first, delegates to the owning component and
//! then brings worker consumers in line with the committed topology.

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::assignment::{AssignmentManager, Reassignment};
use crate::coordinator::build_trigger::{SegmentBuildStatus, SegmentBuildTrigger};
use crate::coordinator::catalog::CubeCatalog;
use crate::coordinator::consumer::{ConsumerController, DirectiveReport};
use crate::coordinator::leadership::{LeaderElection, LeadershipManager};
use crate::coordinator::metadata::TopologyPersistence;
use crate::coordinator::model::{
    CubeAssignment, Node, Partition, RebalancePlan, ReplicaSet, ReplicaSetId, SegmentRange,
};
use crate::coordinator::node_client::{BuildSubmitter, DirectiveSender, JobHandle};
use crate::coordinator::rebalance::{AppliedPlan, RebalancePlanner};
use crate::coordinator::topology::{TopologySnapshot, TopologyStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Collaborators the service is wired with
pub struct Collaborators {
    pub persistence: Arc<dyn TopologyPersistence>,
    pub election: Arc<dyn LeaderElection>,
    pub catalog: Arc<dyn CubeCatalog>,
    pub directives: Arc<dyn DirectiveSender>,
    pub builds: Arc<dyn BuildSubmitter>,
}

/// Tunables taken from [`CoordinatorConfig`]
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub node_id: String,
    pub persist_timeout: Duration,
    pub build_retention: usize,
}

impl From<&CoordinatorConfig> for ServiceOptions {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            persist_timeout: config.persist_timeout(),
            build_retention: config.build_retention,
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

/// Body of `create replica set`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaSetDescriptor {
    #[serde(default)]
    pub id: Option<ReplicaSetId>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub node_id: String,
    pub role: &'static str,
    pub is_leader: bool,
    pub leader: Option<String>,
    pub version: u64,
    pub replica_sets: usize,
    pub nodes: usize,
    pub cubes: usize,
    pub pending_builds: usize,
}

pub struct CoordinatorService {
    options: ServiceOptions,
    topology: Arc<TopologyStore>,
    leadership: Arc<LeadershipManager>,
    assignments: AssignmentManager,
    planner: RebalancePlanner,
    builds: SegmentBuildTrigger,
    consumers: ConsumerController,
}

impl CoordinatorService {
    /// Load the committed topology and wire every component
    pub async fn open(options: ServiceOptions, collaborators: Collaborators) -> Result<Self> {
        let topology = Arc::new(
            TopologyStore::open(collaborators.persistence, options.persist_timeout).await?,
        );
        let leadership = Arc::new(LeadershipManager::new(
            collaborators.election,
            topology.clone(),
        ));

        Ok(Self {
            assignments: AssignmentManager::new(
                topology.clone(),
                leadership.clone(),
                collaborators.catalog,
            ),
            planner: RebalancePlanner::new(topology.clone(), leadership.clone()),
            builds: SegmentBuildTrigger::new(
                topology.clone(),
                leadership.clone(),
                collaborators.builds,
                options.build_retention,
            ),
            consumers: ConsumerController::new(
                topology.clone(),
                leadership.clone(),
                collaborators.directives,
            ),
            options,
            topology,
            leadership,
        })
    }

    pub fn leadership(&self) -> &LeadershipManager {
        &self.leadership
    }

    // === Reads ===

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.topology.snapshot()
    }

    pub fn assignment(&self, cube: &str) -> Result<CubeAssignment> {
        self.assignments.assignment(cube)
    }

    pub fn replica_sets(&self) -> Vec<ReplicaSet> {
        self.topology.snapshot().replica_sets.values().cloned().collect()
    }

    pub fn replica_set(&self, id: ReplicaSetId) -> Result<ReplicaSet> {
        self.topology.snapshot().replica_set(id).cloned()
    }

    pub fn pending_builds(&self) -> Vec<SegmentBuildStatus> {
        self.builds.pending()
    }

    /// Answered from the committed snapshot without taking any lock
    pub fn status(&self) -> CoordinatorStatus {
        let snapshot = self.topology.snapshot();
        let is_leader = self.leadership.is_leader();
        CoordinatorStatus {
            node_id: self.options.node_id.clone(),
            role: if is_leader { "leader" } else { "standby" },
            is_leader,
            leader: self.leadership.leader_hint(),
            version: snapshot.version,
            replica_sets: snapshot.replica_sets.len(),
            nodes: snapshot.nodes.len(),
            cubes: snapshot.assignments.len(),
            pending_builds: snapshot.builds.pending_count(),
        }
    }

    // === Rebalance ===

    pub fn recommend_rebalance(&self) -> Result<RebalancePlan> {
        self.planner.recommend()
    }

    pub async fn apply_rebalance(&self, plan: &RebalancePlan) -> Result<AppliedPlan> {
        let applied = self.planner.apply(plan).await?;
        self.consumers.reconcile(&applied.before, &applied.after).await;
        Ok(applied)
    }

    // === Assignment ===

    pub async fn assign_cube(&self, cube: &str) -> Result<CubeAssignment> {
        self.assignments.assign_cube(cube).await
    }

    pub async fn unassign_cube(&self, cube: &str) -> Result<DirectiveReport> {
        let consuming = self.topology.snapshot().nodes_for_cube(cube);
        self.assignments.unassign_cube(cube).await?;
        Ok(self.consumers.stop_consumers(cube, &consuming).await)
    }

    pub async fn reassign_cube(
        &self,
        cube: &str,
        proposed: BTreeMap<ReplicaSetId, Vec<Partition>>,
    ) -> Result<CubeAssignment> {
        let before = self.topology.snapshot();
        let Reassignment {
            current, snapshot, ..
        } = self.assignments.reassign_cube(cube, proposed).await?;
        self.consumers.reconcile(&before, &snapshot).await;
        Ok(current)
    }

    // === Replica sets and nodes ===

    pub async fn create_replica_set(&self, descriptor: ReplicaSetDescriptor) -> Result<ReplicaSet> {
        self.leadership.check_leader()?;
        let (id, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| {
                snap.create_replica_set(descriptor.id, &descriptor.nodes)
            })
            .await
            .inspect_err(|e| warn!(error = %e, "Create replica set rejected"))?;
        info!(replica_set = id, version = snapshot.version, "Replica set created");
        snapshot.replica_set(id).cloned()
    }

    pub async fn delete_replica_set(&self, id: ReplicaSetId) -> Result<ReplicaSet> {
        self.leadership.check_leader()?;
        let (removed, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| snap.delete_replica_set(id))
            .await
            .inspect_err(|e| warn!(replica_set = id, error = %e, "Delete replica set rejected"))?;
        info!(replica_set = id, version = snapshot.version, "Replica set deleted");
        Ok(removed)
    }

    pub async fn add_node(&self, id: ReplicaSetId, node: Node) -> Result<ReplicaSet> {
        self.leadership.check_leader()?;
        let before = self.topology.snapshot();
        let (_, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| snap.add_node(id, node.clone()))
            .await
            .inspect_err(|e| warn!(replica_set = id, %node, error = %e, "Add node rejected"))?;
        info!(replica_set = id, %node, version = snapshot.version, "Node added to replica set");
        self.consumers.reconcile(&before, &snapshot).await;
        snapshot.replica_set(id).cloned()
    }

    pub async fn remove_node(&self, id: ReplicaSetId, node: Node) -> Result<ReplicaSet> {
        self.leadership.check_leader()?;
        let (_, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| snap.remove_node(id, &node))
            .await
            .inspect_err(|e| warn!(replica_set = id, %node, error = %e, "Remove node rejected"))?;
        info!(replica_set = id, %node, version = snapshot.version, "Node removed from replica set");
        snapshot.replica_set(id).cloned()
    }

    pub async fn register_node(&self, node: Node) -> Result<Arc<TopologySnapshot>> {
        self.leadership.check_leader()?;
        let (_, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| {
                snap.register_node(node.clone());
                Ok(())
            })
            .await
            .inspect_err(|e| warn!(%node, error = %e, "Register node rejected"))?;
        info!(%node, version = snapshot.version, "Node registered");
        Ok(snapshot)
    }

    pub async fn unregister_node(&self, node: Node) -> Result<Option<ReplicaSetId>> {
        self.leadership.check_leader()?;
        let (owner, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| snap.unregister_node(&node))
            .await
            .inspect_err(|e| warn!(%node, error = %e, "Unregister node rejected"))?;
        info!(%node, replica_set = ?owner, version = snapshot.version, "Node unregistered");
        Ok(owner)
    }

    pub async fn change_leader(&self, id: ReplicaSetId, node: Node) -> Result<ReplicaSet> {
        let snapshot = self.leadership.change_leader(id, node).await?;
        snapshot.replica_set(id).cloned()
    }

    // === Consumers ===

    pub async fn pause(&self, cube: &str) -> Result<DirectiveReport> {
        self.consumers.pause(cube).await
    }

    pub async fn resume(&self, cube: &str) -> Result<DirectiveReport> {
        self.consumers.resume(cube).await
    }

    // === Builds ===

    pub async fn remote_store_complete(
        &self,
        cube: &str,
        range: SegmentRange,
        node: &Node,
    ) -> Result<Option<JobHandle>> {
        self.builds.remote_store_complete(cube, range, node).await
    }

    // === Leadership transitions ===

    /// A new leader starts from the durable copy of the topology,
    /// build reports included
    pub async fn on_leadership_gained(&self) -> Result<()> {
        let version = self.topology.reload().await?;
        info!(version, "Leadership gained");
        Ok(())
    }

    pub async fn on_leadership_lost(&self) {
        info!(leader = ?self.leadership.leader_hint(), "Leadership lost");
    }

    /// Follow election changes for the lifetime of the process
    pub fn spawn_leadership_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut changes = self.leadership.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let leading = *changes.borrow_and_update();
                if leading {
                    if let Err(e) = service.on_leadership_gained().await {
                        error!(error = %e, "Failed to reload topology after gaining leadership");
                    }
                } else {
                    service.on_leadership_lost().await;
                }
            }
        })
    }
}
