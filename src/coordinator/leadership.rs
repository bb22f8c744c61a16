//! Leadership
//!
//! Two notions of leadership live here:
//! - cluster-wide: whether this coordinator process is the active leader,
//!   as reported by an external election primitive. Every mutation checks it
//!   on entry and again right before the durable persist.
//! - per replica set: which worker node leads each replica set. Election
//!   happens among the workers; the coordinator only records the outcome.

use crate::common::{Error, Result};
use crate::coordinator::model::{Node, ReplicaSetId};
use crate::coordinator::topology::{CommitGate, TopologySnapshot, TopologyStore};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{info, warn};

/// External leader-election primitive.
pub trait LeaderElection: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Address of the current leader, when known
    fn leader_hint(&self) -> Option<String>;

    /// Observe leadership changes (`true` while leading)
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Election state pushed in from outside the process.
///
/// Set once at startup in standalone deployments, otherwise updated by the
/// external elector through the admin API.
pub struct LocalElection {
    advertise_addr: String,
    state: watch::Sender<bool>,
    leader: RwLock<Option<String>>,
}

impl LocalElection {
    pub fn new(advertise_addr: impl Into<String>, leading: bool) -> Self {
        let advertise_addr = advertise_addr.into();
        let leader = leading.then(|| advertise_addr.clone());
        let (state, _) = watch::channel(leading);
        Self {
            advertise_addr,
            state,
            leader: RwLock::new(leader),
        }
    }

    pub fn acquire(&self) {
        self.set(true, None);
    }

    pub fn release(&self, new_leader: Option<String>) {
        self.set(false, new_leader);
    }

    pub fn set(&self, leading: bool, leader: Option<String>) {
        let leader = if leading {
            Some(self.advertise_addr.clone())
        } else {
            leader.filter(|l| *l != self.advertise_addr)
        };
        if let Ok(mut current) = self.leader.write() {
            *current = leader;
        }
        let previous = self.state.send_replace(leading);
        if previous != leading {
            info!(leading, "Cluster leadership changed");
        }
    }
}

impl LeaderElection for LocalElection {
    fn is_leader(&self) -> bool {
        *self.state.borrow()
    }

    fn leader_hint(&self) -> Option<String> {
        self.leader.read().ok().and_then(|l| l.clone())
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

pub struct LeadershipManager {
    election: Arc<dyn LeaderElection>,
    topology: Arc<TopologyStore>,
}

impl LeadershipManager {
    pub fn new(election: Arc<dyn LeaderElection>, topology: Arc<TopologyStore>) -> Self {
        Self {
            election,
            topology,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leader_hint(&self) -> Option<String> {
        self.election.leader_hint()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.election.subscribe()
    }

    /// Fail with `NotLeader` unless this process is the active coordinator
    pub fn check_leader(&self) -> Result<()> {
        if self.election.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader {
                leader: self.election.leader_hint(),
            })
        }
    }

    /// Record the outcome of a replica set leader election.
    pub async fn change_leader(
        &self,
        replica_set: ReplicaSetId,
        new_leader: Node,
    ) -> Result<Arc<TopologySnapshot>> {
        self.check_leader()?;
        let (previous, snapshot) = self
            .topology
            .update(self, |snap| {
                let previous = snap.replica_set(replica_set)?.leader.clone();
                snap.set_leader(replica_set, new_leader.clone())?;
                Ok(previous)
            })
            .await
            .inspect_err(|e| {
                warn!(replica_set, node = %new_leader, error = %e, "Leader change rejected")
            })?;

        info!(
            replica_set,
            previous = ?previous.map(|n| n.to_string()),
            leader = %new_leader,
            version = snapshot.version,
            "Replica set leader changed"
        );
        Ok(snapshot)
    }

    /// Current leader of a replica set
    pub fn leader_of(&self, replica_set: ReplicaSetId) -> Result<Option<Node>> {
        Ok(self
            .topology
            .snapshot()
            .replica_set(replica_set)?
            .leader
            .clone())
    }
}

impl CommitGate for LeadershipManager {
    fn check(&self) -> Result<()> {
        self.check_leader()
    }
}
