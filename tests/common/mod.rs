//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamcoord::coordinator::catalog::StaticCubeCatalog;
use streamcoord::coordinator::leadership::LocalElection;
use streamcoord::coordinator::metadata::{MemoryTopologyStore, TopologyPersistence};
use streamcoord::coordinator::model::{Directive, Node, SegmentRange};
use streamcoord::coordinator::node_client::{BuildSubmitter, DirectiveSender, JobHandle};
use streamcoord::coordinator::service::{
    Collaborators, CoordinatorService, ReplicaSetDescriptor, ServiceOptions,
};
use streamcoord::{Error, Result};
use tokio::sync::Notify;

/// Records directives instead of sending them
#[derive(Default)]
pub struct RecordingDirectives {
    pub sent: Mutex<Vec<(Node, String, Directive)>>,
}

impl RecordingDirectives {
    pub fn take(&self) -> Vec<(Node, String, Directive)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl DirectiveSender for RecordingDirectives {
    async fn send(&self, node: &Node, cube: &str, directive: Directive) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((node.clone(), cube.to_string(), directive));
        Ok(())
    }
}

/// Records submitted builds; can be told to fail or to hold submissions
#[derive(Default)]
pub struct RecordingBuilds {
    pub submitted: Mutex<Vec<(String, SegmentRange)>>,
    pub failing: Mutex<bool>,
    held: AtomicBool,
    /// Signalled when a held submission starts
    pub started: Notify,
    /// Lets one held submission finish
    pub release: Notify,
}

impl RecordingBuilds {
    pub fn count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn hold(&self, held: bool) {
        self.held.store(held, Ordering::SeqCst);
    }
}

#[async_trait]
impl BuildSubmitter for RecordingBuilds {
    async fn submit(&self, cube: &str, range: SegmentRange) -> Result<JobHandle> {
        if self.held.load(Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        if *self.failing.lock().unwrap() {
            return Err(Error::BuildSubmitFailed {
                cube: cube.to_string(),
                reason: "build service unavailable".into(),
            });
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push((cube.to_string(), range));
        Ok(JobHandle(format!("job-{}", submitted.len())))
    }
}

pub struct Harness {
    pub service: Arc<CoordinatorService>,
    pub election: Arc<LocalElection>,
    pub directives: Arc<RecordingDirectives>,
    pub builds: Arc<RecordingBuilds>,
}

pub fn node(name: &str) -> Node {
    Node::new(name, 9000)
}

pub fn catalog() -> StaticCubeCatalog {
    StaticCubeCatalog::default()
        .with_cube("x", "x-events", 4)
        .with_cube("y", "y-events", 2)
        .with_cube("z", "z-events", 6)
}

pub async fn harness_with(persistence: Arc<dyn TopologyPersistence>, leading: bool) -> Harness {
    let election = Arc::new(LocalElection::new("coord-1:7070", leading));
    let directives = Arc::new(RecordingDirectives::default());
    let builds = Arc::new(RecordingBuilds::default());
    let options = ServiceOptions {
        persist_timeout: Duration::from_millis(200),
        ..ServiceOptions::default()
    };
    let service = CoordinatorService::open(
        options,
        Collaborators {
            persistence,
            election: election.clone(),
            catalog: Arc::new(catalog()),
            directives: directives.clone(),
            builds: builds.clone(),
        },
    )
    .await
    .unwrap();
    Harness {
        service: Arc::new(service),
        election,
        directives,
        builds,
    }
}

pub async fn harness() -> Harness {
    harness_with(Arc::new(MemoryTopologyStore::new()), true).await
}

/// Register nodes and create replica sets, e.g. `&[(1, &["a", "b"]), (2, &["c"])]`
pub async fn with_replica_sets(service: &CoordinatorService, sets: &[(u32, &[&str])]) {
    for (id, names) in sets {
        let nodes: Vec<Node> = names.iter().map(|n| node(n)).collect();
        for n in &nodes {
            service.register_node(n.clone()).await.unwrap();
        }
        service
            .create_replica_set(ReplicaSetDescriptor {
                id: Some(*id),
                nodes,
            })
            .await
            .unwrap();
    }
}

pub fn nodes(names: &[&str]) -> BTreeSet<Node> {
    names.iter().map(|n| node(n)).collect()
}
