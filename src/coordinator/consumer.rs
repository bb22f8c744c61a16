//! Consumer lifecycle: pause/resume directives to the nodes consuming a cube

use crate::common::Result;
use crate::coordinator::leadership::LeadershipManager;
use crate::coordinator::model::{ConsumerState, Directive, Node};
use crate::coordinator::node_client::DirectiveSender;
use crate::coordinator::topology::{TopologySnapshot, TopologyStore};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub node: Node,
    pub error: String,
}

/// Per-node outcome of one directive broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectiveReport {
    pub cube: String,
    pub directive: Option<Directive>,
    pub acked: Vec<Node>,
    pub failed: Vec<DeliveryFailure>,
}

impl DirectiveReport {
    pub fn all_acked(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ConsumerController {
    topology: Arc<TopologyStore>,
    leadership: Arc<LeadershipManager>,
    directives: Arc<dyn DirectiveSender>,
}

impl ConsumerController {
    pub fn new(
        topology: Arc<TopologyStore>,
        leadership: Arc<LeadershipManager>,
        directives: Arc<dyn DirectiveSender>,
    ) -> Self {
        Self {
            topology,
            leadership,
            directives,
        }
    }

    pub async fn pause(&self, cube: &str) -> Result<DirectiveReport> {
        self.set_state(cube, ConsumerState::Paused).await
    }

    pub async fn resume(&self, cube: &str) -> Result<DirectiveReport> {
        self.set_state(cube, ConsumerState::Running).await
    }

    /// Record the desired run state, then tell every owning node.
    ///
    /// The state is committed before delivery; delivery failures are
    /// reported but do not fail the call.
    async fn set_state(&self, cube: &str, state: ConsumerState) -> Result<DirectiveReport> {
        self.leadership.check_leader()?;
        let (nodes, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| {
                snap.assignment(cube)?;
                snap.consumer_states.insert(cube.to_string(), state);
                Ok(snap.nodes_for_cube(cube))
            })
            .await
            .inspect_err(|e| warn!(cube, ?state, error = %e, "Consumer state change rejected"))?;

        info!(
            cube,
            ?state,
            nodes = nodes.len(),
            version = snapshot.version,
            "Consumer state recorded"
        );
        Ok(self.broadcast(cube, state.directive(), &nodes).await)
    }

    /// Send a directive to each node concurrently
    pub async fn broadcast(
        &self,
        cube: &str,
        directive: Directive,
        nodes: &BTreeSet<Node>,
    ) -> DirectiveReport {
        let sends = nodes.iter().map(|node| async move {
            let outcome = self.directives.send(node, cube, directive).await;
            (node.clone(), outcome)
        });

        let mut report = DirectiveReport {
            cube: cube.to_string(),
            directive: Some(directive),
            ..Default::default()
        };
        for (node, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => report.acked.push(node),
                Err(e) => {
                    warn!(cube, %node, %directive, error = %e, "Directive delivery failed");
                    report.failed.push(DeliveryFailure {
                        node,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Bring nodes that newly consume a paused cube in line with its state.
    pub async fn reconcile(
        &self,
        before: &TopologySnapshot,
        after: &TopologySnapshot,
    ) -> Vec<DirectiveReport> {
        let mut reports = Vec::new();
        for (cube, state) in &after.consumer_states {
            if *state != ConsumerState::Paused {
                continue;
            }
            let previous = before.nodes_for_cube(cube);
            let joined: BTreeSet<Node> = after
                .nodes_for_cube(cube)
                .difference(&previous)
                .cloned()
                .collect();
            if joined.is_empty() {
                continue;
            }
            info!(cube, nodes = joined.len(), "Pausing nodes that joined a paused cube");
            reports.push(self.broadcast(cube, Directive::Pause, &joined).await);
        }
        reports
    }

    /// Pause consumers of a cube that is no longer assigned
    pub async fn stop_consumers(&self, cube: &str, nodes: &BTreeSet<Node>) -> DirectiveReport {
        if nodes.is_empty() {
            return DirectiveReport {
                cube: cube.to_string(),
                directive: Some(Directive::Pause),
                ..Default::default()
            };
        }
        self.broadcast(cube, Directive::Pause, nodes).await
    }

    pub fn state(&self, cube: &str) -> Result<ConsumerState> {
        let snapshot = self.topology.snapshot();
        snapshot.assignment(cube)?;
        Ok(snapshot
            .consumer_states
            .get(cube)
            .copied()
            .unwrap_or(ConsumerState::Running))
    }
}
