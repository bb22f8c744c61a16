//! Segment build trigger
//!
//! Worker nodes report when they have persisted a segment range to the
//! remote store. Reports are aggregated per `(cube, range)` in a
//! [`BuildLedger`] that is part of the topology snapshot, so it is persisted
//! and gated like every other mutation and survives failover. Once every
//! expected node of the owning replica set has reported, one build is
//! submitted and the key is retired.
//!
//! Submission happens outside the topology writer lock. An in-memory mark
//! keeps a second report from submitting the same key while a submission is
//! in flight.

use crate::common::{Error, Result};
use crate::coordinator::leadership::LeadershipManager;
use crate::coordinator::model::{Node, ReplicaSetId, SegmentRange};
use crate::coordinator::node_client::{BuildSubmitter, JobHandle};
use crate::coordinator::topology::{TopologySnapshot, TopologyStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

pub type BuildKey = (String, SegmentRange);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    PartiallyReported,
    ReadyToBuild,
}

/// In-flight state of one `(cube, range)` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentBuildStatus {
    pub cube: String,
    pub range: SegmentRange,
    pub replica_set: ReplicaSetId,
    pub state: BuildState,
    pub expected: BTreeSet<Node>,
    pub reported: BTreeSet<Node>,
    /// A build submission for the key is running on this coordinator
    pub submitting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBuild {
    pub replica_set: ReplicaSetId,
    pub expected: BTreeSet<Node>,
    pub reported: BTreeSet<Node>,
}

impl PendingBuild {
    fn is_complete(&self) -> bool {
        self.expected.is_subset(&self.reported)
    }

    fn state(&self) -> BuildState {
        if self.is_complete() {
            BuildState::ReadyToBuild
        } else if self.reported.is_empty() {
            BuildState::Pending
        } else {
            BuildState::PartiallyReported
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedBuild {
    pub seq: u64,
    pub job: String,
}

/// Result of recording one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// A build for the key was already fired
    AlreadyBuilt,
    /// The node had already reported; nothing changed
    Duplicate,
    /// The node is not among the expected reporters of the key
    NotExpected,
    Recorded { reported: usize, expected: usize },
    /// Every expected node has reported; a build should be submitted
    Ready,
}

/// Report bookkeeping carried in the topology snapshot.
///
/// Completed keys are remembered up to a retention bound, oldest evicted
/// first, so late duplicates stay no-ops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLedger {
    #[serde(with = "entries")]
    pending: BTreeMap<BuildKey, PendingBuild>,
    #[serde(with = "entries")]
    completed: BTreeMap<BuildKey, CompletedBuild>,
    next_seq: u64,
}

impl BuildLedger {
    /// Whether the key is pending or already built
    pub fn is_tracked(&self, cube: &str, range: SegmentRange) -> bool {
        let key = (cube.to_string(), range);
        self.pending.contains_key(&key) || self.completed.contains_key(&key)
    }

    pub fn is_completed(&self, cube: &str, range: SegmentRange) -> bool {
        self.completed.contains_key(&(cube.to_string(), range))
    }

    /// Start tracking a key; the expected reporters are fixed from here on
    pub fn open(
        &mut self,
        cube: &str,
        range: SegmentRange,
        replica_set: ReplicaSetId,
        expected: BTreeSet<Node>,
    ) {
        self.pending
            .entry((cube.to_string(), range))
            .or_insert(PendingBuild {
                replica_set,
                expected,
                reported: BTreeSet::new(),
            });
    }

    pub fn report(&mut self, cube: &str, range: SegmentRange, node: &Node) -> ReportOutcome {
        let key = (cube.to_string(), range);
        if self.completed.contains_key(&key) {
            return ReportOutcome::AlreadyBuilt;
        }
        let Some(entry) = self.pending.get_mut(&key) else {
            return ReportOutcome::NotExpected;
        };
        if !entry.expected.contains(node) {
            return ReportOutcome::NotExpected;
        }
        let inserted = entry.reported.insert(node.clone());

        if entry.is_complete() {
            // A complete key that is still pending has not been fired yet
            ReportOutcome::Ready
        } else if !inserted {
            ReportOutcome::Duplicate
        } else {
            ReportOutcome::Recorded {
                reported: entry.reported.len(),
                expected: entry.expected.len(),
            }
        }
    }

    /// Retire a key whose build was submitted
    pub fn complete(&mut self, cube: &str, range: SegmentRange, job: &JobHandle, retention: usize) {
        let key = (cube.to_string(), range);
        self.pending.remove(&key);
        if self.completed.contains_key(&key) {
            return;
        }
        self.next_seq += 1;
        self.completed.insert(
            key,
            CompletedBuild {
                seq: self.next_seq,
                job: job.0.clone(),
            },
        );
        while self.completed.len() > retention.max(1) {
            let oldest = self
                .completed
                .iter()
                .min_by_key(|(_, done)| done.seq)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => self.completed.remove(&key),
                None => break,
            };
        }
    }

    /// Drop unfinished keys of a cube that is no longer assigned
    pub fn forget_cube(&mut self, cube: &str) {
        self.pending.retain(|(c, _), _| c != cube);
    }

    pub fn state(&self, cube: &str, range: SegmentRange) -> Option<BuildState> {
        let key = (cube.to_string(), range);
        if self.completed.contains_key(&key) {
            return Some(BuildState::ReadyToBuild);
        }
        self.pending.get(&key).map(PendingBuild::state)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Keys still waiting for reports or for a successful submission
    pub fn pending(&self) -> Vec<SegmentBuildStatus> {
        self.pending
            .iter()
            .map(|((cube, range), p)| SegmentBuildStatus {
                cube: cube.clone(),
                range: *range,
                replica_set: p.replica_set,
                state: p.state(),
                expected: p.expected.clone(),
                reported: p.reported.clone(),
                submitting: false,
            })
            .collect()
    }
}

/// Maps with composite keys are stored as sequences of entries.
mod entries {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        let entries = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

/// Replica set of `node` that owns partitions of `cube`, and its members.
pub fn resolve_reporter(
    snapshot: &TopologySnapshot,
    cube: &str,
    node: &Node,
) -> Result<(ReplicaSetId, BTreeSet<Node>)> {
    let unknown = |reason: &str| Error::UnknownAssignment {
        cube: cube.to_string(),
        node: node.clone(),
        reason: reason.to_string(),
    };

    let assignment = snapshot
        .assignments
        .get(cube)
        .ok_or_else(|| unknown("cube is not assigned"))?;
    let replica_set = snapshot
        .replica_set_of(node)
        .ok_or_else(|| unknown("node belongs to no replica set"))?;
    if !assignment.owns(replica_set) {
        return Err(unknown("node's replica set owns no partition of the cube"));
    }
    let members = snapshot.replica_set(replica_set)?.nodes.clone();
    Ok((replica_set, members))
}

#[derive(Debug, Clone)]
enum Submission {
    InFlight,
    /// Submitted, but the completion is not committed yet
    Submitted(JobHandle),
}

enum Claim {
    Start,
    Busy,
    Done,
    Record(JobHandle),
}

pub struct SegmentBuildTrigger {
    topology: Arc<TopologyStore>,
    leadership: Arc<LeadershipManager>,
    submitter: Arc<dyn BuildSubmitter>,
    retention: usize,
    submissions: Mutex<HashMap<BuildKey, Submission>>,
}

impl SegmentBuildTrigger {
    pub fn new(
        topology: Arc<TopologyStore>,
        leadership: Arc<LeadershipManager>,
        submitter: Arc<dyn BuildSubmitter>,
        retention: usize,
    ) -> Self {
        Self {
            topology,
            leadership,
            submitter,
            retention,
            submissions: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `node` persisted `range` of `cube` to the remote store.
    ///
    /// Returns the job handle when this report caused a build submission.
    pub async fn remote_store_complete(
        &self,
        cube: &str,
        range: SegmentRange,
        node: &Node,
    ) -> Result<Option<JobHandle>> {
        self.leadership.check_leader()?;

        // Set-union updates run under the topology writer lock
        let (outcome, snapshot) = self
            .topology
            .update(self.leadership.as_ref(), |snap| {
                if !snap.builds.is_tracked(cube, range) {
                    let (replica_set, expected) = resolve_reporter(snap, cube, node)?;
                    snap.builds.open(cube, range, replica_set, expected);
                }
                Ok(snap.builds.report(cube, range, node))
            })
            .await
            .inspect_err(|e| {
                warn!(cube, %range, %node, error = %e, "Remote store report ignored")
            })?;

        match outcome {
            ReportOutcome::AlreadyBuilt => {
                self.submissions().remove(&(cube.to_string(), range));
                debug!(cube, %range, %node, "Remote store report after build, ignoring");
                Ok(None)
            }
            ReportOutcome::Duplicate => {
                debug!(cube, %range, %node, "Duplicate remote store report");
                Ok(None)
            }
            ReportOutcome::NotExpected => {
                warn!(cube, %range, %node, "Report from a node outside the expected replica set");
                Ok(None)
            }
            ReportOutcome::Recorded { reported, expected } => {
                debug!(
                    cube,
                    %range,
                    %node,
                    reported,
                    expected,
                    version = snapshot.version,
                    "Remote store report recorded"
                );
                Ok(None)
            }
            ReportOutcome::Ready => self.fire(cube, range).await,
        }
    }

    async fn fire(&self, cube: &str, range: SegmentRange) -> Result<Option<JobHandle>> {
        let key = (cube.to_string(), range);
        let claim = {
            let mut submissions = self.submissions();
            match submissions.get(&key) {
                Some(Submission::InFlight) => Claim::Busy,
                Some(Submission::Submitted(job)) => Claim::Record(job.clone()),
                // The mark is dropped only after the completion is published
                None if self.topology.snapshot().builds.is_completed(cube, range) => {
                    Claim::Done
                }
                None => {
                    submissions.insert(key.clone(), Submission::InFlight);
                    Claim::Start
                }
            }
        };

        let job = match claim {
            Claim::Busy => {
                debug!(cube, %range, "Segment build submission already in flight");
                return Ok(None);
            }
            Claim::Done => return Ok(None),
            Claim::Record(job) => job,
            Claim::Start => match self.submit(cube, range).await {
                Ok(job) => {
                    self.submissions()
                        .insert(key.clone(), Submission::Submitted(job.clone()));
                    info!(cube, %range, job = %job, "Segment build submitted");
                    job
                }
                Err(e) => {
                    self.submissions().remove(&key);
                    return Err(e);
                }
            },
        };

        let retention = self.retention;
        self.topology
            .update(self.leadership.as_ref(), |snap| {
                snap.builds.complete(cube, range, &job, retention);
                Ok(())
            })
            .await
            .inspect_err(|e| {
                error!(
                    cube,
                    %range,
                    job = %job,
                    error = %e,
                    "Submitted build not recorded, next report retries"
                )
            })?;
        self.submissions().remove(&key);
        Ok(Some(job))
    }

    async fn submit(&self, cube: &str, range: SegmentRange) -> Result<JobHandle> {
        self.leadership.check_leader()?;
        self.submitter.submit(cube, range).await.map_err(|e| {
            warn!(cube, %range, error = %e, "Segment build submission failed, next report retries");
            match e {
                e @ Error::BuildSubmitFailed { .. } => e,
                other => Error::BuildSubmitFailed {
                    cube: cube.to_string(),
                    reason: other.to_string(),
                },
            }
        })
    }

    fn submissions(&self) -> MutexGuard<'_, HashMap<BuildKey, Submission>> {
        self.submissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, cube: &str, range: SegmentRange) -> Option<BuildState> {
        self.topology.snapshot().builds.state(cube, range)
    }

    /// Pending keys of the committed snapshot, flagged when a submission is running
    pub fn pending(&self) -> Vec<SegmentBuildStatus> {
        let mut statuses = self.topology.snapshot().builds.pending();
        let submissions = self.submissions();
        for status in &mut statuses {
            status.submitting = submissions.contains_key(&(status.cube.clone(), status.range));
        }
        statuses
    }
}
