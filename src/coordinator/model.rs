//! Cluster topology model
//!
//! Nodes, replica sets, stream partitions, cube assignments and the
//! rebalance plan format exchanged with operators.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type ReplicaSetId = u32;

/// Target ownership after a rebalance: replica set → cube → partitions.
pub type RebalancePlan = BTreeMap<ReplicaSetId, BTreeMap<String, Vec<Partition>>>;

/// A worker node, identified by `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Node {
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Node {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidRequest(format!("node id {:?} is not host:port", s)))?;
        if host.is_empty() {
            return Err(Error::InvalidRequest(format!("node id {:?} has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidRequest(format!("node id {:?} has an invalid port", s)))?;
        Ok(Node::new(host, port))
    }
}

impl TryFrom<String> for Node {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Node> for String {
    fn from(node: Node) -> Self {
        node.to_string()
    }
}

/// One shard of a cube's stream source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub topic: String,
    pub id: u32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, id: u32) -> Self {
        Self {
            topic: topic.into(),
            id,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.id)
    }
}

/// A group of worker nodes jointly owning a set of partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub id: ReplicaSetId,
    pub nodes: BTreeSet<Node>,
    /// Always a member of `nodes` when set
    pub leader: Option<Node>,
}

impl ReplicaSet {
    pub fn new(id: ReplicaSetId) -> Self {
        Self {
            id,
            nodes: BTreeSet::new(),
            leader: None,
        }
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.contains(node)
    }

    /// Replica sets without nodes cannot own partitions
    pub fn can_own_partitions(&self) -> bool {
        !self.nodes.is_empty()
    }
}

/// Partitions of one cube, keyed by owning replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeAssignment {
    pub cube: String,
    pub replica_sets: BTreeMap<ReplicaSetId, Vec<Partition>>,
}

impl CubeAssignment {
    pub fn new(cube: impl Into<String>) -> Self {
        Self {
            cube: cube.into(),
            replica_sets: BTreeMap::new(),
        }
    }

    /// Every partition of the cube
    pub fn partitions(&self) -> BTreeSet<Partition> {
        self.replica_sets.values().flatten().cloned().collect()
    }

    pub fn partition_count(&self) -> usize {
        self.replica_sets.values().map(Vec::len).sum()
    }

    pub fn partitions_of(&self, replica_set: ReplicaSetId) -> &[Partition] {
        self.replica_sets
            .get(&replica_set)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn owner_of(&self, partition: &Partition) -> Option<ReplicaSetId> {
        self.replica_sets
            .iter()
            .find(|(_, partitions)| partitions.contains(partition))
            .map(|(id, _)| *id)
    }

    pub fn owns(&self, replica_set: ReplicaSetId) -> bool {
        !self.partitions_of(replica_set).is_empty()
    }

    /// Sort partition lists and drop replica sets owning nothing
    pub fn normalize(mut self) -> Self {
        self.replica_sets.retain(|_, partitions| !partitions.is_empty());
        for partitions in self.replica_sets.values_mut() {
            partitions.sort();
        }
        self
    }
}

/// Desired run state of a cube's consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Running,
    Paused,
}

impl ConsumerState {
    pub fn directive(self) -> Directive {
        match self {
            ConsumerState::Running => Directive::Resume,
            ConsumerState::Paused => Directive::Pause,
        }
    }
}

/// Instruction sent to the nodes consuming a cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    Pause,
    Resume,
}

impl Directive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Directive::Pause => "pause",
            Directive::Resume => "resume",
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open `[start, end)` interval of a cube's data forming one build unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentRange {
    pub start: i64,
    pub end: i64,
}

impl SegmentRange {
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidRequest(format!(
                "segment range [{}, {}) is empty",
                start, end
            )));
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for SegmentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
