//! Error types for streamcoord

use crate::coordinator::model::{Node, ReplicaSetId};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Response code: operation succeeded
pub const CODE_SUCCESS: i32 = 0;
/// Response code: the receiving process is not the active coordinator
pub const CODE_NOT_LEAD_COORDINATOR: i32 = 1;
/// Response code: request rejected by validation
pub const CODE_VALIDATION_FAILURE: i32 = 2;
/// Response code: infrastructure failure (persistence, delivery)
pub const CODE_INFRASTRUCTURE_FAILURE: i32 = 3;

/// Coarse classification used by the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller should retry against the active coordinator
    Leadership,
    /// Request is wrong; nothing was mutated
    Validation,
    /// Durable store, network or collaborator failure
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum Error {
    // === Leadership Errors ===
    #[error("not the lead coordinator (current leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    // === Validation Errors ===
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid assignment for cube {cube}: {violation}")]
    InvalidAssignment {
        cube: String,
        violation: AssignmentViolation,
    },

    #[error("invalid rebalance plan: {}", describe_plan_violations(.violations))]
    InvalidPlan { violations: BTreeMap<String, String> },

    #[error("node {node} is not a member of replica set {replica_set}")]
    NotMember {
        replica_set: ReplicaSetId,
        node: Node,
    },

    #[error("node {node} already belongs to replica set {replica_set}")]
    NodeAlreadyInReplicaSet {
        replica_set: ReplicaSetId,
        node: Node,
    },

    #[error("replica set {replica_set} still owns partitions of cubes {cubes:?}")]
    ReplicaSetInUse {
        replica_set: ReplicaSetId,
        cubes: Vec<String>,
    },

    #[error("cube {0} is already assigned")]
    AlreadyAssigned(String),

    #[error("cube {0} is not assigned")]
    NotAssigned(String),

    #[error("cannot resolve owning replica set of cube {cube} for node {node}: {reason}")]
    UnknownAssignment {
        cube: String,
        node: Node,
        reason: String,
    },

    #[error("no replica set available for assignment")]
    NoReplicaSetAvailable,

    // === Infrastructure Errors ===
    #[error("durable topology store did not answer within {0:?}")]
    PersistTimeout(Duration),

    #[error("durable topology store unavailable: {0}")]
    PersistUnavailable(String),

    #[error("directive delivery to {node} failed: {reason}")]
    DirectiveFailed { node: Node, reason: String },

    #[error("build submission for cube {cube} failed: {reason}")]
    BuildSubmitFailed { cube: String, reason: String },

    #[error("metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("coordinator answered code {code}: {msg}")]
    Rejected { code: i32, msg: String },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Why a proposed cube assignment breaks the coverage invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AssignmentViolation {
    /// Partitions of the cube owned by no replica set
    pub missing: Vec<crate::coordinator::model::Partition>,
    /// Partitions listed more than once
    pub duplicated: Vec<crate::coordinator::model::Partition>,
    /// Partitions that do not belong to the cube
    pub unexpected: Vec<crate::coordinator::model::Partition>,
    /// Referenced replica sets that do not exist
    pub unknown_replica_sets: Vec<ReplicaSetId>,
    /// Referenced replica sets without any node
    pub empty_replica_sets: Vec<ReplicaSetId>,
}

impl AssignmentViolation {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
            && self.duplicated.is_empty()
            && self.unexpected.is_empty()
            && self.unknown_replica_sets.is_empty()
            && self.empty_replica_sets.is_empty()
    }
}

impl std::fmt::Display for AssignmentViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn list<T: std::fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }

        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing partitions [{}]", list(&self.missing)));
        }
        if !self.duplicated.is_empty() {
            parts.push(format!("duplicated partitions [{}]", list(&self.duplicated)));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected partitions [{}]", list(&self.unexpected)));
        }
        if !self.unknown_replica_sets.is_empty() {
            parts.push(format!(
                "unknown replica sets [{}]",
                list(&self.unknown_replica_sets)
            ));
        }
        if !self.empty_replica_sets.is_empty() {
            parts.push(format!(
                "replica sets without nodes [{}]",
                list(&self.empty_replica_sets)
            ));
        }
        write!(f, "{}", parts.join("; "))
    }
}

fn describe_plan_violations(violations: &BTreeMap<String, String>) -> String {
    violations
        .iter()
        .map(|(cube, reason)| format!("{}: {}", cube, reason))
        .collect::<Vec<_>>()
        .join(" | ")
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotLeader { .. } => ErrorKind::Leadership,
            Error::NotFound(_)
            | Error::AlreadyExists(_)
            | Error::InvalidRequest(_)
            | Error::InvalidAssignment { .. }
            | Error::InvalidPlan { .. }
            | Error::NotMember { .. }
            | Error::NodeAlreadyInReplicaSet { .. }
            | Error::ReplicaSetInUse { .. }
            | Error::AlreadyAssigned(_)
            | Error::NotAssigned(_)
            | Error::UnknownAssignment { .. }
            | Error::NoReplicaSetAvailable
            | Error::InvalidConfig(_) => ErrorKind::Validation,
            Error::Rejected { code, .. } if *code == CODE_VALIDATION_FAILURE => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Infrastructure,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::PersistTimeout(_)
                | Error::PersistUnavailable(_)
                | Error::DirectiveFailed { .. }
                | Error::BuildSubmitFailed { .. }
        )
    }

    /// Code carried in the response envelope
    pub fn response_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Leadership => CODE_NOT_LEAD_COORDINATOR,
            ErrorKind::Validation => CODE_VALIDATION_FAILURE,
            ErrorKind::Infrastructure => CODE_INFRASTRUCTURE_FAILURE,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            // Not-leader is not a failure of the request; the envelope code tells the
            // caller to retry elsewhere.
            Error::NotLeader { .. } => StatusCode::OK,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_)
            | Error::AlreadyAssigned(_)
            | Error::NodeAlreadyInReplicaSet { .. }
            | Error::ReplicaSetInUse { .. } => StatusCode::CONFLICT,
            Error::PersistTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::PersistUnavailable(_) | Error::NoReplicaSetAvailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::DirectiveFailed { .. } | Error::BuildSubmitFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ if self.kind() == ErrorKind::Validation => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
