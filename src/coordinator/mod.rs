//! Coordinator of the ingestion cluster
//!
//! The coordinator is responsible for:
//! - Topology management (nodes, replica sets, per-replica-set leaders)
//! - Partition assignment and rebalancing
//! - Cluster leadership gating of every mutation
//! - Triggering segment builds once a range is fully persisted
//! - Pausing and resuming cube consumers

pub mod assignment;
pub mod build_trigger;
pub mod catalog;
pub mod consumer;
pub mod http;
pub mod leadership;
pub mod metadata;
pub mod model;
pub mod node_client;
pub mod rebalance;
pub mod server;
pub mod service;
pub mod topology;

pub use server::Coordinator;
pub use service::CoordinatorService;
