//! # streamcoord
//!
//! Control plane of a real-time ingestion cluster:
//! - Replica sets of worker nodes consume stream partitions of each cube
//! - A single active coordinator assigns and rebalances those partitions
//! - Every topology change is persisted to RocksDB before it is published
//! - Segment builds fire once every replica of a range has persisted it
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Coordinator (active leader)       │
//! │  topology store ─ assignment ─ rebalance │
//! │  leadership ─ build trigger ─ consumers  │
//! └───────┬───────────────────────┬──────────┘
//!         │ pause / resume        │ submit build
//!   ┌─────┴──────────┐      ┌─────▼─────────┐
//!   │ Replica set 1  │ ...  │ Build service │
//!   │ (nodes A, B)   │      └───────────────┘
//!   └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! streamcoord-coord serve \
//!   --config ./coord.toml \
//!   --bind 0.0.0.0:7070 \
//!   --db ./coord-data \
//!   --standalone
//! ```
//!
//! ### Use the CLI
//! ```bash
//! streamcoord --coordinator http://localhost:7070 replica-set create --node worker-1:9090
//! streamcoord assign orders
//! streamcoord rebalance recommend
//! streamcoord pause orders
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{CoordinatorConfig, Error, ErrorKind, Result};
pub use coordinator::{Coordinator, CoordinatorService};
pub use ops::CoordinatorClient;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
