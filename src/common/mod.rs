//! Common utilities and types shared across streamcoord

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::{CoordinatorConfig, CubeSourceConfig};
pub use error::{AssignmentViolation, Error, ErrorKind, Result};
pub use utils::{base_url, encode_segment, parse_duration};
