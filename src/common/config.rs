//! Configuration for the coordinator

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `STREAMCOORD_BIND_ADDR`
pub const ENV_PREFIX: &str = "STREAMCOORD";

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Coordinator instance ID
    pub node_id: String,

    /// Bind address for the HTTP coordination API
    pub bind_addr: SocketAddr,

    /// Address other processes use to reach this coordinator (defaults to bind_addr)
    pub advertise_addr: Option<String>,

    /// RocksDB path for the durable topology store
    pub db_path: PathBuf,

    /// Acquire cluster leadership at startup (single coordinator deployments)
    pub standalone: bool,

    /// Upper bound on a durable persist round trip
    pub persist_timeout_ms: u64,

    /// Timeout for one pause/resume directive to a worker node
    pub directive_timeout_ms: u64,

    /// Timeout for one build submission
    pub build_submit_timeout_ms: u64,

    /// Build service endpoint receiving segment build requests
    pub build_service_url: String,

    /// Path prefix of the worker node admin API
    pub node_admin_prefix: String,

    /// Number of completed segment builds remembered for deduplication
    pub build_retention: usize,

    /// Maximum accepted request body size
    pub max_body_bytes: usize,

    /// Stream sources of the cubes this cluster ingests
    pub cubes: BTreeMap<String, CubeSourceConfig>,
}

/// Stream source of one cube
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeSourceConfig {
    /// Topic the cube consumes
    pub topic: String,
    /// Number of partitions of the topic
    pub partitions: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "coord-1".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            advertise_addr: None,
            db_path: PathBuf::from("./coord-data"),
            standalone: false,
            persist_timeout_ms: 5_000,
            directive_timeout_ms: 3_000,
            build_submit_timeout_ms: 10_000,
            build_service_url: "http://localhost:7080/builds".to_string(),
            node_admin_prefix: "api/admin".to_string(),
            build_retention: 10_000,
            max_body_bytes: 4 * 1024 * 1024,
            cubes: BTreeMap::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from an optional TOML file, then apply `STREAMCOORD_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let conf: CoordinatorConfig = builder.build()?.try_deserialize()?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.persist_timeout_ms == 0
            || self.directive_timeout_ms == 0
            || self.build_submit_timeout_ms == 0
        {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.build_retention == 0 {
            return Err(Error::InvalidConfig("build_retention must be non-zero".into()));
        }

        for (cube, source) in &self.cubes {
            if source.topic.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "cube {} has an empty topic",
                    cube
                )));
            }
            if source.partitions == 0 {
                return Err(Error::InvalidConfig(format!(
                    "cube {} declares no partitions",
                    cube
                )));
            }
        }
        Ok(())
    }

    /// Address advertised as leader hint
    pub fn advertised(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.to_string())
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    pub fn directive_timeout(&self) -> Duration {
        Duration::from_millis(self.directive_timeout_ms)
    }

    pub fn build_submit_timeout(&self) -> Duration {
        Duration::from_millis(self.build_submit_timeout_ms)
    }
}
