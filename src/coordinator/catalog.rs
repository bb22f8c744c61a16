//! Cube catalog: the full partition set of each cube's stream source

use crate::common::{CubeSourceConfig, Error, Result};
use crate::coordinator::model::Partition;
use std::collections::BTreeMap;

pub trait CubeCatalog: Send + Sync {
    /// Partitions of the cube's source, in a stable order
    fn partitions(&self, cube: &str) -> Result<Vec<Partition>>;
}

/// Catalog declared in the coordinator configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCubeCatalog {
    cubes: BTreeMap<String, CubeSourceConfig>,
}

impl StaticCubeCatalog {
    pub fn new(cubes: BTreeMap<String, CubeSourceConfig>) -> Self {
        Self { cubes }
    }

    pub fn with_cube(
        mut self,
        cube: impl Into<String>,
        topic: impl Into<String>,
        partitions: u32,
    ) -> Self {
        self.cubes.insert(
            cube.into(),
            CubeSourceConfig {
                topic: topic.into(),
                partitions,
            },
        );
        self
    }
}

impl CubeCatalog for StaticCubeCatalog {
    fn partitions(&self, cube: &str) -> Result<Vec<Partition>> {
        let source = self
            .cubes
            .get(cube)
            .ok_or_else(|| Error::NotFound(format!("cube {}", cube)))?;
        Ok((0..source.partitions)
            .map(|id| Partition::new(source.topic.clone(), id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_catalog() {
        let catalog = StaticCubeCatalog::default().with_cube("orders", "orders-events", 3);
        let partitions = catalog.partitions("orders").unwrap();
        assert_eq!(
            partitions,
            vec![
                Partition::new("orders-events", 0),
                Partition::new("orders-events", 1),
                Partition::new("orders-events", 2),
            ]
        );
        assert!(matches!(catalog.partitions("clicks"), Err(Error::NotFound(_))));
    }
}
