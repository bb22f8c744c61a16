//! Durable topology persistence
//!
//! The coordinator checkpoints every committed [`TopologySnapshot`] so a
//! failover coordinator reconstructs identical state. The production backend
//! is RocksDB; an in-memory backend serves single-process and dev setups.

use crate::common::{Error, Result};
use crate::coordinator::topology::TopologySnapshot;
use async_trait::async_trait;
use rocksdb::{Options, WriteBatch, WriteOptions, DB};
use std::path::Path;
use std::sync::{Arc, Mutex};

const CF_TOPOLOGY: &str = "topology";
const KEY_CURRENT: &[u8] = b"current";
const KEY_VERSION: &[u8] = b"version";

/// Durable store collaborator: `save(snapshot)` / `load()`.
#[async_trait]
pub trait TopologyPersistence: Send + Sync {
    async fn save(&self, snapshot: &TopologySnapshot) -> Result<()>;
    async fn load(&self) -> Result<Option<TopologySnapshot>>;
}

/// RocksDB-backed topology store
pub struct RocksTopologyStore {
    db: Arc<DB>,
}

impl RocksTopologyStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_TOPOLOGY])?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Version of the last persisted snapshot
    pub fn persisted_version(&self) -> Result<Option<u64>> {
        let cf = self
            .db
            .cf_handle(CF_TOPOLOGY)
            .ok_or_else(|| Error::MetadataCorrupted("missing topology column family".into()))?;
        match self.db.get_cf(cf, KEY_VERSION)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::MetadataCorrupted("bad version record".into()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn write_snapshot(db: &DB, bytes: &[u8], version: u64) -> Result<()> {
        let cf = db
            .cf_handle(CF_TOPOLOGY)
            .ok_or_else(|| Error::MetadataCorrupted("missing topology column family".into()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, KEY_CURRENT, bytes);
        batch.put_cf(cf, KEY_VERSION, version.to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn read_snapshot(db: &DB) -> Result<Option<TopologySnapshot>> {
        let cf = db
            .cf_handle(CF_TOPOLOGY)
            .ok_or_else(|| Error::MetadataCorrupted("missing topology column family".into()))?;
        match db.get_cf(cf, KEY_CURRENT)? {
            Some(bytes) => {
                let snapshot: TopologySnapshot = bincode::deserialize(&bytes)
                    .map_err(|e| Error::MetadataCorrupted(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TopologyPersistence for RocksTopologyStore {
    async fn save(&self, snapshot: &TopologySnapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        let version = snapshot.version;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || Self::write_snapshot(&db, &bytes, version))
            .await
            .map_err(|e| Error::PersistUnavailable(e.to_string()))?
    }

    async fn load(&self) -> Result<Option<TopologySnapshot>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || Self::read_snapshot(&db))
            .await
            .map_err(|e| Error::PersistUnavailable(e.to_string()))?
    }
}

/// In-process topology store
#[derive(Default)]
pub struct MemoryTopologyStore {
    saved: Mutex<Option<Vec<u8>>>,
}

impl MemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopologyPersistence for MemoryTopologyStore {
    async fn save(&self, snapshot: &TopologySnapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| Error::PersistUnavailable("memory store poisoned".into()))?;
        *saved = Some(bytes);
        Ok(())
    }

    async fn load(&self) -> Result<Option<TopologySnapshot>> {
        let saved = self
            .saved
            .lock()
            .map_err(|_| Error::PersistUnavailable("memory store poisoned".into()))?;
        saved
            .as_deref()
            .map(|bytes| {
                bincode::deserialize(bytes).map_err(|e| Error::MetadataCorrupted(e.to_string()))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::model::{Node, ReplicaSet, SegmentRange};
    use tempfile::tempdir;

    fn sample() -> TopologySnapshot {
        let mut snapshot = TopologySnapshot {
            version: 7,
            ..Default::default()
        };
        let node = Node::new("worker-1", 9090);
        snapshot.nodes.insert(node.clone());
        let mut rs = ReplicaSet::new(0);
        rs.nodes.insert(node.clone());
        rs.leader = Some(node.clone());
        snapshot.replica_sets.insert(0, rs);
        let range = SegmentRange::new(0, 100).unwrap();
        snapshot
            .builds
            .open("orders", range, 0, [node.clone()].into_iter().collect());
        snapshot.builds.report("orders", range, &node);
        snapshot
    }

    #[tokio::test]
    async fn test_rocks_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("topology.db");

        {
            let store = RocksTopologyStore::open(&path).unwrap();
            assert!(store.load().await.unwrap().is_none());
            store.save(&sample()).await.unwrap();
            assert_eq!(store.persisted_version().unwrap(), Some(7));
        }

        let store = RocksTopologyStore::open(&path).unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryTopologyStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap(), sample());
    }
}
