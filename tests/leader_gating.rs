//! A standby coordinator refuses every mutation and changes nothing

mod common;

use common::{harness_with, node, with_replica_sets};
use std::collections::BTreeMap;
use std::sync::Arc;
use streamcoord::coordinator::metadata::MemoryTopologyStore;
use streamcoord::coordinator::model::{Partition, SegmentRange};
use streamcoord::coordinator::service::ReplicaSetDescriptor;
use streamcoord::{Error, ErrorKind};

fn assert_not_leader<T: std::fmt::Debug>(result: streamcoord::Result<T>) {
    match result {
        Err(e @ Error::NotLeader { .. }) => {
            assert_eq!(e.kind(), ErrorKind::Leadership);
            assert!(e.is_retryable());
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }
}

#[tokio::test]
async fn test_every_mutation_is_gated() {
    let h = harness_with(Arc::new(MemoryTopologyStore::new()), true).await;
    with_replica_sets(&h.service, &[(1, &["a", "b"]), (2, &["c"])]).await;
    h.service.register_node(node("d")).await.unwrap();
    h.service.assign_cube("x").await.unwrap();
    let plan = h.service.recommend_rebalance().unwrap();

    h.election.release(Some("coord-2:7070".into()));
    let before = h.service.snapshot();
    let s = &h.service;

    assert_not_leader(s.assign_cube("y").await);
    assert_not_leader(s.unassign_cube("x").await);
    let mut proposed = BTreeMap::new();
    proposed.insert(
        1,
        (0..4).map(|i| Partition::new("x-events", i)).collect::<Vec<_>>(),
    );
    assert_not_leader(s.reassign_cube("x", proposed).await);
    assert_not_leader(s.apply_rebalance(&plan).await);
    assert_not_leader(s.create_replica_set(ReplicaSetDescriptor::default()).await);
    assert_not_leader(s.delete_replica_set(2).await);
    assert_not_leader(s.add_node(2, node("d")).await);
    assert_not_leader(s.remove_node(1, node("a")).await);
    assert_not_leader(s.change_leader(1, node("a")).await);
    assert_not_leader(s.register_node(node("e")).await);
    assert_not_leader(s.unregister_node(node("d")).await);
    assert_not_leader(s.pause("x").await);
    assert_not_leader(s.resume("x").await);
    assert_not_leader(
        s.remote_store_complete("x", SegmentRange::new(0, 100).unwrap(), &node("a"))
            .await,
    );

    assert_eq!(*s.snapshot(), *before);
    assert!(h.directives.take().is_empty());
    assert_eq!(h.builds.count(), 0);
}

#[tokio::test]
async fn test_not_leader_carries_leader_hint() {
    let h = harness_with(Arc::new(MemoryTopologyStore::new()), false).await;
    h.election.release(Some("coord-2:7070".into()));

    match h.service.assign_cube("x").await {
        Err(Error::NotLeader { leader }) => assert_eq!(leader.as_deref(), Some("coord-2:7070")),
        other => panic!("expected NotLeader, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reads_stay_available_on_standby() {
    let h = harness_with(Arc::new(MemoryTopologyStore::new()), true).await;
    with_replica_sets(&h.service, &[(1, &["a"])]).await;
    h.service.assign_cube("y").await.unwrap();
    h.election.release(None);

    assert!(h.service.assignment("y").is_ok());
    assert_eq!(h.service.replica_sets().len(), 1);
    assert!(h.service.recommend_rebalance().is_ok());
    assert!(!h.service.status().is_leader);
}
