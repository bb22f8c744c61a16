//! Replica set membership and per-replica-set leadership

mod common;

use common::{harness, node, with_replica_sets};
use streamcoord::coordinator::model::Partition;
use streamcoord::coordinator::service::ReplicaSetDescriptor;
use streamcoord::Error;

#[tokio::test]
async fn test_remove_leader_then_change_leader() {
    let h = harness().await;
    with_replica_sets(&h.service, &[(1, &["a", "b"]), (2, &["c"])]).await;
    h.service.change_leader(1, node("a")).await.unwrap();

    let rs = h.service.remove_node(1, node("a")).await.unwrap();
    assert_eq!(rs.leader, None);

    let rs = h.service.change_leader(1, node("b")).await.unwrap();
    assert_eq!(rs.leader, Some(node("b")));

    assert!(matches!(
        h.service.change_leader(1, node("c")).await,
        Err(Error::NotMember { replica_set: 1, .. })
    ));
    assert_eq!(h.service.replica_set(1).unwrap().leader, Some(node("b")));
}

#[tokio::test]
async fn test_node_belongs_to_one_replica_set() {
    let h = harness().await;
    with_replica_sets(&h.service, &[(1, &["a", "b"]), (2, &["c"])]).await;

    assert!(matches!(
        h.service.add_node(2, node("a")).await,
        Err(Error::NodeAlreadyInReplicaSet { replica_set: 1, .. })
    ));
    // re-adding is a no-op
    let version = h.service.snapshot().version;
    h.service.add_node(1, node("a")).await.unwrap();
    assert_eq!(h.service.snapshot().version, version);

    // unregistered nodes cannot join
    assert!(matches!(
        h.service.add_node(2, node("z")).await,
        Err(Error::NotFound(_))
    ));

    h.service.remove_node(1, node("a")).await.unwrap();
    let rs = h.service.add_node(2, node("a")).await.unwrap();
    assert!(rs.contains(&node("a")));
}

#[tokio::test]
async fn test_create_and_delete_replica_sets() {
    let h = harness().await;
    let first = h
        .service
        .create_replica_set(ReplicaSetDescriptor::default())
        .await
        .unwrap();
    assert_eq!(first.id, 0);
    let second = h
        .service
        .create_replica_set(ReplicaSetDescriptor::default())
        .await
        .unwrap();
    assert_eq!(second.id, 1);
    assert!(matches!(
        h.service
            .create_replica_set(ReplicaSetDescriptor {
                id: Some(1),
                nodes: vec![],
            })
            .await,
        Err(Error::AlreadyExists(_))
    ));

    h.service.delete_replica_set(0).await.unwrap();
    assert!(matches!(
        h.service.delete_replica_set(0).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_replica_set_owning_partitions_cannot_be_deleted() {
    let h = harness().await;
    with_replica_sets(&h.service, &[(1, &["a"])]).await;
    h.service.assign_cube("y").await.unwrap();

    match h.service.delete_replica_set(1).await {
        Err(Error::ReplicaSetInUse { cubes, .. }) => assert_eq!(cubes, vec!["y".to_string()]),
        other => panic!("expected ReplicaSetInUse, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unregister_node_leaves_replica_set() {
    let h = harness().await;
    with_replica_sets(&h.service, &[(1, &["a", "b"])]).await;
    h.service.change_leader(1, node("b")).await.unwrap();

    assert_eq!(h.service.unregister_node(node("b")).await.unwrap(), Some(1));
    let rs = h.service.replica_set(1).unwrap();
    assert_eq!(rs.leader, None);
    assert!(!rs.contains(&node("b")));
    assert!(matches!(
        h.service.unregister_node(node("b")).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_joining_node_receives_pause_for_paused_cube() {
    let h = harness().await;
    with_replica_sets(&h.service, &[(1, &["a"])]).await;
    h.service.register_node(node("n")).await.unwrap();
    let assignment = h.service.assign_cube("y").await.unwrap();
    assert_eq!(
        assignment.partitions_of(1),
        &[Partition::new("y-events", 0), Partition::new("y-events", 1)]
    );
    h.service.pause("y").await.unwrap();
    h.directives.take();

    h.service.add_node(1, node("n")).await.unwrap();
    let sent = h.directives.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, node("n"));
    assert_eq!(sent[0].1, "y");
}
