//! Segment build triggering from remote-store-complete reports

mod common;

use common::{harness, harness_with, node, nodes, with_replica_sets, Harness};
use std::collections::BTreeMap;
use std::sync::Arc;
use streamcoord::coordinator::build_trigger::BuildState;
use streamcoord::coordinator::metadata::MemoryTopologyStore;
use streamcoord::coordinator::model::{Partition, SegmentRange};
use streamcoord::Error;

fn range() -> SegmentRange {
    SegmentRange::new(0, 100).unwrap()
}

/// Cube x on replica sets 1 = {a, b} and 2 = {c}
async fn cluster() -> Harness {
    let h = harness().await;
    with_replica_sets(&h.service, &[(1, &["a", "b"]), (2, &["c"])]).await;
    h.service.assign_cube("x").await.unwrap();
    h
}

#[tokio::test]
async fn test_build_fires_once_after_full_replica_set() {
    let h = cluster().await;

    let first = h.service.remote_store_complete("x", range(), &node("a")).await.unwrap();
    assert!(first.is_none());
    let duplicate = h.service.remote_store_complete("x", range(), &node("a")).await.unwrap();
    assert!(duplicate.is_none());
    assert_eq!(h.builds.count(), 0);

    let third = h.service.remote_store_complete("x", range(), &node("b")).await.unwrap();
    assert!(third.is_some());
    assert_eq!(h.builds.count(), 1);
    assert_eq!(h.builds.submitted.lock().unwrap()[0], ("x".to_string(), range()));

    // late reports after the build are no-ops
    for n in ["a", "b"] {
        assert!(h.service.remote_store_complete("x", range(), &node(n)).await.unwrap().is_none());
    }
    assert_eq!(h.builds.count(), 1);
    assert!(h.service.pending_builds().is_empty());
}

#[tokio::test]
async fn test_report_order_does_not_matter() {
    let orders: [&[&str]; 4] = [
        &["a", "b"],
        &["b", "a"],
        &["b", "b", "a", "a"],
        &["a", "a", "a", "b", "b"],
    ];
    for order in orders {
        let h = cluster().await;
        for n in order {
            h.service.remote_store_complete("x", range(), &node(n)).await.unwrap();
        }
        assert_eq!(h.builds.count(), 1, "order {:?}", order);
    }
}

#[tokio::test]
async fn test_concurrent_reports_fire_once() {
    let h = cluster().await;
    let mut tasks = Vec::new();
    for n in ["a", "b", "a", "b", "a", "b"] {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move {
            service.remote_store_complete("x", range(), &node(n)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(h.builds.count(), 1);
}

#[tokio::test]
async fn test_single_node_replica_set_fires_immediately() {
    let h = cluster().await;
    let job = h.service.remote_store_complete("x", range(), &node("c")).await.unwrap();
    assert!(job.is_some());
}

#[tokio::test]
async fn test_ranges_are_tracked_independently() {
    let h = cluster().await;
    let other = SegmentRange::new(100, 200).unwrap();
    h.service.remote_store_complete("x", range(), &node("a")).await.unwrap();
    h.service.remote_store_complete("x", other, &node("b")).await.unwrap();
    assert_eq!(h.builds.count(), 0);

    let pending = h.service.pending_builds();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|p| p.state == BuildState::PartiallyReported));
}

#[tokio::test]
async fn test_unresolvable_reports_are_rejected() {
    let h = cluster().await;
    h.service.register_node(node("loner")).await.unwrap();

    for (cube, n) in [("y", "a"), ("x", "loner"), ("x", "ghost")] {
        assert!(matches!(
            h.service.remote_store_complete(cube, range(), &node(n)).await,
            Err(Error::UnknownAssignment { .. })
        ));
    }
    assert!(h.service.pending_builds().is_empty());
}

#[tokio::test]
async fn test_failed_submission_retries_on_next_report() {
    let h = cluster().await;
    h.builds.fail(true);
    h.service.remote_store_complete("x", range(), &node("a")).await.unwrap();
    assert!(matches!(
        h.service.remote_store_complete("x", range(), &node("b")).await,
        Err(Error::BuildSubmitFailed { .. })
    ));
    let pending = h.service.pending_builds();
    assert_eq!(pending[0].state, BuildState::ReadyToBuild);

    h.builds.fail(false);
    let job = h.service.remote_store_complete("x", range(), &node("b")).await.unwrap();
    assert!(job.is_some());
    assert_eq!(h.builds.count(), 1);
}

#[tokio::test]
async fn test_expected_reporters_fixed_at_first_report() {
    let h = cluster().await;
    h.service.remote_store_complete("x", range(), &node("a")).await.unwrap();

    // a node joining after the first report is not waited for
    h.service.register_node(node("d")).await.unwrap();
    h.service.add_node(1, node("d")).await.unwrap();
    h.service.remote_store_complete("x", range(), &node("d")).await.unwrap();
    assert_eq!(h.builds.count(), 0);

    h.service.remote_store_complete("x", range(), &node("b")).await.unwrap();
    assert_eq!(h.builds.count(), 1);
}

#[tokio::test]
async fn test_reports_survive_failover() {
    let shared = Arc::new(MemoryTopologyStore::new());
    let first = harness_with(shared.clone(), true).await;
    let second = harness_with(shared.clone(), false).await;
    with_replica_sets(&first.service, &[(1, &["a", "b"]), (2, &["c"])]).await;
    first.service.assign_cube("x").await.unwrap();
    first.service.remote_store_complete("x", range(), &node("a")).await.unwrap();

    first.election.release(Some("coord-2:7070".into()));
    second.election.acquire();
    second.service.on_leadership_gained().await.unwrap();

    let pending = second.service.pending_builds();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].reported, nodes(&["a"]));

    // a never reports again; b alone completes the range on the new leader
    let job = second.service.remote_store_complete("x", range(), &node("b")).await.unwrap();
    assert!(job.is_some());
    assert_eq!(first.builds.count() + second.builds.count(), 1);
    assert!(second.service.pending_builds().is_empty());
}

#[tokio::test]
async fn test_fired_build_survives_leadership_flip() {
    let h = cluster().await;
    for n in ["a", "b"] {
        h.service.remote_store_complete("x", range(), &node(n)).await.unwrap();
    }
    assert_eq!(h.builds.count(), 1);

    h.election.release(Some("coord-2:7070".into()));
    h.service.on_leadership_lost().await;
    h.election.acquire();
    h.service.on_leadership_gained().await.unwrap();

    for n in ["a", "b", "a"] {
        assert!(h.service.remote_store_complete("x", range(), &node(n)).await.unwrap().is_none());
    }
    assert_eq!(h.builds.count(), 1);
    assert_eq!(h.service.snapshot().builds.state("x", range()), Some(BuildState::ReadyToBuild));
}

#[tokio::test]
async fn test_status_reads_do_not_wait_for_submission() {
    let h = cluster().await;
    h.builds.hold(true);
    h.service.remote_store_complete("x", range(), &node("a")).await.unwrap();

    let service = h.service.clone();
    let submitting =
        tokio::spawn(async move { service.remote_store_complete("x", range(), &node("b")).await });
    h.builds.started.notified().await;

    // the submission is parked inside the build service
    let status = h.service.status();
    assert_eq!(status.pending_builds, 1);
    let pending = h.service.pending_builds();
    assert_eq!(pending[0].state, BuildState::ReadyToBuild);
    assert!(pending[0].submitting);

    // a report racing the submission does not submit again
    let racing = h.service.remote_store_complete("x", range(), &node("a")).await.unwrap();
    assert!(racing.is_none());

    h.builds.release.notify_one();
    let job = submitting.await.unwrap().unwrap();
    assert!(job.is_some());
    assert_eq!(h.builds.count(), 1);
    assert!(h.service.pending_builds().is_empty());
}

#[tokio::test]
async fn test_unassign_drops_unfinished_reports() {
    let h = cluster().await;
    h.service.remote_store_complete("x", range(), &node("a")).await.unwrap();
    h.service.unassign_cube("x").await.unwrap();
    assert!(h.service.pending_builds().is_empty());

    // the cube moved entirely to replica set 2 meanwhile
    h.service.assign_cube("x").await.unwrap();
    let mut moved = BTreeMap::new();
    moved.insert(2, (0..4).map(|i| Partition::new("x-events", i)).collect::<Vec<_>>());
    h.service.reassign_cube("x", moved).await.unwrap();
    assert!(matches!(
        h.service.remote_store_complete("x", range(), &node("b")).await,
        Err(Error::UnknownAssignment { .. })
    ));
}
