//! The operator client follows leader hints across coordinators

mod common;

use common::{harness, Harness};
use std::time::Duration;
use streamcoord::coordinator::http::{create_router, CoordState};
use streamcoord::coordinator::model::Node;
use streamcoord::{CoordinatorClient, Error};
use tokio::net::TcpListener;

async fn spawn(h: &Harness) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(
        CoordState {
            service: h.service.clone(),
            election: h.election.clone(),
        },
        64 * 1024,
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

#[tokio::test]
async fn test_client_retries_against_leader_hint() {
    let leader = harness().await;
    let standby = harness().await;
    let leader_addr = spawn(&leader).await;
    let standby_addr = spawn(&standby).await;
    standby.election.release(Some(leader_addr.clone()));

    let client = CoordinatorClient::new(&[standby_addr], Duration::from_secs(5)).unwrap();
    client.register_node(&Node::new("a", 9000)).await.unwrap();
    client
        .create_replica_set(Some(1), &[Node::new("a", 9000)])
        .await
        .unwrap();

    assert!(leader.service.replica_set(1).is_ok());
    assert!(standby.service.replica_sets().is_empty());
}

#[tokio::test]
async fn test_client_reports_validation_errors() {
    let leader = harness().await;
    let addr = spawn(&leader).await;
    let client = CoordinatorClient::new(&[addr], Duration::from_secs(5)).unwrap();

    match client.assign("x").await {
        Err(Error::Rejected { code, msg }) => {
            assert_eq!(code, 2);
            assert!(msg.contains("no replica set available"));
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_gives_up_without_leader() {
    let standby = harness().await;
    standby.election.release(None);
    let addr = spawn(&standby).await;
    let client = CoordinatorClient::new(&[addr], Duration::from_secs(5)).unwrap();

    assert!(matches!(
        client.pause("x").await,
        Err(Error::NotLeader { leader: None })
    ));
}

#[tokio::test]
async fn test_client_encodes_cube_names() {
    let leader = harness().await;
    let addr = spawn(&leader).await;
    let client = CoordinatorClient::new(&[addr], Duration::from_secs(5)).unwrap();
    client.register_node(&Node::new("a", 9000)).await.unwrap();
    client
        .create_replica_set(Some(1), &[Node::new("a", 9000)])
        .await
        .unwrap();

    let cube = "sales eu/2026?v=2#x";
    let assigned = client.assign(cube).await.unwrap();
    assert_eq!(assigned["cube"], cube);

    let fetched = client.assignment(cube).await.unwrap();
    assert_eq!(fetched["cube"], cube);
    assert!(leader.service.assignment(cube).is_ok());
    assert!(leader.service.assignment("sales eu").is_err());
}

#[tokio::test]
async fn test_client_reports_non_envelope_answers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let app = axum::Router::new().route(
        "/topology",
        axum::routing::get(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream gone") }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = CoordinatorClient::new(&[addr], Duration::from_secs(5)).unwrap();
    match client.topology().await {
        Err(Error::Http(msg)) => {
            assert!(msg.contains("502"));
            assert!(msg.contains("without a response envelope"));
        }
        other => panic!("expected Http error, got {:?}", other),
    }
}
