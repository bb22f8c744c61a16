//! Client for the coordination API
//!
//! Accepts several coordinator URLs. A not-lead-coordinator answer moves on
//! to the leader hint (or the next URL) instead of failing.

use crate::common::error::{CODE_NOT_LEAD_COORDINATOR, CODE_SUCCESS};
use crate::common::{base_url, encode_segment, Error, Result};
use crate::coordinator::http::CoordinatorResponse;
use crate::coordinator::model::{Node, Partition, RebalancePlan, ReplicaSetId};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

pub struct CoordinatorClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl CoordinatorClient {
    pub fn new(endpoints: &[String], timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::InvalidRequest("no coordinator endpoint given".into()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoints: endpoints.iter().map(|e| base_url(e)).collect(),
        })
    }

    /// Send one request, following leader hints across coordinators
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let mut queue: VecDeque<String> = self.endpoints.iter().cloned().collect();
        let mut tried: Vec<String> = Vec::new();
        let mut last_error = Error::Http("no coordinator reachable".into());

        while let Some(endpoint) = queue.pop_front() {
            if tried.contains(&endpoint) {
                continue;
            }
            tried.push(endpoint.clone());

            let mut request = self.http.request(method.clone(), format!("{}{}", endpoint, path));
            if let Some(body) = &body {
                request = request.json(body);
            }
            let envelope = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match response.json::<CoordinatorResponse>().await {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            return Err(Error::Http(format!(
                                "{} answered {} without a response envelope: {}",
                                endpoint, status, e
                            )))
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(%endpoint, error = %e, "Coordinator unreachable");
                    last_error = e.into();
                    continue;
                }
            };

            match envelope.code {
                CODE_SUCCESS => {
                    let data = envelope.data.unwrap_or(Value::Null);
                    return serde_json::from_value(data)
                        .map_err(|e| Error::Internal(format!("unexpected response data: {}", e)));
                }
                CODE_NOT_LEAD_COORDINATOR => {
                    let hint = envelope
                        .data
                        .as_ref()
                        .and_then(|d| d.get("leader"))
                        .and_then(Value::as_str)
                        .map(base_url);
                    tracing::debug!(
                        %endpoint,
                        leader = ?hint,
                        "Not the lead coordinator, retrying"
                    );
                    last_error = Error::NotLeader {
                        leader: hint.clone(),
                    };
                    if let Some(leader) = hint {
                        queue.push_front(leader);
                    }
                }
                code => {
                    return Err(Error::Rejected {
                        code,
                        msg: envelope.msg.unwrap_or_default(),
                    })
                }
            }
        }
        Err(last_error)
    }

    // === Reads ===

    pub async fn health(&self) -> Result<Value> {
        self.call(Method::GET, "/health", None).await
    }

    pub async fn topology(&self) -> Result<Value> {
        self.call(Method::GET, "/topology", None).await
    }

    pub async fn assignment(&self, cube: &str) -> Result<Value> {
        self.call(Method::GET, &format!("/cubes/{}/assignment", encode_segment(cube)), None)
            .await
    }

    pub async fn replica_sets(&self) -> Result<Value> {
        self.call(Method::GET, "/replica_sets", None).await
    }

    pub async fn pending_segments(&self) -> Result<Value> {
        self.call(Method::GET, "/segments/pending", None).await
    }

    // === Rebalance ===

    pub async fn recommend(&self) -> Result<RebalancePlan> {
        self.call(Method::GET, "/rebalance/recommend", None).await
    }

    pub async fn apply(&self, plan: &RebalancePlan) -> Result<Value> {
        let body = serde_json::to_value(plan)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.call(Method::POST, "/rebalance/apply", Some(body)).await
    }

    // === Cubes ===

    pub async fn assign(&self, cube: &str) -> Result<Value> {
        self.call(Method::POST, &format!("/cubes/{}/assignment", encode_segment(cube)), None)
            .await
    }

    pub async fn unassign(&self, cube: &str) -> Result<Value> {
        self.call(Method::DELETE, &format!("/cubes/{}/assignment", encode_segment(cube)), None)
            .await
    }

    pub async fn reassign(
        &self,
        cube: &str,
        replica_sets: &BTreeMap<ReplicaSetId, Vec<Partition>>,
    ) -> Result<Value> {
        self.call(
            Method::PUT,
            &format!("/cubes/{}/assignment", encode_segment(cube)),
            Some(json!({ "replica_sets": replica_sets })),
        )
        .await
    }

    pub async fn pause(&self, cube: &str) -> Result<Value> {
        self.call(Method::POST, &format!("/cubes/{}/pause", encode_segment(cube)), None)
            .await
    }

    pub async fn resume(&self, cube: &str) -> Result<Value> {
        self.call(Method::POST, &format!("/cubes/{}/resume", encode_segment(cube)), None)
            .await
    }

    // === Replica sets and nodes ===

    pub async fn create_replica_set(
        &self,
        id: Option<ReplicaSetId>,
        nodes: &[Node],
    ) -> Result<Value> {
        self.call(
            Method::POST,
            "/replica_sets",
            Some(json!({ "id": id, "nodes": nodes })),
        )
        .await
    }

    pub async fn delete_replica_set(&self, id: ReplicaSetId) -> Result<Value> {
        self.call(Method::DELETE, &format!("/replica_sets/{}", id), None)
            .await
    }

    pub async fn add_node(&self, id: ReplicaSetId, node: &Node) -> Result<Value> {
        self.call(
            Method::PUT,
            &format!("/replica_sets/{}/nodes/{}", id, encode_segment(&node.to_string())),
            None,
        )
        .await
    }

    pub async fn remove_node(&self, id: ReplicaSetId, node: &Node) -> Result<Value> {
        self.call(
            Method::DELETE,
            &format!("/replica_sets/{}/nodes/{}", id, encode_segment(&node.to_string())),
            None,
        )
        .await
    }

    pub async fn change_leader(&self, id: ReplicaSetId, node: &Node) -> Result<Value> {
        self.call(
            Method::PUT,
            &format!("/replica_sets/{}/leader", id),
            Some(json!({ "node": node })),
        )
        .await
    }

    pub async fn register_node(&self, node: &Node) -> Result<Value> {
        self.call(Method::POST, "/nodes", Some(json!({ "node": node })))
            .await
    }

    pub async fn unregister_node(&self, node: &Node) -> Result<Value> {
        self.call(Method::DELETE, &format!("/nodes/{}", encode_segment(&node.to_string())), None)
            .await
    }

    // === Builds ===

    pub async fn remote_store_complete(
        &self,
        cube: &str,
        start: i64,
        end: i64,
        node: &Node,
    ) -> Result<Value> {
        self.call(
            Method::POST,
            "/segments/remote_store_complete",
            Some(json!({
                "cube": cube,
                "segment_start": start,
                "segment_end": end,
                "node": node,
            })),
        )
        .await
    }

    // === Admin ===

    /// Push election state to one coordinator, without leader retry
    pub async fn set_leadership(
        &self,
        endpoint: &str,
        is_leader: bool,
        leader: Option<&str>,
    ) -> Result<Value> {
        let response = self
            .http
            .put(format!("{}/admin/leadership", base_url(endpoint)))
            .json(&json!({ "is_leader": is_leader, "leader": leader }))
            .send()
            .await?
            .json::<CoordinatorResponse>()
            .await?;
        if response.code != CODE_SUCCESS {
            return Err(Error::Rejected {
                code: response.code,
                msg: response.msg.unwrap_or_default(),
            });
        }
        Ok(response.data.unwrap_or(Value::Null))
    }
}
