//! Outbound collaborators: worker node directives and build submission

use crate::common::{base_url, encode_segment, Error, Result};
use crate::coordinator::model::{Directive, Node, SegmentRange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Handle of a submitted segment build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node directive channel: `sendPauseResume(node, cube, directive)`.
#[async_trait]
pub trait DirectiveSender: Send + Sync {
    async fn send(&self, node: &Node, cube: &str, directive: Directive) -> Result<()>;
}

/// Build-job submission: `submitBuild(cube, range)`.
#[async_trait]
pub trait BuildSubmitter: Send + Sync {
    async fn submit(&self, cube: &str, range: SegmentRange) -> Result<JobHandle>;
}

/// Sends directives to the worker node admin API
pub struct HttpDirectiveSender {
    client: reqwest::Client,
    admin_prefix: String,
}

impl HttpDirectiveSender {
    pub fn new(admin_prefix: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            admin_prefix: admin_prefix.into().trim_matches('/').to_string(),
        })
    }

    pub fn directive_url(&self, node: &Node, cube: &str, directive: Directive) -> String {
        format!(
            "{}/{}/consumers/{}/{}",
            base_url(&node.to_string()),
            self.admin_prefix,
            encode_segment(cube),
            directive
        )
    }
}

#[async_trait]
impl DirectiveSender for HttpDirectiveSender {
    async fn send(&self, node: &Node, cube: &str, directive: Directive) -> Result<()> {
        let url = self.directive_url(node, cube, directive);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::DirectiveFailed {
                node: node.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::DirectiveFailed {
                node: node.clone(),
                reason: format!("{} answered {}", url, response.status()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct BuildRequest<'a> {
    cube: &'a str,
    segment_start: i64,
    segment_end: i64,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    job_id: Option<String>,
}

/// Posts build requests to the build service
pub struct HttpBuildSubmitter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBuildSubmitter {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl BuildSubmitter for HttpBuildSubmitter {
    async fn submit(&self, cube: &str, range: SegmentRange) -> Result<JobHandle> {
        let failed = |reason: String| Error::BuildSubmitFailed {
            cube: cube.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&BuildRequest {
                cube,
                segment_start: range.start,
                segment_end: range.end,
            })
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("build service answered {}", status)));
        }

        // An empty or non-JSON body still means the build was accepted
        let job_id = response
            .json::<BuildResponse>()
            .await
            .ok()
            .and_then(|r| r.job_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(JobHandle(job_id))
    }
}
