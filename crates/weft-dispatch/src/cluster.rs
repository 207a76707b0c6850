//! Cluster job backend over a small HTTP job API.
//!
//! ```text
//! GET    /healthz
//! POST   /jobs               UnitSpec        -> {"id": "..."}
//! POST   /jobs/{id}/start
//! GET    /jobs/{id}                          -> {"state": "...", "exit_code": n}
//! GET    /jobs/{id}/logs                     -> {"stdout": "...", "stderr": "..."}
//! POST   /jobs/{id}/stop     {"grace_secs": n}
//! POST   /jobs/{id}/kill
//! DELETE /jobs/{id}
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use weft_core::config::ClusterConfig;
use weft_core::error::{Result, TransportError, TransportResult, WeftError};
use weft_core::traits::{NodeCompute, ProviderExecutor, UnitRuntime};
use weft_core::types::{
    DispatchStatus, ExecutionRequest, ExecutionResult, ProviderKind, TransportErrorKind, UnitLogs,
    UnitPhase, UnitSpec,
};

use crate::remote::{self, AttemptLimits, RemoteAttempt, Settlement};

const STOP_GRACE_SECS: u64 = 10;

#[derive(Deserialize)]
struct JobCreated {
    id: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    state: JobState,
    #[serde(default)]
    exit_code: Option<i64>,
}

fn http_error(phase: UnitPhase, e: reqwest::Error) -> TransportError {
    let kind = if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if matches!(e.status(), Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)) {
        TransportErrorKind::AuthError
    } else if e.is_connect() {
        match TransportErrorKind::from_message(&format!("{:?}", e)) {
            TransportErrorKind::Other => TransportErrorKind::SocketUnreachable,
            kind => kind,
        }
    } else {
        TransportErrorKind::from_message(&e.to_string())
    };
    TransportError::new(kind, phase, e.to_string())
}

/// Cluster job runtime speaking the HTTP job API.
pub struct ClusterJobRuntime {
    client: Client,
    base_url: String,
    token: Option<String>,
    poll_interval: Duration,
}

impl ClusterJobRuntime {
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| WeftError::Config(format!("cluster HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, phase: UnitPhase, req: RequestBuilder) -> TransportResult<Response> {
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| http_error(phase, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let kind = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportErrorKind::AuthError,
            StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Other,
        };
        Err(TransportError::new(kind, phase, format!("HTTP {}: {}", status, body)))
    }

    /// Teardown requests treat a missing job as already gone.
    async fn send_teardown(&self, req: RequestBuilder) -> TransportResult<()> {
        match self.send(UnitPhase::Remove, req).await {
            Ok(_) => Ok(()),
            Err(e) if e.message.starts_with("HTTP 404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn poll_delay(&self) -> Duration {
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        self.poll_interval.mul_f64(jitter)
    }
}

impl UnitRuntime for ClusterJobRuntime {
    fn name(&self) -> &str {
        "cluster-job"
    }

    fn probe(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            let req = self.client.get(self.url("/healthz"));
            self.send(UnitPhase::Probe, req).await.map(|_| ())
        })
    }

    fn create(&self, spec: &UnitSpec) -> BoxFuture<'_, TransportResult<String>> {
        let spec = spec.clone();
        Box::pin(async move {
            let req = self.client.post(self.url("/jobs")).json(&spec);
            let resp = self.send(UnitPhase::Create, req).await?;
            let created: JobCreated = resp
                .json()
                .await
                .map_err(|e| http_error(UnitPhase::Create, e))?;
            Ok(created.id)
        })
    }

    fn start(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let url = self.url(&format!("/jobs/{}/start", unit_id));
        Box::pin(async move {
            self.send(UnitPhase::Start, self.client.post(url))
                .await
                .map(|_| ())
        })
    }

    fn wait(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<i64>> {
        let url = self.url(&format!("/jobs/{}", unit_id));
        Box::pin(async move {
            loop {
                let resp = self.send(UnitPhase::Wait, self.client.get(&url)).await?;
                let status: JobStatus = resp
                    .json()
                    .await
                    .map_err(|e| http_error(UnitPhase::Wait, e))?;
                match status.state {
                    JobState::Succeeded => return Ok(status.exit_code.unwrap_or(0)),
                    JobState::Failed => return Ok(status.exit_code.unwrap_or(1)),
                    JobState::Pending | JobState::Running | JobState::Unknown => {
                        debug!(url = %url, state = ?status.state, "Job not finished");
                        tokio::time::sleep(self.poll_delay()).await;
                    }
                }
            }
        })
    }

    fn logs(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<UnitLogs>> {
        let url = self.url(&format!("/jobs/{}/logs", unit_id));
        Box::pin(async move {
            let resp = self.send(UnitPhase::Logs, self.client.get(url)).await?;
            resp.json::<UnitLogs>()
                .await
                .map_err(|e| http_error(UnitPhase::Logs, e))
        })
    }

    fn stop(&self, unit_id: &str, grace: Duration) -> BoxFuture<'_, TransportResult<()>> {
        let url = self.url(&format!("/jobs/{}/stop", unit_id));
        Box::pin(async move {
            let body = serde_json::json!({ "grace_secs": grace.as_secs() });
            self.send_teardown(self.client.post(url).json(&body)).await
        })
    }

    fn kill(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let url = self.url(&format!("/jobs/{}/kill", unit_id));
        Box::pin(async move { self.send_teardown(self.client.post(url)).await })
    }

    fn remove(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let url = self.url(&format!("/jobs/{}", unit_id));
        Box::pin(async move { self.send_teardown(self.client.delete(url)).await })
    }
}

/// Cluster job executor. A single API attempt; anything that failed before
/// the job could start may fall back in-process.
pub struct ClusterJobExecutor {
    runtime: Arc<dyn UnitRuntime>,
    config: ClusterConfig,
    settlement: Settlement,
}

impl ClusterJobExecutor {
    pub fn new(runtime: Arc<dyn UnitRuntime>, config: ClusterConfig, settlement: Settlement) -> Self {
        Self {
            runtime,
            config,
            settlement,
        }
    }

    pub fn from_config(config: &ClusterConfig, settlement: Settlement) -> Result<Self> {
        let runtime = ClusterJobRuntime::new(config)?;
        Ok(Self::new(Arc::new(runtime), config.clone(), settlement))
    }

    async fn dispatch(
        &self,
        mut request: ExecutionRequest,
        compute: Arc<dyn NodeCompute>,
    ) -> ExecutionResult {
        request.dispatch_status = DispatchStatus::Submitted;
        let budget = request
            .node
            .overrides
            .timeout_secs
            .unwrap_or(self.config.dispatch_timeout_secs);
        let limits = AttemptLimits {
            slice: Duration::from_secs(self.config.request_timeout_secs),
            deadline: Instant::now() + Duration::from_secs(budget),
            stop_grace: Duration::from_secs(STOP_GRACE_SECS),
            force_kill: true,
            pull_image: false,
        };
        let spec = remote::unit_spec(&request, &self.config.image, &self.config.command, None, None);

        info!(
            run_id = %request.run_id,
            node_id = %request.node.id,
            dispatch_id = %request.dispatch_id,
            "Dispatching cluster job"
        );
        let outcome = RemoteAttempt::new(self.runtime.as_ref(), limits).run(&spec).await;
        self.settlement
            .settle(request, ProviderKind::ClusterJob, outcome, compute)
            .await
    }
}

impl ProviderExecutor for ClusterJobExecutor {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ClusterJob
    }

    fn execute(
        &self,
        request: ExecutionRequest,
        compute: Arc<dyn NodeCompute>,
    ) -> BoxFuture<'_, ExecutionResult> {
        Box::pin(self.dispatch(request, compute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_parsing() {
        let s: JobStatus = serde_json::from_str(r#"{"state":"succeeded","exit_code":0}"#).unwrap();
        assert_eq!(s.state, JobState::Succeeded);
        assert_eq!(s.exit_code, Some(0));

        let s: JobStatus = serde_json::from_str(r#"{"state":"evicted"}"#).unwrap();
        assert_eq!(s.state, JobState::Unknown);
        assert_eq!(s.exit_code, None);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_probe_fails() {
        let config = ClusterConfig {
            base_url: "http://127.0.0.1:1/".into(),
            token: None,
            image: "runner".into(),
            command: vec![],
            poll_interval_ms: 10,
            dispatch_timeout_secs: 5,
            request_timeout_secs: 2,
        };
        let runtime = ClusterJobRuntime::new(&config).unwrap();
        assert_eq!(runtime.url("/jobs"), "http://127.0.0.1:1/jobs");
        let err = runtime.probe().await.unwrap_err();
        assert_eq!(err.phase, UnitPhase::Probe);
    }
}
