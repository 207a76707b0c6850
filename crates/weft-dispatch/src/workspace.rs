use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{IdempotencyRegistry, NodeCompute, ProviderExecutor};
use weft_core::types::{
    ComputeOutput, DispatchStatus, ExecutionRequest, ExecutionResult, FailureReason, ProviderKind,
};

/// Invoke `compute` for `request`, bounded by `timeout`.
pub(crate) async fn invoke(
    compute: &dyn NodeCompute,
    request: &ExecutionRequest,
    remote: Option<serde_json::Value>,
    timeout: Duration,
) -> Result<ComputeOutput> {
    match tokio::time::timeout(timeout, compute.compute(request.compute_request(remote))).await {
        Ok(result) => result,
        Err(_) => Err(WeftError::ComputeTimeout {
            node_id: request.node.id.clone(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

/// In-process executor. Runs the compute callback directly in the caller's
/// process, once per idempotency key.
pub struct WorkspaceExecutor {
    idempotency: Arc<dyn IdempotencyRegistry>,
    timeout: Duration,
}

impl WorkspaceExecutor {
    pub fn new(idempotency: Arc<dyn IdempotencyRegistry>, timeout: Duration) -> Self {
        Self {
            idempotency,
            timeout,
        }
    }

    /// Compute timeout for a request: the node override, else the default.
    pub fn timeout_for(&self, request: &ExecutionRequest) -> Duration {
        request
            .node
            .overrides
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.timeout)
    }

    /// Re-run a failed remote dispatch in-process under its own idempotency key.
    pub async fn fall_back(
        &self,
        mut request: ExecutionRequest,
        reason: FailureReason,
        compute: Arc<dyn NodeCompute>,
    ) -> ExecutionResult {
        request.fallback_attempted = true;
        request.fallback_reason = Some(reason);
        request.dispatch_status = DispatchStatus::FallbackStarted;
        let key = format!("{}/workspace", request.dispatch_id);
        self.run(request, compute, key).await
    }

    async fn run(
        &self,
        mut request: ExecutionRequest,
        compute: Arc<dyn NodeCompute>,
        key: String,
    ) -> ExecutionResult {
        request.final_provider = Some(ProviderKind::InProcess);
        let scope = request.run_id.to_string();

        match self.idempotency.register(&scope, &key).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(run_id = %scope, key = %key, "Duplicate in-process dispatch rejected");
                request.dispatch_status = DispatchStatus::Failed;
                let error = WeftError::DuplicateDispatch { scope, key };
                return ExecutionResult::failed(&request, FailureReason::DuplicateDispatch, error.to_string());
            }
            Err(e) => {
                request.dispatch_status = DispatchStatus::Failed;
                return ExecutionResult::failed(&request, FailureReason::DispatchFailed, e.to_string());
            }
        }

        let timeout = self.timeout_for(&request);
        match invoke(&*compute, &request, None, timeout).await {
            Ok(output) => {
                request.dispatch_status = DispatchStatus::Confirmed;
                debug!(
                    run_id = %request.run_id,
                    node_id = %request.node.id,
                    execution_index = request.execution_index,
                    "In-process compute finished"
                );
                ExecutionResult::succeeded(&request, output)
            }
            Err(e) => {
                request.dispatch_status = DispatchStatus::Failed;
                ExecutionResult::failed(&request, FailureReason::ComputeFailed, e.to_string())
            }
        }
    }
}

impl ProviderExecutor for WorkspaceExecutor {
    fn kind(&self) -> ProviderKind {
        ProviderKind::InProcess
    }

    fn execute(
        &self,
        mut request: ExecutionRequest,
        compute: Arc<dyn NodeCompute>,
    ) -> BoxFuture<'_, ExecutionResult> {
        Box::pin(async move {
            request.dispatch_status = DispatchStatus::Submitted;
            let key = request.dispatch_id.clone();
            self.run(request, compute, key).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::graph::{CompiledNode, Node, NodeKind};
    use weft_core::types::{ExecutionStatus, InputContext, RunId};
    use weft_store::MemoryStore;
    use weft_test_utils::ScriptedCompute;

    fn request(node: &str) -> ExecutionRequest {
        let node = CompiledNode::compile(&Node::new(node, NodeKind::Task)).unwrap();
        let run_id = RunId::from_str("run-1");
        let mut req = ExecutionRequest::new(run_id.clone(), "g", node, 1, InputContext::default());
        req.dispatch_id = ExecutionRequest::derive_dispatch_id(&run_id, "t", 1);
        req.workspace_identity = ExecutionRequest::derive_workspace_identity(&run_id, "t");
        req
    }

    #[tokio::test]
    async fn test_second_execute_is_rejected() {
        let exec = WorkspaceExecutor::new(Arc::new(MemoryStore::new()), Duration::from_secs(5));
        let compute = Arc::new(ScriptedCompute::new());

        let first = exec.execute(request("t"), compute.clone()).await;
        assert!(first.is_success());
        assert_eq!(first.run_metadata.dispatch_status, DispatchStatus::Confirmed);
        assert_eq!(first.run_metadata.final_provider, Some(ProviderKind::InProcess));

        let second = exec.execute(request("t"), compute.clone()).await;
        assert_eq!(second.status, ExecutionStatus::Failed);
        assert_eq!(second.reason, Some(FailureReason::DuplicateDispatch));
        assert_eq!(compute.calls_for("t"), 1);
    }

    #[tokio::test]
    async fn test_compute_error_fails_result() {
        let exec = WorkspaceExecutor::new(Arc::new(MemoryStore::new()), Duration::from_secs(5));
        let compute = Arc::new(ScriptedCompute::new().with_failure("t", "bad input"));

        let result = exec.execute(request("t"), compute).await;
        assert_eq!(result.reason, Some(FailureReason::ComputeFailed));
        assert!(result.error.unwrap().contains("bad input"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compute_timeout() {
        let exec = WorkspaceExecutor::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));
        let compute = Arc::new(ScriptedCompute::new().with_delay(Duration::from_secs(10)));

        let result = exec.execute(request("t"), compute).await;
        assert_eq!(result.reason, Some(FailureReason::ComputeFailed));
        assert!(result.error.unwrap().contains("timeout"));
    }
}
