use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use weft_core::config::{AppConfig, RouterConfig};
use weft_core::error::{Result, WeftError};
use weft_core::graph::CompiledNode;
use weft_core::traits::{IdempotencyRegistry, NodeCompute, ProviderExecutor};
use weft_core::types::{DispatchStatus, ExecutionRequest, ExecutionResult, FailureReason, ProviderKind};

use crate::cluster::ClusterJobExecutor;
use crate::container::ContainerExecutor;
use crate::remote::Settlement;
use crate::workspace::WorkspaceExecutor;

/// A request stamped with its provider and identities, ready to execute.
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub request: ExecutionRequest,
}

impl RoutedRequest {
    pub fn provider(&self) -> ProviderKind {
        self.request.selected_provider
    }
}

/// Picks a provider per activation and hands the request to its executor.
///
/// The router never retries; each executor owns its fallback ladder.
pub struct ExecutionRouter {
    config: RouterConfig,
    executors: HashMap<ProviderKind, Arc<dyn ProviderExecutor>>,
}

impl ExecutionRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            executors: HashMap::new(),
        }
    }

    /// Build a router with every provider the config enables. The in-process
    /// executor is shared with the remote executors as their fallback.
    pub fn from_config(config: &AppConfig, idempotency: Arc<dyn IdempotencyRegistry>) -> Result<Self> {
        let workspace = Arc::new(WorkspaceExecutor::new(
            idempotency.clone(),
            Duration::from_secs(config.workspace.timeout_secs),
        ));
        let settlement =
            || Settlement::new(idempotency.clone(), workspace.clone(), config.fallback.enabled);

        let mut router = Self::new(config.router.clone());
        router.register(workspace.clone());
        router.register(Arc::new(ContainerExecutor::from_config(
            &config.container,
            settlement(),
        )));
        if let Some(cluster) = &config.cluster {
            router.register(Arc::new(ClusterJobExecutor::from_config(cluster, settlement())?));
        }
        Ok(router)
    }

    /// Register an executor under its own provider kind, replacing any
    /// previous one.
    pub fn register(&mut self, executor: Arc<dyn ProviderExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    /// Provider for a node: structural nodes stay in-process, then the
    /// node's own override, then the configured policy.
    pub fn select(&self, node: &CompiledNode) -> ProviderKind {
        if node.kind.is_structural() {
            return ProviderKind::InProcess;
        }
        node.overrides
            .provider
            .unwrap_or_else(|| self.config.provider_for(node.kind))
    }

    pub fn route(&self, mut request: ExecutionRequest) -> RoutedRequest {
        request.selected_provider = self.select(&request.node);
        if request.workspace_identity.is_empty() {
            request.workspace_identity =
                ExecutionRequest::derive_workspace_identity(&request.run_id, &request.node.id);
        }
        request.dispatch_id = ExecutionRequest::derive_dispatch_id(
            &request.run_id,
            &request.node.id,
            request.execution_index,
        );
        request.dispatch_status = DispatchStatus::Pending;
        request.final_provider = None;

        debug!(
            run_id = %request.run_id,
            node_id = %request.node.id,
            execution_index = request.execution_index,
            provider = %request.selected_provider,
            dispatch_id = %request.dispatch_id,
            "Routed activation"
        );
        RoutedRequest { request }
    }

    pub async fn execute_routed(
        &self,
        routed: RoutedRequest,
        compute: Arc<dyn NodeCompute>,
    ) -> ExecutionResult {
        let provider = routed.provider();
        let Some(executor) = self.executors.get(&provider) else {
            error!(provider = %provider, "No executor registered");
            let mut request = routed.request;
            request.dispatch_status = DispatchStatus::Failed;
            let err = WeftError::ExecutorNotFound(provider.to_string());
            return ExecutionResult::failed(&request, FailureReason::DispatchFailed, err.to_string());
        };
        executor.execute(routed.request, compute).await
    }

    /// `route` followed by `execute_routed`.
    pub async fn dispatch(
        &self,
        request: ExecutionRequest,
        compute: Arc<dyn NodeCompute>,
    ) -> ExecutionResult {
        let routed = self.route(request);
        self.execute_routed(routed, compute).await
    }
}
