//! Container backend: container API first, container CLI on stall or
//! unreachability, in-process fallback when the dispatch failed outright.

pub mod api;
pub mod cli;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{info, warn};

use weft_core::config::ContainerConfig;
use weft_core::traits::{NodeCompute, ProviderExecutor, UnitRuntime};
use weft_core::types::{
    DispatchStatus, ExecutionRequest, ExecutionResult, FailureReason, ProviderKind,
    TransportErrorKind, UnitPhase, UnitSpec,
};

use crate::remote::{self, AttemptLimits, AttemptOutcome, RemoteAttempt, Settlement};

pub use api::BollardRuntime;
pub use cli::CliRuntime;

pub struct ContainerExecutor {
    api: Arc<dyn UnitRuntime>,
    cli: Option<Arc<dyn UnitRuntime>>,
    config: ContainerConfig,
    settlement: Settlement,
}

impl ContainerExecutor {
    pub fn new(
        api: Arc<dyn UnitRuntime>,
        cli: Option<Arc<dyn UnitRuntime>>,
        config: ContainerConfig,
        settlement: Settlement,
    ) -> Self {
        Self {
            api,
            cli,
            config,
            settlement,
        }
    }

    /// Docker Engine API plus, when enabled, the configured CLI binary.
    pub fn from_config(config: &ContainerConfig, settlement: Settlement) -> Self {
        let cli = config
            .cli_enabled
            .then(|| Arc::new(CliRuntime::new(config.cli_binary.clone())) as Arc<dyn UnitRuntime>);
        Self::new(
            Arc::new(BollardRuntime::connect()),
            cli,
            config.clone(),
            settlement,
        )
    }

    fn limits(&self, deadline: Instant) -> AttemptLimits {
        AttemptLimits {
            slice: Duration::from_secs(self.config.api_slice_secs),
            deadline,
            stop_grace: Duration::from_secs(self.config.stop_grace_secs),
            force_kill: self.config.force_kill,
            pull_image: self.config.pull_image,
        }
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
        let limits = self.limits(Instant::now() + Duration::from_secs(budget));
        let spec = remote::unit_spec(
            &request,
            &self.config.image,
            &self.config.command,
            Some(self.config.memory_mb),
            Some(self.config.network_mode.clone()),
        );

        info!(
            run_id = %request.run_id,
            node_id = %request.node.id,
            dispatch_id = %request.dispatch_id,
            image = %spec.image,
            "Dispatching to container API"
        );

        match RemoteAttempt::new(self.api.as_ref(), limits).run(&spec).await {
            AttemptOutcome::Unreachable(e) => {
                request.api_failure = Some(e.kind);
                let message = format!("container API unreachable: {}", e);
                self.via_cli(request, &spec, None, limits, FailureReason::DispatchFailed, message, compute)
                    .await
            }
            AttemptOutcome::Stalled { phase } => {
                request.api_failure = Some(TransportErrorKind::Timeout);
                let message = format!("container API stalled in {}", phase);
                let min_cli = Duration::from_secs(self.config.min_cli_budget_secs);
                if limits.remaining() >= min_cli {
                    // An abandoned create may still land on the daemon under
                    // the API unit's name.
                    if phase == UnitPhase::Create {
                        let cli_spec = UnitSpec {
                            name: format!("{}-cli", spec.name),
                            ..spec.clone()
                        };
                        self.via_cli(
                            request,
                            &cli_spec,
                            Some(spec.name.as_str()),
                            limits,
                            FailureReason::ApiStalled,
                            message,
                            compute,
                        )
                        .await
                    } else {
                        self.via_cli(request, &spec, None, limits, FailureReason::ApiStalled, message, compute)
                            .await
                    }
                } else {
                    let message = format!("{}; remaining budget too small for the CLI", message);
                    self.settlement
                        .fail_or_fall_back(request, FailureReason::ApiStalled, message, compute)
                        .await
                }
            }
            other => {
                self.settlement
                    .settle(request, ProviderKind::Container, other, compute)
                    .await
            }
        }
    }

    /// Retry through the CLI with whatever budget is left, if its
    /// precondition probe passes. `orphan` names a unit the API may have
    /// left behind; it is removed once the CLI attempt is over.
    #[allow(clippy::too_many_arguments)]
    async fn via_cli(
        &self,
        mut request: ExecutionRequest,
        spec: &UnitSpec,
        orphan: Option<&str>,
        limits: AttemptLimits,
        api_reason: FailureReason,
        api_message: String,
        compute: Arc<dyn NodeCompute>,
    ) -> ExecutionResult {
        let Some(cli) = &self.cli else {
            return self
                .settlement
                .fail_or_fall_back(request, api_reason, api_message, compute)
                .await;
        };

        info!(
            dispatch_id = %request.dispatch_id,
            remaining_secs = limits.remaining().as_secs(),
            "Switching to container CLI"
        );
        let outcome = RemoteAttempt::new(cli.as_ref(), limits).run(spec).await;
        if let Some(name) = orphan {
            if !matches!(outcome, AttemptOutcome::Unreachable(_)) {
                remove_orphan(cli.as_ref(), name, limits.slice).await;
            }
        }
        match outcome {
            AttemptOutcome::Unreachable(e) => {
                let message = format!("{}; CLI unavailable: {}", api_message, e);
                self.settlement
                    .fail_or_fall_back(request, FailureReason::CliUnavailable, message, compute)
                    .await
            }
            other => {
                request.cli_used = true;
                self.settlement
                    .settle(request, ProviderKind::Container, other, compute)
                    .await
            }
        }
    }
}

/// Best-effort removal of a unit by name.
async fn remove_orphan(runtime: &dyn UnitRuntime, name: &str, limit: Duration) {
    match tokio::time::timeout(limit, runtime.remove(name)).await {
        Ok(Ok(())) => info!(runtime = runtime.name(), unit = name, "Removed unit left by stalled API create"),
        Ok(Err(e)) => warn!(runtime = runtime.name(), unit = name, error = %e, "Failed to remove stalled API unit"),
        Err(_) => warn!(runtime = runtime.name(), unit = name, "Removal of stalled API unit timed out"),
    }
}

impl ProviderExecutor for ContainerExecutor {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Container
    }

    fn execute(
        &self,
        request: ExecutionRequest,
        compute: Arc<dyn NodeCompute>,
    ) -> BoxFuture<'_, ExecutionResult> {
        Box::pin(self.dispatch(request, compute))
    }
}
