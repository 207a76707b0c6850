//! Remote unit attempts and the settlement rules shared by every remote
//! provider.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use weft_core::error::{TransportError, TransportResult, WeftError};
use weft_core::marker::{self, MarkerScan};
use weft_core::traits::{IdempotencyRegistry, NodeCompute, UnitRuntime};
use weft_core::types::{
    DispatchStatus, ExecutionRequest, ExecutionResult, FailureReason, ProviderKind, UnitLogs,
    UnitPhase, UnitSpec,
};

use crate::workspace::WorkspaceExecutor;

/// How one remote attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The backend did not answer its reachability probe.
    Unreachable(TransportError),
    /// pull/create/start failed outright; no remote work can have run.
    DispatchFailed(TransportError),
    /// A pre-start phase ran out of its time slice.
    Stalled { phase: UnitPhase },
    /// The unit exited and its logs were collected.
    Finished { exit_code: i64, logs: UnitLogs },
    /// The unit outlived the dispatch budget and was torn down.
    TimedOut { logs: UnitLogs },
    /// The unit may have run; its outcome is unknown.
    Ambiguous { phase: UnitPhase, message: String },
}

/// Time limits for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptLimits {
    /// Per-call slice for probe/pull/create/start/logs/remove.
    pub slice: Duration,
    /// Absolute end of the overall dispatch budget.
    pub deadline: Instant,
    pub stop_grace: Duration,
    pub force_kill: bool,
    pub pull_image: bool,
}

impl AttemptLimits {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn slice_left(&self) -> Duration {
        self.slice.min(self.remaining())
    }
}

/// Drive one unit through probe, pull, create, start, wait, logs and remove.
pub struct RemoteAttempt<'a> {
    runtime: &'a dyn UnitRuntime,
    limits: AttemptLimits,
}

enum Bounded<T> {
    Done(T),
    Failed(TransportError),
    Elapsed,
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Bounded<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Bounded::Done(v),
        Ok(Err(e)) => Bounded::Failed(e),
        Err(_) => Bounded::Elapsed,
    }
}

impl<'a> RemoteAttempt<'a> {
    pub fn new(runtime: &'a dyn UnitRuntime, limits: AttemptLimits) -> Self {
        Self { runtime, limits }
    }

    pub async fn run(&self, spec: &UnitSpec) -> AttemptOutcome {
        let rt = self.runtime;
        let name = rt.name();

        match bounded(self.limits.slice_left(), rt.probe()).await {
            Bounded::Done(()) => {}
            Bounded::Failed(e) => {
                warn!(runtime = name, category = %e.kind, error = %e, "Backend unreachable");
                return AttemptOutcome::Unreachable(e);
            }
            Bounded::Elapsed => return self.stalled(UnitPhase::Probe),
        }

        if self.limits.pull_image {
            match bounded(self.limits.slice_left(), rt.pull(&spec.image)).await {
                Bounded::Done(()) => {}
                Bounded::Failed(e) => return self.dispatch_failed(e),
                Bounded::Elapsed => return self.stalled(UnitPhase::Pull),
            }
        }

        let unit_id = match bounded(self.limits.slice_left(), rt.create(spec)).await {
            Bounded::Done(id) => id,
            Bounded::Failed(e) => return self.dispatch_failed(e),
            Bounded::Elapsed => return self.stalled(UnitPhase::Create),
        };
        debug!(runtime = name, unit_id = %unit_id, "Unit created");

        match bounded(self.limits.slice_left(), rt.start(&unit_id)).await {
            Bounded::Done(()) => {}
            Bounded::Failed(e) => {
                self.remove(&unit_id).await;
                return self.dispatch_failed(e);
            }
            Bounded::Elapsed => {
                self.teardown(&unit_id).await;
                return self.ambiguous(UnitPhase::Start, "start did not answer within its time slice".into());
            }
        }

        let exit_code = match bounded(self.limits.remaining(), rt.wait(&unit_id)).await {
            Bounded::Done(code) => code,
            Bounded::Failed(e) => {
                self.teardown(&unit_id).await;
                return self.ambiguous(UnitPhase::Wait, e.to_string());
            }
            Bounded::Elapsed => {
                warn!(runtime = name, unit_id = %unit_id, "Dispatch budget exhausted, tearing unit down");
                let logs = self.teardown(&unit_id).await;
                return AttemptOutcome::TimedOut { logs };
            }
        };

        let logs = match bounded(self.limits.slice, rt.logs(&unit_id)).await {
            Bounded::Done(logs) => logs,
            Bounded::Failed(e) => {
                self.remove(&unit_id).await;
                return self.ambiguous(UnitPhase::Logs, e.to_string());
            }
            Bounded::Elapsed => {
                self.remove(&unit_id).await;
                return self.ambiguous(UnitPhase::Logs, "log collection timed out".into());
            }
        };

        self.remove(&unit_id).await;
        AttemptOutcome::Finished { exit_code, logs }
    }

    fn stalled(&self, phase: UnitPhase) -> AttemptOutcome {
        warn!(runtime = self.runtime.name(), %phase, "Backend stalled");
        AttemptOutcome::Stalled { phase }
    }

    fn dispatch_failed(&self, e: TransportError) -> AttemptOutcome {
        warn!(runtime = self.runtime.name(), category = %e.kind, error = %e, "Dispatch failed");
        AttemptOutcome::DispatchFailed(e)
    }

    fn ambiguous(&self, phase: UnitPhase, message: String) -> AttemptOutcome {
        warn!(runtime = self.runtime.name(), %phase, error = %message, "Unit state is ambiguous");
        AttemptOutcome::Ambiguous { phase, message }
    }

    async fn remove(&self, unit_id: &str) {
        match bounded(self.limits.slice, self.runtime.remove(unit_id)).await {
            Bounded::Done(()) => {}
            Bounded::Failed(e) => {
                warn!(runtime = self.runtime.name(), unit_id, error = %e, "Failed to remove unit")
            }
            Bounded::Elapsed => {
                warn!(runtime = self.runtime.name(), unit_id, "Unit removal timed out")
            }
        }
    }

    /// Graceful stop, optional forced kill, best-effort log capture, removal.
    async fn teardown(&self, unit_id: &str) -> UnitLogs {
        let rt = self.runtime;
        let grace = self.limits.stop_grace;
        if let Bounded::Failed(e) =
            bounded(grace + self.limits.slice, rt.stop(unit_id, grace)).await
        {
            debug!(runtime = rt.name(), unit_id, error = %e, "Graceful stop failed");
        }
        if self.limits.force_kill {
            if let Bounded::Failed(e) = bounded(self.limits.slice, rt.kill(unit_id)).await {
                debug!(runtime = rt.name(), unit_id, error = %e, "Kill failed");
            }
        }
        let logs = match bounded(self.limits.slice, rt.logs(unit_id)).await {
            Bounded::Done(logs) => logs,
            _ => UnitLogs::default(),
        };
        self.remove(unit_id).await;
        logs
    }
}

/// Build the descriptor for the remote unit serving `request`.
pub fn unit_spec(
    request: &ExecutionRequest,
    image: &str,
    command: &[String],
    memory_mb: Option<u64>,
    network_mode: Option<String>,
) -> UnitSpec {
    let mut spec = UnitSpec {
        name: format!("weft-{}", request.dispatch_id),
        image: request
            .node
            .overrides
            .image
            .clone()
            .unwrap_or_else(|| image.to_string()),
        command: command.to_vec(),
        memory_mb,
        network_mode,
        ..Default::default()
    };

    let env = [
        (marker::env::RUN_ID, request.run_id.to_string()),
        (marker::env::GRAPH_ID, request.graph_id.clone()),
        (marker::env::NODE_ID, request.node.id.clone()),
        (marker::env::NODE_TYPE, request.node.kind.as_str().to_string()),
        (marker::env::DISPATCH_ID, request.dispatch_id.clone()),
        (marker::env::WORKSPACE_ID, request.workspace_identity.clone()),
        (marker::env::EXECUTION_INDEX, request.execution_index.to_string()),
        (marker::env::INPUT, request.input.to_value().to_string()),
    ];
    spec.env = env.into_iter().map(|(k, v)| (k.to_string(), v)).collect();

    spec.labels.insert("weft.run_id".into(), request.run_id.to_string());
    spec.labels.insert("weft.node_id".into(), request.node.id.clone());
    spec.labels.insert("weft.dispatch_id".into(), request.dispatch_id.clone());
    spec
}

/// Final bookkeeping for a remote attempt: marker check, idempotency gate,
/// compute invocation, and the workspace fallback decision.
pub struct Settlement {
    idempotency: Arc<dyn IdempotencyRegistry>,
    workspace: Arc<WorkspaceExecutor>,
    fallback_enabled: bool,
}

impl Settlement {
    pub fn new(
        idempotency: Arc<dyn IdempotencyRegistry>,
        workspace: Arc<WorkspaceExecutor>,
        fallback_enabled: bool,
    ) -> Self {
        Self {
            idempotency,
            workspace,
            fallback_enabled,
        }
    }

    /// Settle outcomes that never involve a provider-specific retry.
    pub async fn settle(
        &self,
        request: ExecutionRequest,
        provider: ProviderKind,
        outcome: AttemptOutcome,
        compute: Arc<dyn NodeCompute>,
    ) -> ExecutionResult {
        match outcome {
            AttemptOutcome::Finished { exit_code, logs } => {
                self.confirm(request, provider, exit_code, logs, compute).await
            }
            AttemptOutcome::TimedOut { logs } => {
                let message = format!("{} unit exceeded its dispatch budget", provider);
                self.uncertain(request, FailureReason::DispatchTimeout, message, None, &logs)
            }
            AttemptOutcome::Ambiguous { phase, message } => self.uncertain(
                request,
                FailureReason::AmbiguousState,
                format!("{} after the unit may have started: {}", phase, message),
                None,
                &UnitLogs::default(),
            ),
            AttemptOutcome::Unreachable(e) | AttemptOutcome::DispatchFailed(e) => {
                let mut request = request;
                if request.api_failure.is_none() {
                    request.api_failure = Some(e.kind);
                }
                self.fail_or_fall_back(request, FailureReason::DispatchFailed, e.to_string(), compute)
                    .await
            }
            AttemptOutcome::Stalled { phase } => {
                let message = format!("{} stalled in {}", provider, phase);
                self.fail_or_fall_back(request, FailureReason::ApiStalled, message, compute)
                    .await
            }
        }
    }

    /// A unit exited and reported logs. Check the marker, then gate the
    /// compute callback behind the idempotency registry.
    pub async fn confirm(
        &self,
        mut request: ExecutionRequest,
        provider: ProviderKind,
        exit_code: i64,
        logs: UnitLogs,
        compute: Arc<dyn NodeCompute>,
    ) -> ExecutionResult {
        request.final_provider = Some(provider);

        let payload = match marker::scan(&logs.stdout, &request.dispatch_id) {
            MarkerScan::Confirmed { payload } => payload,
            MarkerScan::Missing(message) => {
                return self.uncertain(
                    request,
                    FailureReason::MarkerMissing,
                    message,
                    Some(exit_code),
                    &logs,
                )
            }
            MarkerScan::InvalidPayload(message) => {
                return self.uncertain(
                    request,
                    FailureReason::InvalidPayload,
                    format!("unreadable result payload: {}", message),
                    Some(exit_code),
                    &logs,
                )
            }
        };

        if exit_code != 0 {
            request.dispatch_status = DispatchStatus::Failed;
            return ExecutionResult::failed(
                &request,
                FailureReason::RemoteExitNonZero,
                format!("remote unit exited with code {}", exit_code),
            )
            .with_process_output(Some(exit_code), &logs);
        }

        let scope = request.run_id.to_string();
        let key = request.dispatch_id.clone();
        match self.idempotency.register(&scope, &key).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(run_id = %scope, dispatch_id = %key, "Duplicate confirmation rejected");
                request.dispatch_status = DispatchStatus::Failed;
                return ExecutionResult::failed(
                    &request,
                    FailureReason::DuplicateDispatch,
                    WeftError::DuplicateDispatch { scope, key }.to_string(),
                )
                .with_process_output(Some(exit_code), &logs);
            }
            Err(e) => {
                request.dispatch_status = DispatchStatus::Failed;
                return ExecutionResult::failed(&request, FailureReason::DispatchFailed, e.to_string())
                    .with_process_output(Some(exit_code), &logs);
            }
        }

        let timeout = self.workspace.timeout_for(&request);
        let result = match crate::workspace::invoke(&*compute, &request, payload, timeout).await {
            Ok(output) => {
                request.dispatch_status = DispatchStatus::Confirmed;
                ExecutionResult::succeeded(&request, output)
            }
            Err(e) => {
                request.dispatch_status = DispatchStatus::Failed;
                ExecutionResult::failed(&request, FailureReason::ComputeFailed, e.to_string())
            }
        };
        info!(
            run_id = %request.run_id,
            node_id = %request.node.id,
            dispatch_id = %request.dispatch_id,
            provider = %provider,
            success = result.is_success(),
            "Remote dispatch settled"
        );
        result.with_process_output(Some(exit_code), &logs)
    }

    /// Fail closed: the remote side may have run. Never retried, never
    /// downgraded.
    pub fn uncertain(
        &self,
        mut request: ExecutionRequest,
        reason: FailureReason,
        message: String,
        exit_code: Option<i64>,
        logs: &UnitLogs,
    ) -> ExecutionResult {
        warn!(
            run_id = %request.run_id,
            node_id = %request.node.id,
            dispatch_id = %request.dispatch_id,
            %reason,
            "Dispatch outcome is ambiguous, failing closed"
        );
        request.dispatch_uncertain = true;
        request.dispatch_status = DispatchStatus::Failed;
        let error = WeftError::DispatchUncertain {
            dispatch_id: request.dispatch_id.clone(),
            message,
        };
        ExecutionResult::failed(&request, reason, error.to_string()).with_process_output(exit_code, logs)
    }

    /// The dispatch failed before any remote work could have run. Fall back
    /// to in-process execution when allowed, otherwise fail.
    pub async fn fail_or_fall_back(
        &self,
        mut request: ExecutionRequest,
        reason: FailureReason,
        message: String,
        compute: Arc<dyn NodeCompute>,
    ) -> ExecutionResult {
        if self.fallback_enabled && !request.fallback_attempted && !request.dispatch_uncertain {
            info!(
                run_id = %request.run_id,
                node_id = %request.node.id,
                dispatch_id = %request.dispatch_id,
                %reason,
                error = %message,
                "Falling back to in-process execution"
            );
            return self.workspace.fall_back(request, reason, compute).await;
        }
        request.dispatch_status = DispatchStatus::Failed;
        ExecutionResult::failed(&request, reason, message)
    }
}
