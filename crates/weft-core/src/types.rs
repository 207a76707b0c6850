use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WeftError;
use crate::graph::CompiledNode;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a graph run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Stopping,
    Stopped,
    Canceled,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Canceled | Self::Completed | Self::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Canceled => "canceled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "canceled" => Ok(Self::Canceled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(WeftError::Database(format!("unknown run status: {}", other))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One triggered execution of a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub graph_id: String,
    pub status: RunStatus,
    /// 1 for an operator-triggered run, +1 for every cycle-to-start successor.
    pub generation: u32,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// A fresh first-generation run waiting for a worker.
    pub fn queued(graph_id: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            graph_id: graph_id.into(),
            status: RunStatus::Queued,
            generation: 1,
            parent_run_id: None,
            failure_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// The queued successor spawned when this run cycles back to `start`.
    pub fn next_generation(&self) -> Self {
        Self {
            generation: self.generation + 1,
            parent_run_id: Some(self.id.clone()),
            ..Self::queued(self.graph_id.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Running,
    Completed,
    Failed,
}

impl NodeRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for NodeRunStatus {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(WeftError::Database(format!("unknown node run status: {}", other))),
        }
    }
}

impl std::fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per node activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub id: String,
    pub run_id: RunId,
    pub node_id: String,
    /// 1-based, strictly increasing per (run, node).
    pub execution_index: u32,
    pub status: NodeRunStatus,
    pub input_context: serde_json::Value,
    #[serde(default)]
    pub output_state: Option<serde_json::Value>,
    #[serde(default)]
    pub routing_state: Option<RoutingState>,
    #[serde(default)]
    pub error: Option<String>,
    /// Resolved dispatch metadata, kept for audit and replay.
    #[serde(default)]
    pub dispatch: Option<RunMetadata>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeRun {
    pub fn running(
        run_id: RunId,
        node_id: impl Into<String>,
        execution_index: u32,
        input_context: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id,
            node_id: node_id.into(),
            execution_index,
            status: NodeRunStatus::Running,
            input_context,
            output_state: None,
            routing_state: None,
            error: None,
            dispatch: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn complete(&mut self, output: serde_json::Value, routing: RoutingState, dispatch: RunMetadata) {
        self.status = NodeRunStatus::Completed;
        self.output_state = Some(output);
        self.routing_state = Some(routing);
        self.dispatch = Some(dispatch);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>, dispatch: Option<RunMetadata>) {
        self.status = NodeRunStatus::Failed;
        self.error = Some(error.into());
        if dispatch.is_some() {
            self.dispatch = dispatch;
        }
        self.finished_at = Some(Utc::now());
    }
}

/// Routing hints produced by a node's compute callback.
///
/// The scheduler only reads `route_key` and `terminate_run`; everything else
/// is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_key: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminate_run: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RoutingState {
    pub fn route(key: impl Into<String>) -> Self {
        Self {
            route_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn terminate() -> Self {
        Self {
            terminate_run: true,
            ..Default::default()
        }
    }
}

/// A token travelling along a solid edge, waiting to be joined at its target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationToken {
    pub source_node_id: String,
    pub source_edge_id: String,
    pub output_state: serde_json::Value,
    pub routing_state: RoutingState,
    pub sequence: u64,
}

/// Upstream data handed to one activation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputContext {
    /// The consumed join set, one token per required solid parent.
    pub tokens: Vec<ActivationToken>,
    /// Latest known outputs of dotted-edge sources, keyed by source node id.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl InputContext {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Execution backends the router can select.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    ClusterJob,
    Container,
    InProcess,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterJob => "cluster_job",
            Self::Container => "container",
            Self::InProcess => "in_process",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster_job" | "clusterJob" | "cluster" => Ok(Self::ClusterJob),
            "container" | "docker" => Ok(Self::Container),
            "in_process" | "inProcess" | "workspace" => Ok(Self::InProcess),
            other => Err(WeftError::Config(format!("unknown provider: {}", other))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-activation dispatch state machine.
///
/// `pending -> submitted -> {confirmed, failed, fallback_started -> confirmed/failed}`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    #[default]
    Pending,
    Submitted,
    Confirmed,
    Failed,
    FallbackStarted,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// Why a backend was unreachable. Observability only; never drives fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    SocketMissing,
    AuthError,
    Timeout,
    TlsError,
    SocketUnreachable,
    Other,
}

impl TransportErrorKind {
    /// Infer a category from a backend or CLI error message.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("401")
            || msg.contains("403")
            || msg.contains("unauthorized")
            || msg.contains("forbidden")
            || msg.contains("permission denied")
        {
            Self::AuthError
        } else if msg.contains("no such file or directory")
            || msg.contains("socket not found")
            || msg.contains("socketnotfound")
            || msg.contains("not found in path")
        {
            Self::SocketMissing
        } else if msg.contains("timed out") || msg.contains("timeout") || msg.contains("deadline") {
            Self::Timeout
        } else if msg.contains("tls") || msg.contains("certificate") || msg.contains("ssl") {
            Self::TlsError
        } else if msg.contains("connection refused")
            || msg.contains("cannot connect")
            || msg.contains("unreachable")
            || msg.contains("connect error")
            || msg.contains("error trying to connect")
        {
            Self::SocketUnreachable
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SocketMissing => "socket_missing",
            Self::AuthError => "auth_error",
            Self::Timeout => "timeout",
            Self::TlsError => "tls_error",
            Self::SocketUnreachable => "socket_unreachable",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle step of a remote unit (container or cluster job).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    Probe,
    Pull,
    Create,
    Start,
    Wait,
    Logs,
    Remove,
}

impl UnitPhase {
    /// Phases after which remote state may exist and the callback may have run.
    pub fn may_have_started(&self) -> bool {
        matches!(self, Self::Start | Self::Wait | Self::Logs | Self::Remove)
    }
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Probe => "probe",
            Self::Pull => "pull",
            Self::Create => "create",
            Self::Start => "start",
            Self::Wait => "wait",
            Self::Logs => "logs",
            Self::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// Reason codes attached to failed or downgraded dispatches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// create/start/pull failed before any remote state could exist.
    DispatchFailed,
    /// The API attempt stalled in a pre-start phase.
    ApiStalled,
    /// The CLI fallback precondition probe failed.
    CliUnavailable,
    DispatchTimeout,
    /// The remote unit did not prove it started.
    MarkerMissing,
    /// A start, wait, or log call failed after the unit may have started.
    AmbiguousState,
    RemoteExitNonZero,
    DuplicateDispatch,
    /// The unit started but its result payload could not be parsed.
    InvalidPayload,
    ComputeFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DispatchFailed => "dispatch_failed",
            Self::ApiStalled => "api_stalled",
            Self::CliUnavailable => "cli_unavailable",
            Self::DispatchTimeout => "dispatch_timeout",
            Self::MarkerMissing => "marker_missing",
            Self::AmbiguousState => "ambiguous_state",
            Self::RemoteExitNonZero => "remote_exit_non_zero",
            Self::DuplicateDispatch => "duplicate_dispatch",
            Self::InvalidPayload => "invalid_payload",
            Self::ComputeFailed => "compute_failed",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch metadata persisted onto each NodeRun.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub selected_provider: ProviderKind,
    #[serde(default)]
    pub final_provider: Option<ProviderKind>,
    pub dispatch_id: String,
    pub dispatch_status: DispatchStatus,
    #[serde(default)]
    pub fallback_attempted: bool,
    #[serde(default)]
    pub fallback_reason: Option<FailureReason>,
    #[serde(default)]
    pub dispatch_uncertain: bool,
    #[serde(default)]
    pub cli_used: bool,
    /// Classified reason the primary API was unreachable, if it was.
    #[serde(default)]
    pub api_failure: Option<TransportErrorKind>,
}

/// The router/executor request contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub run_id: RunId,
    pub graph_id: String,
    pub node: CompiledNode,
    pub execution_index: u32,
    pub input: InputContext,
    /// Stable identity used to scope credentials and workspaces.
    #[serde(default)]
    pub workspace_identity: String,
    #[serde(default)]
    pub dispatch_id: String,
    pub selected_provider: ProviderKind,
    #[serde(default)]
    pub final_provider: Option<ProviderKind>,
    #[serde(default)]
    pub dispatch_status: DispatchStatus,
    #[serde(default)]
    pub fallback_attempted: bool,
    #[serde(default)]
    pub fallback_reason: Option<FailureReason>,
    #[serde(default)]
    pub dispatch_uncertain: bool,
    #[serde(default)]
    pub cli_used: bool,
    #[serde(default)]
    pub api_failure: Option<TransportErrorKind>,
}

impl ExecutionRequest {
    /// An unrouted request; the router stamps provider and identities.
    pub fn new(
        run_id: RunId,
        graph_id: impl Into<String>,
        node: CompiledNode,
        execution_index: u32,
        input: InputContext,
    ) -> Self {
        Self {
            run_id,
            graph_id: graph_id.into(),
            node,
            execution_index,
            input,
            workspace_identity: String::new(),
            dispatch_id: String::new(),
            selected_provider: ProviderKind::InProcess,
            final_provider: None,
            dispatch_status: DispatchStatus::Pending,
            fallback_attempted: false,
            fallback_reason: None,
            dispatch_uncertain: false,
            cli_used: false,
            api_failure: None,
        }
    }

    /// Deterministic workspace identity for a node within a run.
    pub fn derive_workspace_identity(run_id: &RunId, node_id: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(run_id.as_str().as_bytes());
        hasher.update(b"/");
        hasher.update(node_id.as_bytes());
        let hex = hasher.finalize().to_hex();
        format!("ws-{}", &hex.as_str()[..16])
    }

    /// Deterministic dispatch id for one activation; retries of the same
    /// activation reuse it so the idempotency gate can reject them.
    pub fn derive_dispatch_id(run_id: &RunId, node_id: &str, execution_index: u32) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(run_id.as_str().as_bytes());
        hasher.update(b"/");
        hasher.update(node_id.as_bytes());
        hasher.update(b"#");
        hasher.update(&execution_index.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        format!("dsp-{}", &hex.as_str()[..20])
    }

    pub fn metadata(&self) -> RunMetadata {
        RunMetadata {
            selected_provider: self.selected_provider,
            final_provider: self.final_provider,
            dispatch_id: self.dispatch_id.clone(),
            dispatch_status: self.dispatch_status,
            fallback_attempted: self.fallback_attempted,
            fallback_reason: self.fallback_reason,
            dispatch_uncertain: self.dispatch_uncertain,
            cli_used: self.cli_used,
            api_failure: self.api_failure,
        }
    }

    pub fn compute_request(&self, remote: Option<serde_json::Value>) -> ComputeRequest {
        ComputeRequest {
            run_id: self.run_id.clone(),
            graph_id: self.graph_id.clone(),
            node: self.node.clone(),
            execution_index: self.execution_index,
            input: self.input.clone(),
            workspace_identity: self.workspace_identity.clone(),
            remote,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Uniform outcome of every backend and every fallback path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    pub output_state: serde_json::Value,
    pub routing_state: RoutingState,
    pub run_metadata: RunMetadata,
    pub workspace_identity: String,
    pub execution_index: u32,
}

impl ExecutionResult {
    pub fn succeeded(request: &ExecutionRequest, output: ComputeOutput) -> Self {
        Self {
            status: ExecutionStatus::Success,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            reason: None,
            output_state: output.output_state,
            routing_state: output.routing_state,
            run_metadata: request.metadata(),
            workspace_identity: request.workspace_identity.clone(),
            execution_index: request.execution_index,
        }
    }

    pub fn failed(request: &ExecutionRequest, reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            reason: Some(reason),
            output_state: serde_json::Value::Null,
            routing_state: RoutingState::default(),
            run_metadata: request.metadata(),
            workspace_identity: request.workspace_identity.clone(),
            execution_index: request.execution_index,
        }
    }

    pub fn with_process_output(mut self, exit_code: Option<i64>, logs: &UnitLogs) -> Self {
        self.exit_code = exit_code;
        self.stdout = logs.stdout.clone();
        self.stderr = logs.stderr.clone();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// What the node-type compute callback receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub run_id: RunId,
    pub graph_id: String,
    pub node: CompiledNode,
    pub execution_index: u32,
    pub input: InputContext,
    pub workspace_identity: String,
    /// Result payload reported by a confirmed remote unit, if any.
    #[serde(default)]
    pub remote: Option<serde_json::Value>,
}

/// What the node-type compute callback returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeOutput {
    pub output_state: serde_json::Value,
    #[serde(default)]
    pub routing_state: RoutingState,
}

impl ComputeOutput {
    pub fn new(output_state: serde_json::Value) -> Self {
        Self {
            output_state,
            routing_state: RoutingState::default(),
        }
    }

    pub fn with_routing(mut self, routing_state: RoutingState) -> Self {
        self.routing_state = routing_state;
        self
    }
}

/// Descriptor for one remote unit (container or cluster job).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub network_mode: Option<String>,
}

/// Captured output of a finished remote unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Durable idempotency record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub scope: String,
    pub key: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub hit_count: u64,
}

/// Events broadcast to observers such as dashboards.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum RunEvent {
    #[serde(rename = "run.updated")]
    RunUpdated {
        run_id: RunId,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_message: Option<String>,
    },
    #[serde(rename = "node.updated")]
    NodeUpdated {
        run_id: RunId,
        node_id: String,
        status: NodeRunStatus,
        execution_index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        runtime_evidence: Option<RunMetadata>,
    },
}

impl RunEvent {
    pub fn run(run: &Run) -> Self {
        Self::RunUpdated {
            run_id: run.id.clone(),
            status: run.status,
            failure_message: run.failure_message.clone(),
        }
    }

    pub fn node(node_run: &NodeRun) -> Self {
        Self::NodeUpdated {
            run_id: node_run.run_id.clone(),
            node_id: node_run.node_id.clone(),
            status: node_run.status,
            execution_index: node_run.execution_index,
            error: node_run.error.clone(),
            runtime_evidence: node_run.dispatch.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Stopping.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert_eq!("canceled".parse::<RunStatus>().unwrap(), RunStatus::Canceled);
    }

    #[test]
    fn test_next_generation_links_parent() {
        let first = Run::queued("g1");
        let second = first.next_generation();
        assert_eq!(second.generation, 2);
        assert_eq!(second.parent_run_id, Some(first.id.clone()));
        assert_eq!(second.status, RunStatus::Queued);
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn test_dispatch_and_workspace_ids_are_deterministic() {
        let run = RunId::from_str("run-1");
        let a = ExecutionRequest::derive_dispatch_id(&run, "task", 1);
        let b = ExecutionRequest::derive_dispatch_id(&run, "task", 1);
        let c = ExecutionRequest::derive_dispatch_id(&run, "task", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("dsp-"));

        let ws = ExecutionRequest::derive_workspace_identity(&run, "task");
        assert_eq!(ws, ExecutionRequest::derive_workspace_identity(&run, "task"));
        assert_ne!(ws, ExecutionRequest::derive_workspace_identity(&run, "other"));
    }

    #[test]
    fn test_transport_kind_from_message() {
        assert_eq!(
            TransportErrorKind::from_message("Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            TransportErrorKind::SocketUnreachable
        );
        assert_eq!(
            TransportErrorKind::from_message("connect: No such file or directory (os error 2)"),
            TransportErrorKind::SocketMissing
        );
        assert_eq!(
            TransportErrorKind::from_message("permission denied while trying to connect"),
            TransportErrorKind::AuthError
        );
        assert_eq!(
            TransportErrorKind::from_message("operation timed out"),
            TransportErrorKind::Timeout
        );
        assert_eq!(
            TransportErrorKind::from_message("invalid peer certificate"),
            TransportErrorKind::TlsError
        );
        assert_eq!(TransportErrorKind::from_message("boom"), TransportErrorKind::Other);
    }

    #[test]
    fn test_routing_state_flattens_extra_fields() {
        let json = serde_json::json!({"route_key": "A", "confidence": 0.9});
        let state: RoutingState = serde_json::from_value(json).unwrap();
        assert_eq!(state.route_key.as_deref(), Some("A"));
        assert!(!state.terminate_run);
        assert_eq!(state.extra.get("confidence"), Some(&serde_json::json!(0.9)));
    }

    #[test]
    fn test_node_event_serializes_with_dotted_name() {
        let mut nr = NodeRun::running(RunId::from_str("r"), "n", 1, serde_json::json!({}));
        nr.fail("boom", None);
        let value = serde_json::to_value(RunEvent::node(&nr)).unwrap();
        assert_eq!(value["event"], "node.updated");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "boom");
    }
}
