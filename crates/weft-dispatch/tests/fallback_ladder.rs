use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use weft_core::config::{ContainerConfig, RouterConfig};
use weft_core::graph::{CompiledNode, Node, NodeKind};
use weft_core::marker;
use weft_core::traits::UnitRuntime;
use weft_core::types::*;
use weft_dispatch::remote::Settlement;
use weft_dispatch::{ClusterJobExecutor, ContainerExecutor, ExecutionRouter, WorkspaceExecutor};
use weft_store::MemoryStore;
use weft_test_utils::{init_tracing, FakeUnitRuntime, ScriptedCompute};

const RUN: &str = "run-ladder";

struct Harness {
    api: Arc<FakeUnitRuntime>,
    cli: Arc<FakeUnitRuntime>,
    router: ExecutionRouter,
}

fn container_config() -> ContainerConfig {
    ContainerConfig {
        dispatch_timeout_secs: 60,
        api_slice_secs: 5,
        min_cli_budget_secs: 10,
        stop_grace_secs: 2,
        ..Default::default()
    }
}

fn router_for(default_provider: ProviderKind) -> (ExecutionRouter, Arc<WorkspaceExecutor>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let workspace = Arc::new(WorkspaceExecutor::new(store.clone(), Duration::from_secs(30)));
    let mut router = ExecutionRouter::new(RouterConfig {
        default_provider,
        ..Default::default()
    });
    router.register(workspace.clone());
    (router, workspace, store)
}

fn harness(api: FakeUnitRuntime, cli: FakeUnitRuntime, fallback: bool) -> Harness {
    init_tracing();
    let api = Arc::new(api);
    let cli = Arc::new(cli);
    let (mut router, workspace, store) = router_for(ProviderKind::Container);
    let settlement = Settlement::new(store, workspace, fallback);
    router.register(Arc::new(ContainerExecutor::new(
        api.clone(),
        Some(cli.clone() as Arc<dyn UnitRuntime>),
        container_config(),
        settlement,
    )));
    Harness { api, cli, router }
}

fn request(node_id: &str, execution_index: u32) -> ExecutionRequest {
    let node = CompiledNode::compile(&Node::new(node_id, NodeKind::Task)).unwrap();
    ExecutionRequest::new(
        RunId::from_str(RUN),
        "graph",
        node,
        execution_index,
        InputContext::default(),
    )
}

fn dispatch_id(node_id: &str, execution_index: u32) -> String {
    ExecutionRequest::derive_dispatch_id(&RunId::from_str(RUN), node_id, execution_index)
}

fn unit_id(node_id: &str, execution_index: u32) -> String {
    format!("unit-weft-{}", dispatch_id(node_id, execution_index))
}

/// Identity survives every backend and fallback path.
fn assert_identity(result: &ExecutionResult, node_id: &str, execution_index: u32) {
    assert_eq!(
        result.workspace_identity,
        ExecutionRequest::derive_workspace_identity(&RunId::from_str(RUN), node_id)
    );
    assert_eq!(result.execution_index, execution_index);
    assert_eq!(result.run_metadata.dispatch_id, dispatch_id(node_id, execution_index));
}

#[tokio::test]
async fn test_confirmed_remote_run_invokes_compute_with_payload() {
    let h = harness(
        FakeUnitRuntime::confirming("api", json!({"answer": 42})),
        FakeUnitRuntime::new("cli"),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.run_metadata.selected_provider, ProviderKind::Container);
    assert_eq!(result.run_metadata.final_provider, Some(ProviderKind::Container));
    assert_eq!(result.run_metadata.dispatch_status, DispatchStatus::Confirmed);
    assert!(!result.run_metadata.cli_used);
    assert!(!result.run_metadata.fallback_attempted);
    assert_eq!(result.output_state["remote"], json!({"answer": 42}));
    assert!(result.stdout.contains(marker::STARTED_MARKER));
    assert_identity(&result, "task", 1);

    assert_eq!(compute.calls_for("task"), 1);
    assert!(h.api.calls().contains(&format!("remove {}", unit_id("task", 1))));
    assert!(h.cli.calls().is_empty());

    let spec = &h.api.created_specs()[0];
    assert_eq!(spec.env[marker::env::EXECUTION_INDEX], "1");
    assert_eq!(spec.labels["weft.node_id"], "task");
}

#[tokio::test]
async fn test_create_connection_error_falls_back_in_process() {
    let h = harness(
        FakeUnitRuntime::new("api").fail(UnitPhase::Create, "connection refused"),
        FakeUnitRuntime::confirming("cli", json!({})),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert!(result.is_success(), "{:?}", result.error);
    let meta = &result.run_metadata;
    assert_eq!(meta.final_provider, Some(ProviderKind::InProcess));
    assert!(meta.fallback_attempted);
    assert_eq!(meta.fallback_reason, Some(FailureReason::DispatchFailed));
    assert_eq!(meta.api_failure, Some(TransportErrorKind::SocketUnreachable));
    assert!(!meta.dispatch_uncertain);
    assert_identity(&result, "task", 1);

    assert_eq!(compute.calls_for("task"), 1);
    assert!(compute.calls()[0].remote.is_none());
    assert!(h.cli.calls().is_empty());
}

#[tokio::test]
async fn test_start_failure_removes_unit_then_falls_back() {
    let h = harness(
        FakeUnitRuntime::new("api").fail(UnitPhase::Start, "image entrypoint not found"),
        FakeUnitRuntime::new("cli"),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 2), compute.clone()).await;

    assert!(result.is_success());
    assert_eq!(result.run_metadata.final_provider, Some(ProviderKind::InProcess));
    assert!(h.api.calls().contains(&format!("remove {}", unit_id("task", 2))));
    assert_identity(&result, "task", 2);
}

#[tokio::test]
async fn test_missing_marker_fails_closed_without_fallback() {
    let h = harness(
        FakeUnitRuntime::new("api").with_stdout("started work\nresult: ok\n"),
        FakeUnitRuntime::confirming("cli", json!({})),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::MarkerMissing));
    assert!(result.run_metadata.dispatch_uncertain);
    assert!(!result.run_metadata.fallback_attempted);
    assert_eq!(result.run_metadata.final_provider, Some(ProviderKind::Container));
    assert_eq!(result.stdout, "started work\nresult: ok\n");
    assert_identity(&result, "task", 1);
    assert_eq!(compute.calls_for("task"), 0);
    assert!(h.cli.calls().is_empty());
}

#[tokio::test]
async fn test_marker_for_another_dispatch_is_ambiguous() {
    let stdout = format!(
        "{}\n{}\n",
        marker::started_line(&dispatch_id("task", 9)),
        marker::result_line(&json!({}))
    );
    let h = harness(
        FakeUnitRuntime::new("api").with_stdout(&stdout),
        FakeUnitRuntime::new("cli"),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert_eq!(result.reason, Some(FailureReason::MarkerMissing));
    assert!(result.run_metadata.dispatch_uncertain);
    assert_eq!(compute.calls_for("task"), 0);
}

#[tokio::test]
async fn test_unreadable_payload_fails_closed() {
    let stdout = format!(
        "{}\n{} {{not json\n",
        marker::started_line(&dispatch_id("task", 1)),
        marker::RESULT_MARKER
    );
    let h = harness(
        FakeUnitRuntime::new("api").with_stdout(&stdout),
        FakeUnitRuntime::new("cli"),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert_eq!(result.reason, Some(FailureReason::InvalidPayload));
    assert!(result.run_metadata.dispatch_uncertain);
    assert!(!result.run_metadata.fallback_attempted);
    assert_eq!(compute.calls_for("task"), 0);
}

#[tokio::test]
async fn test_non_zero_exit_fails_without_compute() {
    let h = harness(
        FakeUnitRuntime::confirming("api", json!({})).with_exit_code(3),
        FakeUnitRuntime::new("cli"),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert_eq!(result.reason, Some(FailureReason::RemoteExitNonZero));
    assert_eq!(result.exit_code, Some(3));
    assert!(!result.run_metadata.dispatch_uncertain);
    assert!(!result.run_metadata.fallback_attempted);
    assert_eq!(compute.calls_for("task"), 0);
}

#[tokio::test]
async fn test_duplicate_confirmation_does_not_compute_twice() {
    let h = harness(
        FakeUnitRuntime::confirming("api", json!({"n": 1})),
        FakeUnitRuntime::new("cli"),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let first = h.router.dispatch(request("task", 1), compute.clone()).await;
    let second = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert!(first.is_success());
    assert_eq!(second.status, ExecutionStatus::Failed);
    assert_eq!(second.reason, Some(FailureReason::DuplicateDispatch));
    assert_eq!(compute.calls_for("task"), 1);

    // A later activation of the same node has its own dispatch id.
    let third = h.router.dispatch(request("task", 2), compute.clone()).await;
    assert!(third.is_success());
    assert_eq!(compute.calls_for("task"), 2);
}

#[tokio::test]
async fn test_unreachable_api_switches_to_cli() {
    let h = harness(
        FakeUnitRuntime::new("api").fail(
            UnitPhase::Probe,
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
        ),
        FakeUnitRuntime::confirming("cli", json!({"via": "cli"})),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert!(result.is_success(), "{:?}", result.error);
    let meta = &result.run_metadata;
    assert!(meta.cli_used);
    assert_eq!(meta.api_failure, Some(TransportErrorKind::SocketUnreachable));
    assert_eq!(meta.final_provider, Some(ProviderKind::Container));
    assert!(!meta.fallback_attempted);
    assert_eq!(result.output_state["remote"], json!({"via": "cli"}));
    assert_identity(&result, "task", 1);

    assert_eq!(h.api.calls(), vec!["probe".to_string()]);
    assert!(h.cli.called("create"));
}

#[tokio::test]
async fn test_cli_unavailable_falls_back_in_process() {
    let h = harness(
        FakeUnitRuntime::new("api").fail(UnitPhase::Probe, "permission denied while trying to connect"),
        FakeUnitRuntime::new("cli").fail(UnitPhase::Probe, "docker: executable not found in PATH"),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert!(result.is_success());
    let meta = &result.run_metadata;
    assert_eq!(meta.fallback_reason, Some(FailureReason::CliUnavailable));
    assert_eq!(meta.api_failure, Some(TransportErrorKind::AuthError));
    assert_eq!(meta.final_provider, Some(ProviderKind::InProcess));
    assert!(!meta.cli_used);
    assert!(!h.cli.called("create"));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_api_switches_to_cli_with_remaining_budget() {
    let h = harness(
        FakeUnitRuntime::new("api").hang(UnitPhase::Create),
        FakeUnitRuntime::confirming("cli", json!({})),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert!(result.run_metadata.cli_used);
    assert_eq!(result.run_metadata.api_failure, Some(TransportErrorKind::Timeout));
    assert_eq!(compute.calls_for("task"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_create_that_lands_does_not_block_cli_unit() {
    let daemon = Arc::new(Mutex::new(HashSet::new()));
    let h = harness(
        FakeUnitRuntime::new("api")
            .hang(UnitPhase::Create)
            .on_daemon(daemon.clone()),
        FakeUnitRuntime::confirming("cli", json!({"via": "cli"})).on_daemon(daemon.clone()),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert!(result.is_success(), "{:?}", result.error);
    let meta = &result.run_metadata;
    assert!(meta.cli_used);
    assert!(!meta.fallback_attempted);
    assert_eq!(meta.final_provider, Some(ProviderKind::Container));
    assert_eq!(result.output_state["remote"], json!({"via": "cli"}));

    let api_name = format!("weft-{}", dispatch_id("task", 1));
    let cli_specs = h.cli.created_specs();
    assert_eq!(cli_specs.len(), 1);
    assert_eq!(cli_specs[0].name, format!("{}-cli", api_name));
    assert!(h.cli.calls().contains(&format!("remove {}", api_name)));
    assert!(daemon.lock().unwrap().is_empty());
    assert_identity(&result, "task", 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_tears_down_and_fails_uncertain() {
    let h = harness(
        FakeUnitRuntime::confirming("api", json!({})).hang(UnitPhase::Wait),
        FakeUnitRuntime::confirming("cli", json!({})),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::DispatchTimeout));
    assert!(result.run_metadata.dispatch_uncertain);
    assert!(!result.run_metadata.fallback_attempted);
    assert_eq!(compute.calls_for("task"), 0);
    assert!(h.cli.calls().is_empty());

    let unit = unit_id("task", 1);
    let calls = h.api.calls();
    let stop = calls.iter().position(|c| *c == format!("stop {} 2", unit)).unwrap();
    let kill = calls.iter().position(|c| *c == format!("kill {}", unit)).unwrap();
    let remove = calls.iter().position(|c| *c == format!("remove {}", unit)).unwrap();
    assert!(stop < kill && kill < remove);
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout_is_ambiguous() {
    let h = harness(
        FakeUnitRuntime::confirming("api", json!({})).hang(UnitPhase::Start),
        FakeUnitRuntime::new("cli"),
        true,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 1), compute.clone()).await;

    assert_eq!(result.reason, Some(FailureReason::AmbiguousState));
    assert!(result.run_metadata.dispatch_uncertain);
    assert!(!result.run_metadata.fallback_attempted);
    assert_eq!(compute.calls_for("task"), 0);
}

#[tokio::test]
async fn test_fallback_disabled_fails_dispatch() {
    let h = harness(
        FakeUnitRuntime::new("api").fail(UnitPhase::Create, "connection refused"),
        FakeUnitRuntime::new("cli"),
        false,
    );
    let compute = Arc::new(ScriptedCompute::new());

    let result = h.router.dispatch(request("task", 4), compute.clone()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.reason, Some(FailureReason::DispatchFailed));
    assert!(!result.run_metadata.fallback_attempted);
    assert!(!result.run_metadata.dispatch_uncertain);
    assert_eq!(result.run_metadata.dispatch_status, DispatchStatus::Failed);
    assert_identity(&result, "task", 4);
    assert_eq!(compute.calls_for("task"), 0);
}

#[tokio::test]
async fn test_cluster_job_confirms_and_falls_back() {
    init_tracing();
    let cluster_config = weft_core::config::ClusterConfig {
        base_url: "http://cluster.invalid".into(),
        token: None,
        image: "runner".into(),
        command: vec![],
        poll_interval_ms: 10,
        dispatch_timeout_secs: 60,
        request_timeout_secs: 5,
    };

    let (mut router, workspace, store) = router_for(ProviderKind::ClusterJob);
    let runtime = Arc::new(FakeUnitRuntime::confirming("cluster", json!({"job": "done"})));
    router.register(Arc::new(ClusterJobExecutor::new(
        runtime.clone(),
        cluster_config.clone(),
        Settlement::new(store.clone(), workspace.clone(), true),
    )));
    let compute = Arc::new(ScriptedCompute::new());

    let result = router.dispatch(request("job", 1), compute.clone()).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.run_metadata.final_provider, Some(ProviderKind::ClusterJob));
    assert_eq!(result.output_state["remote"], json!({"job": "done"}));
    assert!(!runtime.called("pull"));

    let (mut router, workspace, store) = router_for(ProviderKind::ClusterJob);
    router.register(Arc::new(ClusterJobExecutor::new(
        Arc::new(FakeUnitRuntime::new("cluster").fail(UnitPhase::Create, "HTTP 503 Service Unavailable")),
        cluster_config,
        Settlement::new(store, workspace, true),
    )));
    let result = router.dispatch(request("job", 1), compute.clone()).await;
    assert!(result.is_success());
    assert_eq!(result.run_metadata.selected_provider, ProviderKind::ClusterJob);
    assert_eq!(result.run_metadata.final_provider, Some(ProviderKind::InProcess));
    assert!(result.run_metadata.fallback_attempted);
    assert_identity(&result, "job", 1);
}
