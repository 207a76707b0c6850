use std::io::Write;

use weft_core::config::AppConfig;
use weft_core::graph::{CompiledGraph, EdgeMode, Graph, NodeKind};
use weft_core::types::ProviderKind;

fn write_temp(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write file");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[scheduler]
max_node_executions = 40
max_runtime_secs = 120
hard_execution_ceiling = 500

[router]
default_provider = "container"

[router.by_node_type]
retrieval = "cluster_job"
memory = "in_process"

[container]
image = "registry.local/runner:1.2"
command = ["weft", "unit-entry"]
memory_mb = 1024
dispatch_timeout_secs = 90
api_slice_secs = 10
min_cli_budget_secs = 20
cli_binary = "podman"
pull_image = true

[cluster]
base_url = "https://jobs.internal:8443"
token = "cluster-token"
poll_interval_ms = 250

[fallback]
enabled = false

[workspace]
timeout_secs = 45

[storage]
path = "/tmp/weft-test/runs.db"
event_capacity = 32
"#;

    let tmp = write_temp(toml_content, ".toml");
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.scheduler.max_node_executions, 40);
    assert_eq!(config.scheduler.max_runtime_secs, 120);
    assert_eq!(config.scheduler.hard_execution_ceiling, 500);
    assert_eq!(config.scheduler.max_parallelism, 1);

    assert_eq!(config.router.default_provider, ProviderKind::Container);
    assert_eq!(config.router.provider_for(NodeKind::Retrieval), ProviderKind::ClusterJob);
    assert_eq!(config.router.provider_for(NodeKind::Memory), ProviderKind::InProcess);
    assert_eq!(config.router.provider_for(NodeKind::Task), ProviderKind::Container);

    assert_eq!(config.container.image, "registry.local/runner:1.2");
    assert_eq!(config.container.command, vec!["weft", "unit-entry"]);
    assert_eq!(config.container.memory_mb, 1024);
    assert_eq!(config.container.dispatch_timeout_secs, 90);
    assert_eq!(config.container.api_slice_secs, 10);
    assert_eq!(config.container.min_cli_budget_secs, 20);
    assert_eq!(config.container.cli_binary, "podman");
    assert!(config.container.pull_image);
    assert!(config.container.force_kill);

    let cluster = config.cluster.as_ref().expect("cluster present");
    assert_eq!(cluster.base_url, "https://jobs.internal:8443");
    assert_eq!(cluster.token.as_deref(), Some("cluster-token"));
    assert_eq!(cluster.poll_interval_ms, 250);
    assert_eq!(cluster.request_timeout_secs, 30);

    assert!(!config.fallback.enabled);
    assert_eq!(config.workspace.timeout_secs, 45);
    assert_eq!(config.storage.event_capacity, 32);
    assert_eq!(
        config.storage_path().unwrap().to_str(),
        Some("/tmp/weft-test/runs.db")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_CLUSTER_TOKEN", "expanded-token-value");

    let toml_content = r#"
[cluster]
base_url = "http://localhost:9000"
token = "${WEFT_TEST_CLUSTER_TOKEN}"
"#;

    let tmp = write_temp(toml_content, ".toml");
    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.cluster.unwrap().token,
        Some("expanded-token-value".to_string())
    );

    std::env::remove_var("WEFT_TEST_CLUSTER_TOKEN");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_temp("[fallback]\nenabled = true\n", ".toml");
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.scheduler.max_node_executions, 100);
    assert_eq!(config.scheduler.max_runtime_secs, 3600);
    assert_eq!(config.router.default_provider, ProviderKind::InProcess);
    assert!(config.router.by_node_type.is_empty());
    assert_eq!(config.container.cli_binary, "docker");
    assert!(config.container.cli_enabled);
    assert_eq!(config.container.stop_grace_secs, 10);
    assert!(config.cluster.is_none());
    assert!(config.fallback.enabled);
    assert!(config.storage_path().is_none());
}

#[test]
fn test_missing_config_file_is_reported() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/weft.toml")).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/weft.toml"));
}

#[test]
fn test_unknown_provider_is_rejected() {
    let tmp = write_temp("[router]\ndefault_provider = \"mainframe\"\n", ".toml");
    assert!(AppConfig::load(tmp.path()).is_err());
}

#[test]
fn test_graph_file_in_toml_compiles() {
    let graph_toml = r#"
id = "review"
name = "Review loop"

[guardrails]
max_node_executions = 12

[[nodes]]
id = "start"
type = "start"

[[nodes]]
id = "draft"
type = "task"
config = { instructions = "write a draft" }

[[nodes]]
id = "check"
type = "decision"
config = { route = "done", fallback_route = "done" }

[[nodes]]
id = "notes"
type = "memory"

[[nodes]]
id = "end"
type = "end"

[[edges]]
id = "e1"
source_node_id = "start"
target_node_id = "draft"

[[edges]]
id = "e2"
source_node_id = "draft"
target_node_id = "check"

[[edges]]
id = "e3"
source_node_id = "check"
target_node_id = "draft"
condition_key = "again"

[[edges]]
id = "e4"
source_node_id = "check"
target_node_id = "end"
condition_key = "done"

[[edges]]
id = "e5"
source_node_id = "notes"
target_node_id = "draft"
mode = "dotted"
"#;

    let graph: Graph = toml::from_str(graph_toml).expect("parse graph");
    assert_eq!(graph.nodes.len(), 5);
    assert_eq!(graph.edges[4].mode, EdgeMode::Dotted);
    assert_eq!(graph.guardrails.max_node_executions, Some(12));

    let compiled = CompiledGraph::compile(&graph).expect("compile graph");
    assert_eq!(compiled.start_node_id, "start");
    assert_eq!(compiled.node("check").unwrap().kind, NodeKind::Decision);
}

#[test]
fn test_graph_file_in_json_rejects_dangling_edge() {
    let graph_json = r#"{
        "id": "broken",
        "nodes": [{ "id": "start", "type": "start" }],
        "edges": [{ "id": "e1", "source_node_id": "start", "target_node_id": "ghost" }]
    }"#;

    let graph: Graph = serde_json::from_str(graph_json).expect("parse graph");
    let err = CompiledGraph::compile(&graph).unwrap_err();
    assert!(err.to_string().contains("ghost"));
}
