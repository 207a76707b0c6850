use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::graph::NodeKind;
use crate::types::ProviderKind;

/// Top-level Weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Scheduler guardrail defaults. Graph guardrails override these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_node_executions")]
    pub max_node_executions: u32,
    #[serde(default = "default_max_runtime")]
    pub max_runtime_secs: u64,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Absolute execution ceiling no graph can raise.
    #[serde(default = "default_hard_ceiling")]
    pub hard_execution_ceiling: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_node_executions: default_max_node_executions(),
            max_runtime_secs: default_max_runtime(),
            max_parallelism: default_max_parallelism(),
            hard_execution_ceiling: default_hard_ceiling(),
        }
    }
}

fn default_max_node_executions() -> u32 { 100 }
fn default_max_runtime() -> u64 { 3600 }
fn default_max_parallelism() -> usize { 1 }
fn default_hard_ceiling() -> u32 { 1000 }

/// Backend selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_provider")]
    pub default_provider: ProviderKind,
    /// Provider per node type, keyed by the node type name (e.g. `task`).
    #[serde(default)]
    pub by_node_type: HashMap<String, ProviderKind>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            by_node_type: HashMap::new(),
        }
    }
}

impl RouterConfig {
    pub fn provider_for(&self, kind: NodeKind) -> ProviderKind {
        self.by_node_type
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_provider)
    }
}

fn default_provider() -> ProviderKind { ProviderKind::InProcess }

/// Container backend configuration (API first, CLI fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_container_image")]
    pub image: String,
    #[serde(default = "default_container_command")]
    pub command: Vec<String>,
    #[serde(default = "default_container_memory")]
    pub memory_mb: u64,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    /// Overall wall-clock budget for one dispatch, across API and CLI.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    /// Time slice for the API attempt's pre-start phases.
    #[serde(default = "default_api_slice")]
    pub api_slice_secs: u64,
    /// Minimum remaining budget required to switch to the CLI.
    #[serde(default = "default_min_cli_budget")]
    pub min_cli_budget_secs: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_true")]
    pub force_kill: bool,
    #[serde(default = "default_cli_binary")]
    pub cli_binary: String,
    #[serde(default = "default_true")]
    pub cli_enabled: bool,
    #[serde(default)]
    pub pull_image: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_container_image(),
            command: default_container_command(),
            memory_mb: default_container_memory(),
            network_mode: default_network_mode(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            api_slice_secs: default_api_slice(),
            min_cli_budget_secs: default_min_cli_budget(),
            stop_grace_secs: default_stop_grace(),
            force_kill: true,
            cli_binary: default_cli_binary(),
            cli_enabled: true,
            pull_image: false,
        }
    }
}

fn default_container_image() -> String { "ghcr.io/weft/runner:latest".to_string() }
fn default_container_command() -> Vec<String> { vec!["weft-runner".to_string()] }
fn default_container_memory() -> u64 { 512 }
fn default_network_mode() -> String { "none".to_string() }
fn default_dispatch_timeout() -> u64 { 600 }
fn default_api_slice() -> u64 { 30 }
fn default_min_cli_budget() -> u64 { 15 }
fn default_stop_grace() -> u64 { 10 }
fn default_cli_binary() -> String { "docker".to_string() }
fn default_true() -> bool { true }

/// Cluster job API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_container_image")]
    pub image: String,
    #[serde(default = "default_container_command")]
    pub command: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_poll_interval() -> u64 { 1000 }
fn default_request_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Allow downgrading to in-process execution when a remote dispatch
    /// failed outright.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_timeout")]
    pub timeout_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_workspace_timeout(),
        }
    }
}

fn default_workspace_timeout() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. `None` keeps everything in memory.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Resolve the storage path (expand ~).
    pub fn storage_path(&self) -> Option<PathBuf> {
        let path = self.storage.path.as_deref()?;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(path))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.max_node_executions, 100);
        assert_eq!(config.scheduler.max_parallelism, 1);
        assert_eq!(config.router.default_provider, ProviderKind::InProcess);
        assert_eq!(config.container.cli_binary, "docker");
        assert!(config.container.force_kill);
        assert!(config.fallback.enabled);
        assert!(config.cluster.is_none());
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn test_router_by_node_type() {
        let toml_str = r#"
[router]
default_provider = "container"

[router.by_node_type]
decision = "in_process"
retrieval = "cluster_job"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.router.provider_for(NodeKind::Task), ProviderKind::Container);
        assert_eq!(config.router.provider_for(NodeKind::Decision), ProviderKind::InProcess);
        assert_eq!(config.router.provider_for(NodeKind::Retrieval), ProviderKind::ClusterJob);
    }
}
