use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::graph::Graph;
use weft_core::traits::{IdempotencyRegistry, RunStore};
use weft_core::types::{IdempotencyKey, NodeRun, Run, RunId, RunStatus};

use crate::apply_transition;

#[derive(Default)]
struct Inner {
    graphs: HashMap<String, Graph>,
    runs: HashMap<RunId, Run>,
    run_order: Vec<RunId>,
    node_runs: Vec<NodeRun>,
    idempotency: HashMap<(String, String), IdempotencyKey>,
}

/// Process-local store. Used by tests and by `weft run` without a database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| WeftError::Database("memory store lock poisoned".into()))
    }
}

impl RunStore for MemoryStore {
    fn put_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>> {
        let graph = graph.clone();
        Box::pin(async move {
            self.lock()?.graphs.insert(graph.id.clone(), graph);
            Ok(())
        })
    }

    fn get_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            self.lock()?
                .graphs
                .get(&graph_id)
                .cloned()
                .ok_or_else(|| WeftError::not_found("graph", graph_id))
        })
    }

    fn create_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            if inner.runs.contains_key(&run.id) {
                return Err(WeftError::Database(format!("run already exists: {}", run.id)));
            }
            inner.run_order.push(run.id.clone());
            inner.runs.insert(run.id.clone(), run);
            Ok(())
        })
    }

    fn get_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.lock()?
                .runs
                .get(&run_id)
                .cloned()
                .ok_or_else(|| WeftError::not_found("run", run_id.0))
        })
    }

    fn list_runs(&self, graph_id: &str) -> BoxFuture<'_, Result<Vec<Run>>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner
                .run_order
                .iter()
                .filter_map(|id| inner.runs.get(id))
                .filter(|r| r.graph_id == graph_id)
                .cloned()
                .collect())
        })
    }

    fn transition_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        failure_message: Option<String>,
    ) -> BoxFuture<'_, Result<Run>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| WeftError::not_found("run", run_id.0.clone()))?;
            apply_transition(run, status, failure_message);
            Ok(run.clone())
        })
    }

    fn claim_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| WeftError::not_found("run", run_id.0.clone()))?;
            if run.status != RunStatus::Queued {
                return Ok(None);
            }
            apply_transition(run, RunStatus::Running, None);
            Ok(Some(run.clone()))
        })
    }

    fn request_stop(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| WeftError::not_found("run", run_id.0.clone()))?;
            if matches!(run.status, RunStatus::Queued | RunStatus::Running) {
                run.status = RunStatus::Stopping;
            }
            Ok(run.clone())
        })
    }

    fn cancel_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let run = inner
                .runs
                .get_mut(&run_id)
                .ok_or_else(|| WeftError::not_found("run", run_id.0.clone()))?;
            apply_transition(run, RunStatus::Canceled, None);
            Ok(run.clone())
        })
    }

    fn insert_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>> {
        let node_run = node_run.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let clash = inner.node_runs.iter().any(|nr| {
                nr.run_id == node_run.run_id
                    && nr.node_id == node_run.node_id
                    && nr.execution_index >= node_run.execution_index
            });
            if clash {
                return Err(WeftError::Database(format!(
                    "execution index {} for node {} is not increasing",
                    node_run.execution_index, node_run.node_id
                )));
            }
            inner.node_runs.push(node_run);
            Ok(())
        })
    }

    fn update_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>> {
        let node_run = node_run.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let slot = inner
                .node_runs
                .iter_mut()
                .find(|nr| nr.id == node_run.id)
                .ok_or_else(|| WeftError::not_found("node run", node_run.id.clone()))?;
            *slot = node_run;
            Ok(())
        })
    }

    fn list_node_runs(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<NodeRun>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            Ok(self
                .lock()?
                .node_runs
                .iter()
                .filter(|nr| nr.run_id == run_id)
                .cloned()
                .collect())
        })
    }
}

impl IdempotencyRegistry for MemoryStore {
    fn register(&self, scope: &str, key: &str) -> BoxFuture<'_, Result<bool>> {
        let id = (scope.to_string(), key.to_string());
        Box::pin(async move {
            let mut inner = self.lock()?;
            let now = Utc::now();
            match inner.idempotency.get_mut(&id) {
                Some(existing) => {
                    existing.hit_count += 1;
                    existing.last_seen_at = now;
                    Ok(false)
                }
                None => {
                    inner.idempotency.insert(
                        id.clone(),
                        IdempotencyKey {
                            scope: id.0,
                            key: id.1,
                            first_seen_at: now,
                            last_seen_at: now,
                            hit_count: 1,
                        },
                    );
                    Ok(true)
                }
            }
        })
    }

    fn lookup(&self, scope: &str, key: &str) -> BoxFuture<'_, Result<Option<IdempotencyKey>>> {
        let id = (scope.to_string(), key.to_string());
        Box::pin(async move { Ok(self.lock()?.idempotency.get(&id).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_accepts_once() {
        let store = MemoryStore::new();
        assert!(store.register("run-1", "dsp-a").await.unwrap());
        assert!(!store.register("run-1", "dsp-a").await.unwrap());
        assert!(store.register("run-2", "dsp-a").await.unwrap());

        let rec = store.lookup("run-1", "dsp-a").await.unwrap().unwrap();
        assert_eq!(rec.hit_count, 2);
    }

    #[tokio::test]
    async fn test_claim_only_queued() {
        let store = MemoryStore::new();
        let run = Run::queued("g");
        store.create_run(&run).await.unwrap();

        let claimed = store.claim_run(&run.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.started_at.is_some());
        assert!(store.claim_run(&run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_sticks() {
        let store = MemoryStore::new();
        let run = Run::queued("g");
        store.create_run(&run).await.unwrap();
        store.cancel_run(&run.id).await.unwrap();

        let after = store
            .transition_run(&run.id, RunStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(after.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn test_execution_index_must_increase() {
        let store = MemoryStore::new();
        let run_id = RunId::from_str("r");
        let first = NodeRun::running(run_id.clone(), "n", 1, serde_json::json!({}));
        store.insert_node_run(&first).await.unwrap();
        let dup = NodeRun::running(run_id.clone(), "n", 1, serde_json::json!({}));
        assert!(store.insert_node_run(&dup).await.is_err());
        let next = NodeRun::running(run_id, "n", 2, serde_json::json!({}));
        store.insert_node_run(&next).await.unwrap();
    }
}
