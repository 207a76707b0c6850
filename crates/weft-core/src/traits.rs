use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{Result, TransportResult};
use crate::graph::Graph;
use crate::types::*;

/// Node-type compute callback: the semantic work of one node type.
///
/// Must be safe to invoke at most once per activation; executors gate it
/// behind the idempotency registry.
pub trait NodeCompute: Send + Sync + 'static {
    fn compute(&self, request: ComputeRequest) -> BoxFuture<'_, Result<ComputeOutput>>;
}

/// One execution backend.
///
/// Every terminal path returns an `ExecutionResult`; executors never
/// surface transport failures as `Err`.
pub trait ProviderExecutor: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    fn execute(
        &self,
        request: ExecutionRequest,
        compute: Arc<dyn NodeCompute>,
    ) -> BoxFuture<'_, ExecutionResult>;
}

/// Remote unit lifecycle primitives shared by the container API, the
/// container CLI, and the cluster job API.
pub trait UnitRuntime: Send + Sync + 'static {
    /// Short name used in logs (e.g. "docker-api").
    fn name(&self) -> &str;

    /// Check the backend is reachable.
    fn probe(&self) -> BoxFuture<'_, TransportResult<()>>;

    /// Make sure `image` is available.
    fn pull(&self, image: &str) -> BoxFuture<'_, TransportResult<()>> {
        let _ = image;
        Box::pin(async { Ok(()) })
    }

    /// Create the unit; returns its backend id.
    fn create(&self, spec: &UnitSpec) -> BoxFuture<'_, TransportResult<String>>;

    fn start(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>>;

    /// Block until the unit finishes; returns its exit code.
    fn wait(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<i64>>;

    fn logs(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<UnitLogs>>;

    /// Graceful stop with a grace period.
    fn stop(&self, unit_id: &str, grace: Duration) -> BoxFuture<'_, TransportResult<()>>;

    fn kill(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>>;

    fn remove(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>>;
}

/// Durable at-most-once acceptance of `(scope, key)` pairs.
pub trait IdempotencyRegistry: Send + Sync + 'static {
    /// Returns `true` on first acceptance, `false` for every repeat.
    fn register(&self, scope: &str, key: &str) -> BoxFuture<'_, Result<bool>>;

    fn lookup(&self, scope: &str, key: &str) -> BoxFuture<'_, Result<Option<IdempotencyKey>>>;
}

/// Persistence backend for graphs, runs, and node runs.
pub trait RunStore: Send + Sync + 'static {
    fn put_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>>;

    fn get_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>>;

    fn create_run(&self, run: &Run) -> BoxFuture<'_, Result<()>>;

    fn get_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>>;

    fn list_runs(&self, graph_id: &str) -> BoxFuture<'_, Result<Vec<Run>>>;

    /// Set a run's status, stamping start/finish times and the failure message.
    fn transition_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        failure_message: Option<String>,
    ) -> BoxFuture<'_, Result<Run>>;

    /// Atomically claim a queued run for execution (`queued -> running`).
    /// Returns `None` when the run is not queued.
    fn claim_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>>;

    /// Ask a non-terminal run to stop between activations.
    fn request_stop(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>>;

    /// Cancel a non-terminal run.
    fn cancel_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Run>>;

    fn insert_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>>;

    fn update_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>>;

    /// Node runs of a run, in insertion order.
    fn list_node_runs(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<NodeRun>>>;
}

/// Opaque job-queue submission for runs.
pub trait RunQueue: Send + Sync + 'static {
    fn enqueue_run(&self, graph_id: &str, run_id: &RunId) -> BoxFuture<'_, Result<()>>;
}
