use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use weft_core::config::SchedulerConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::graph::{CompiledGraph, NodeKind};
use weft_core::traits::{RunQueue, RunStore};
use weft_core::types::{
    ActivationToken, ExecutionRequest, InputContext, NodeRun, Run, RunEvent, RunId, RunStatus,
};
use weft_dispatch::ExecutionRouter;

use crate::dispatch::DispatchTable;
use crate::joins::JoinBuffer;
use crate::routing;
use crate::topology::Topology;

/// A node waiting to run with the tokens that released it.
#[derive(Debug, Clone)]
struct Activation {
    node_id: String,
    tokens: Vec<ActivationToken>,
}

/// How the activation loop ended.
#[derive(Debug)]
enum Outcome {
    /// Queue drained or a terminate signal.
    Completed,
    /// Routed back to `start`; a successor run carries on.
    CycledToStart,
    /// Stop requested between activations.
    Stopped,
    /// Canceled between activations.
    Canceled,
    Failed(String),
}

/// How one activation ended.
enum Step {
    Continue,
    Terminate,
    CycleToStart,
    Failed(String),
}

/// Resolved per-run limits.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_node_executions: u32,
    max_runtime: Duration,
    max_parallelism: usize,
}

impl Limits {
    fn resolve(config: &SchedulerConfig, graph: &CompiledGraph) -> Self {
        let g = &graph.guardrails;
        Self {
            max_node_executions: g
                .max_node_executions
                .unwrap_or(config.max_node_executions)
                .min(config.hard_execution_ceiling),
            max_runtime: Duration::from_secs(g.max_runtime_secs.unwrap_or(config.max_runtime_secs)),
            max_parallelism: g
                .max_parallelism
                .unwrap_or(config.max_parallelism)
                .max(1),
        }
    }
}

/// Mutable state of one run, owned by the task driving it.
struct RunState<'g> {
    graph: &'g CompiledGraph,
    topology: Topology,
    limits: Limits,
    queue: VecDeque<Activation>,
    joins: JoinBuffer,
    /// Latest output per node, read by dotted edges.
    latest: HashMap<String, serde_json::Value>,
    executions: HashMap<String, u32>,
    executed: u32,
    sequence: u64,
    started: Instant,
}

impl<'g> RunState<'g> {
    fn new(graph: &'g CompiledGraph, limits: Limits) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(Activation {
            node_id: graph.start_node_id.clone(),
            tokens: Vec::new(),
        });
        Self {
            graph,
            topology: Topology::build(graph),
            limits,
            queue,
            joins: JoinBuffer::new(),
            latest: HashMap::new(),
            executions: HashMap::new(),
            executed: 0,
            sequence: 0,
            started: Instant::now(),
        }
    }

    fn next_index(&mut self, node_id: &str) -> u32 {
        let n = self.executions.entry(node_id.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    fn guardrail_breach(&self) -> Option<String> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.limits.max_runtime {
            return Some(format!(
                "run exceeded max runtime of {}s",
                self.limits.max_runtime.as_secs()
            ));
        }
        if self.executed >= self.limits.max_node_executions {
            return Some(format!(
                "run reached max node executions ({})",
                self.limits.max_node_executions
            ));
        }
        None
    }

    fn input_for(&self, activation: &Activation) -> InputContext {
        let context = self
            .topology
            .dotted_sources(&activation.node_id)
            .filter_map(|src| self.latest.get(src).map(|v| (src.to_string(), v.clone())))
            .collect();
        InputContext {
            tokens: activation.tokens.clone(),
            context,
        }
    }
}

/// Drives graph runs: activation queue, joins, guardrails, and run
/// lifecycle transitions.
pub struct Scheduler {
    store: Arc<dyn RunStore>,
    router: Arc<ExecutionRouter>,
    table: Arc<DispatchTable>,
    queue: Arc<dyn RunQueue>,
    events: Arc<EventBus>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RunStore>,
        router: Arc<ExecutionRouter>,
        table: Arc<DispatchTable>,
        queue: Arc<dyn RunQueue>,
        events: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            router,
            table,
            queue,
            events,
            config,
        }
    }

    /// Drive one queued run to a terminal state.
    ///
    /// A run that is not `queued` (a duplicate job delivery) is returned
    /// unchanged.
    pub async fn run_graph(&self, graph_id: &str, run_id: &RunId) -> Result<Run> {
        let Some(run) = self.store.claim_run(run_id).await? else {
            let run = self.store.get_run(run_id).await?;
            info!(run_id = %run_id, status = %run.status, "Run is not queued, skipping delivery");
            return Ok(run);
        };
        if run.graph_id != graph_id {
            warn!(
                run_id = %run_id,
                job_graph = %graph_id,
                run_graph = %run.graph_id,
                "Job graph id differs from the run's, using the run's"
            );
        }
        info!(run_id = %run.id, graph_id = %run.graph_id, generation = run.generation, "Run started");
        self.events.publish(RunEvent::run(&run));

        let outcome = match self.drive(&run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Run aborted");
                Outcome::Failed(e.to_string())
            }
        };
        self.finalize(&run, outcome).await
    }

    async fn drive(&self, run: &Run) -> Result<Outcome> {
        let graph = self.store.get_graph(&run.graph_id).await?;
        let compiled = match CompiledGraph::compile(&graph) {
            Ok(c) => c,
            Err(e) if e.is_definition_error() => {
                warn!(run_id = %run.id, error = %e, "Graph failed validation");
                return Ok(Outcome::Failed(e.to_string()));
            }
            Err(e) => return Err(e),
        };
        let limits = Limits::resolve(&self.config, &compiled);
        let mut state = RunState::new(&compiled, limits);

        loop {
            if state.queue.is_empty() {
                debug!(run_id = %run.id, "Activation queue drained");
                return Ok(Outcome::Completed);
            }

            match self.store.get_run(&run.id).await?.status {
                RunStatus::Stopping => return Ok(Outcome::Stopped),
                RunStatus::Canceled => return Ok(Outcome::Canceled),
                _ => {}
            }

            let take = state.limits.max_parallelism.min(state.queue.len());
            let batch: Vec<Activation> = state.queue.drain(..take).collect();

            for activation in batch {
                if let Some(message) = state.guardrail_breach() {
                    self.record_guardrail(run, &mut state, &activation, &message)
                        .await?;
                    return Ok(Outcome::Failed(
                        WeftError::GuardrailExceeded(message).to_string(),
                    ));
                }

                match self.activate(run, &mut state, activation).await? {
                    Step::Continue => {}
                    Step::Terminate => return Ok(Outcome::Completed),
                    Step::CycleToStart => return Ok(Outcome::CycledToStart),
                    Step::Failed(message) => return Ok(Outcome::Failed(message)),
                }
            }
        }
    }

    /// Synthetic failed node run for the activation a guardrail blocked.
    async fn record_guardrail(
        &self,
        run: &Run,
        state: &mut RunState<'_>,
        activation: &Activation,
        message: &str,
    ) -> Result<()> {
        warn!(run_id = %run.id, node_id = %activation.node_id, reason = %message, "Guardrail breached");
        let index = state.next_index(&activation.node_id);
        let input = state.input_for(activation);
        let mut node_run = NodeRun::running(run.id.clone(), &activation.node_id, index, input.to_value());
        node_run.fail(WeftError::GuardrailExceeded(message.to_string()).to_string(), None);
        self.store.insert_node_run(&node_run).await?;
        self.events.publish(RunEvent::node(&node_run));
        Ok(())
    }

    async fn activate(
        &self,
        run: &Run,
        state: &mut RunState<'_>,
        activation: Activation,
    ) -> Result<Step> {
        let graph = state.graph;
        let node = graph.node(&activation.node_id).ok_or_else(|| {
            WeftError::GraphDefinition(format!("activation for unknown node {}", activation.node_id))
        })?;

        let index = state.next_index(&node.id);
        state.executed += 1;
        let input = state.input_for(&activation);

        let mut node_run = NodeRun::running(run.id.clone(), &node.id, index, input.to_value());
        self.store.insert_node_run(&node_run).await?;
        self.events.publish(RunEvent::node(&node_run));
        debug!(run_id = %run.id, node_id = %node.id, execution_index = index, "Activation started");

        let compute = match self.table.get(node.kind) {
            Ok(c) => c,
            Err(e) => return self.fail_node(node_run, e.to_string(), None).await,
        };

        let request = ExecutionRequest::new(run.id.clone(), &graph.id, node.clone(), index, input);
        let result = self.router.dispatch(request, compute).await;
        let metadata = result.run_metadata.clone();

        if !result.is_success() {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "activation failed".to_string());
            let message = match result.reason {
                Some(reason) => format!("node {} failed ({}): {}", node.id, reason, message),
                None => format!("node {} failed: {}", node.id, message),
            };
            return self.fail_node(node_run, message, Some(metadata)).await;
        }

        state
            .latest
            .insert(node.id.clone(), result.output_state.clone());

        if node.kind == NodeKind::End || result.routing_state.terminate_run {
            node_run.complete(result.output_state, result.routing_state, metadata);
            self.save_node(&node_run).await?;
            info!(run_id = %run.id, node_id = %node.id, "Terminate signal");
            return Ok(Step::Terminate);
        }

        let edges = match routing::resolve(
            node,
            state.topology.outgoing(&node.id),
            &result.routing_state,
        ) {
            Ok(edges) => edges,
            Err(e) => return self.fail_node(node_run, e.to_string(), Some(metadata)).await,
        };
        let targets: Vec<(String, String)> = edges
            .iter()
            .map(|e| (e.id.clone(), e.target_node_id.clone()))
            .collect();

        node_run.complete(
            result.output_state.clone(),
            result.routing_state.clone(),
            metadata,
        );
        self.save_node(&node_run).await?;

        if targets.iter().any(|(_, target)| *target == graph.start_node_id) {
            info!(run_id = %run.id, node_id = %node.id, "Routed back to start");
            return Ok(Step::CycleToStart);
        }

        for (edge_id, target) in targets {
            state.sequence += 1;
            let token = ActivationToken {
                source_node_id: node.id.clone(),
                source_edge_id: edge_id,
                output_state: result.output_state.clone(),
                routing_state: result.routing_state.clone(),
                sequence: state.sequence,
            };
            let required = state.topology.required_parents(&target);
            if let Some(tokens) = state.joins.offer(&target, &node.id, token, required) {
                debug!(run_id = %run.id, node_id = %target, parents = tokens.len(), "Activation queued");
                state.queue.push_back(Activation {
                    node_id: target,
                    tokens,
                });
            }
        }
        Ok(Step::Continue)
    }

    async fn fail_node(
        &self,
        mut node_run: NodeRun,
        message: String,
        metadata: Option<weft_core::types::RunMetadata>,
    ) -> Result<Step> {
        warn!(run_id = %node_run.run_id, node_id = %node_run.node_id, error = %message, "Activation failed");
        node_run.fail(message.clone(), metadata);
        self.save_node(&node_run).await?;
        Ok(Step::Failed(message))
    }

    async fn save_node(&self, node_run: &NodeRun) -> Result<()> {
        self.store.update_node_run(node_run).await?;
        self.events.publish(RunEvent::node(node_run));
        Ok(())
    }

    async fn finalize(&self, run: &Run, outcome: Outcome) -> Result<Run> {
        let current = self.store.get_run(&run.id).await?;
        let stop_requested = current.status == RunStatus::Stopping;
        let canceled = current.status == RunStatus::Canceled;

        // A run canceled or stopped mid-activation never spawns a successor.
        let (status, message) = match outcome {
            Outcome::Canceled => (RunStatus::Canceled, None),
            _ if canceled => (RunStatus::Canceled, None),
            Outcome::Failed(message) => (RunStatus::Failed, Some(message)),
            Outcome::Stopped => (RunStatus::Stopped, None),
            _ if stop_requested => (RunStatus::Stopped, None),
            Outcome::Completed => (RunStatus::Completed, None),
            Outcome::CycledToStart => match self.spawn_next_generation(run).await {
                Ok(next) => {
                    info!(run_id = %run.id, next_run_id = %next.id, generation = next.generation, "Next generation queued");
                    (RunStatus::Completed, None)
                }
                Err(e) => (
                    RunStatus::Failed,
                    Some(format!("failed to queue next generation: {}", e)),
                ),
            },
        };

        let finished = self.store.transition_run(&run.id, status, message).await?;
        info!(run_id = %finished.id, status = %finished.status, "Run finished");
        self.events.publish(RunEvent::run(&finished));
        Ok(finished)
    }

    async fn spawn_next_generation(&self, run: &Run) -> Result<Run> {
        let next = run.next_generation();
        self.store.create_run(&next).await?;
        self.queue.enqueue_run(&next.graph_id, &next.id).await?;
        Ok(next)
    }
}
