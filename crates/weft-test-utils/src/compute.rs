use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeCompute;
use weft_core::types::{ComputeOutput, ComputeRequest, RoutingState};

type Hook = Arc<dyn Fn(ComputeRequest) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Step {
    Output(ComputeOutput),
    Fail(String),
}

/// A `NodeCompute` with per-node scripted outputs.
///
/// Steps for a node are consumed in order and the last one repeats. Nodes
/// without a script echo their identity back as output.
#[derive(Default)]
pub struct ScriptedCompute {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    hooks: Mutex<HashMap<String, Hook>>,
    calls: Mutex<Vec<ComputeRequest>>,
    delay: Option<Duration>,
}

impl ScriptedCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, node_id: &str, step: Step) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(node_id.to_string())
            .or_default()
            .push_back(step);
        self
    }

    pub fn with_output(self, node_id: &str, output: ComputeOutput) -> Self {
        self.push(node_id, Step::Output(output))
    }

    /// Script a route key for `node_id`.
    pub fn with_route(self, node_id: &str, key: &str) -> Self {
        let output = ComputeOutput::new(json!({ "route": key })).with_routing(RoutingState::route(key));
        self.with_output(node_id, output)
    }

    pub fn with_terminate(self, node_id: &str) -> Self {
        let output = ComputeOutput::new(json!({ "terminated": true })).with_routing(RoutingState::terminate());
        self.with_output(node_id, output)
    }

    pub fn with_failure(self, node_id: &str, message: &str) -> Self {
        self.push(node_id, Step::Fail(message.to_string()))
    }

    /// Run `hook` every time `node_id` is computed, before producing output.
    pub fn with_hook<F, Fut>(self, node_id: &str, hook: F) -> Self
    where
        F: Fn(ComputeRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Arc::new(move |req| Box::pin(hook(req)));
        self.hooks.lock().unwrap().insert(node_id.to_string(), hook);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ComputeRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Node ids in call order.
    pub fn call_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.node.id.clone())
            .collect()
    }

    pub fn calls_for(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.node.id == node_id)
            .count()
    }

    fn next_step(&self, node_id: &str) -> Option<Step> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(node_id)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl NodeCompute for ScriptedCompute {
    fn compute(&self, request: ComputeRequest) -> BoxFuture<'_, Result<ComputeOutput>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(request.clone());
            let hook = self.hooks.lock().unwrap().get(&request.node.id).cloned();
            if let Some(hook) = hook {
                hook(request.clone()).await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            match self.next_step(&request.node.id) {
                Some(Step::Output(output)) => Ok(output),
                Some(Step::Fail(message)) => Err(WeftError::Compute {
                    node_type: request.node.kind.as_str().to_string(),
                    message,
                }),
                None => Ok(ComputeOutput::new(json!({
                    "node_id": request.node.id,
                    "nodeType": request.node.kind.as_str(),
                    "execution_index": request.execution_index,
                    "remote": request.remote,
                }))),
            }
        })
    }
}
