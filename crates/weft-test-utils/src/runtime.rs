use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::{TransportError, TransportResult};
use weft_core::marker;
use weft_core::traits::UnitRuntime;
use weft_core::types::{UnitLogs, UnitPhase, UnitSpec};

#[derive(Debug, Clone)]
enum Behavior {
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
enum Output {
    /// Fixed stdout/stderr.
    Fixed(UnitLogs),
    /// Print the startup marker for the created unit's dispatch id, then
    /// the given payload.
    Marker(Value),
}

/// A scripted `UnitRuntime`.
///
/// Every phase succeeds unless told to fail or hang. Every call is recorded
/// as `"<op> <unit id>"` (or just `"<op>"` for probe/pull/create).
///
/// Runtimes attached to the same daemon share one set of unit names: a
/// create that hangs has still claimed its name, and a second create with
/// that name fails with a conflict until the unit is removed.
pub struct FakeUnitRuntime {
    name: String,
    behaviors: Mutex<HashMap<UnitPhase, Behavior>>,
    exit_code: Mutex<i64>,
    output: Mutex<Output>,
    calls: Mutex<Vec<String>>,
    specs: Mutex<Vec<UnitSpec>>,
    daemon: Option<Arc<Mutex<HashSet<String>>>>,
}

impl FakeUnitRuntime {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            behaviors: Mutex::new(HashMap::new()),
            exit_code: Mutex::new(0),
            output: Mutex::new(Output::Fixed(UnitLogs::default())),
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            daemon: None,
        }
    }

    /// A runtime whose units start cleanly and report `payload`.
    pub fn confirming(name: &str, payload: Value) -> Self {
        Self::new(name).with_marker(payload)
    }

    pub fn fail(self, phase: UnitPhase, message: &str) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(phase, Behavior::Fail(message.to_string()));
        self
    }

    pub fn hang(self, phase: UnitPhase) -> Self {
        self.behaviors.lock().unwrap().insert(phase, Behavior::Hang);
        self
    }

    pub fn on_daemon(mut self, daemon: Arc<Mutex<HashSet<String>>>) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn with_exit_code(self, code: i64) -> Self {
        *self.exit_code.lock().unwrap() = code;
        self
    }

    pub fn with_stdout(self, stdout: &str) -> Self {
        *self.output.lock().unwrap() = Output::Fixed(UnitLogs {
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
        self
    }

    pub fn with_marker(self, payload: Value) -> Self {
        *self.output.lock().unwrap() = Output::Marker(payload);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether any call starting with `op` was made.
    pub fn called(&self, op: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.split_whitespace().next() == Some(op))
    }

    pub fn created_specs(&self) -> Vec<UnitSpec> {
        self.specs.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn claim(&self, name: &str) -> TransportResult<()> {
        let Some(daemon) = &self.daemon else {
            return Ok(());
        };
        if daemon.lock().unwrap().insert(name.to_string()) {
            Ok(())
        } else {
            Err(TransportError::classify(
                UnitPhase::Create,
                format!("Conflict. The container name \"/{}\" is already in use", name),
            ))
        }
    }

    fn release(&self, unit_id: &str) {
        if let Some(daemon) = &self.daemon {
            let name = unit_id.strip_prefix("unit-").unwrap_or(unit_id);
            daemon.lock().unwrap().remove(name);
        }
    }

    async fn behave(&self, phase: UnitPhase) -> TransportResult<()> {
        let behavior = self.behaviors.lock().unwrap().get(&phase).cloned();
        match behavior {
            None => Ok(()),
            Some(Behavior::Fail(message)) => Err(TransportError::classify(phase, message)),
            Some(Behavior::Hang) => futures::future::pending().await,
        }
    }
}

impl UnitRuntime for FakeUnitRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.record("probe".into());
            self.behave(UnitPhase::Probe).await
        })
    }

    fn pull(&self, image: &str) -> BoxFuture<'_, TransportResult<()>> {
        let image = image.to_string();
        Box::pin(async move {
            self.record(format!("pull {}", image));
            self.behave(UnitPhase::Pull).await
        })
    }

    fn create(&self, spec: &UnitSpec) -> BoxFuture<'_, TransportResult<String>> {
        let spec = spec.clone();
        Box::pin(async move {
            self.record(format!("create {}", spec.name));
            let behavior = self.behaviors.lock().unwrap().get(&UnitPhase::Create).cloned();
            if let Some(Behavior::Fail(message)) = behavior {
                return Err(TransportError::classify(UnitPhase::Create, message));
            }
            self.claim(&spec.name)?;
            if let Some(Behavior::Hang) = behavior {
                futures::future::pending::<()>().await;
            }
            let id = format!("unit-{}", spec.name);
            self.specs.lock().unwrap().push(spec);
            Ok(id)
        })
    }

    fn start(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            self.record(format!("start {}", unit_id));
            self.behave(UnitPhase::Start).await
        })
    }

    fn wait(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<i64>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            self.record(format!("wait {}", unit_id));
            self.behave(UnitPhase::Wait).await?;
            Ok(*self.exit_code.lock().unwrap())
        })
    }

    fn logs(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<UnitLogs>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            self.record(format!("logs {}", unit_id));
            self.behave(UnitPhase::Logs).await?;
            let output = self.output.lock().unwrap().clone();
            Ok(match output {
                Output::Fixed(logs) => logs,
                Output::Marker(payload) => {
                    let dispatch_id = self
                        .specs
                        .lock()
                        .unwrap()
                        .last()
                        .and_then(|s| s.env.get(marker::env::DISPATCH_ID).cloned())
                        .unwrap_or_default();
                    UnitLogs {
                        stdout: format!(
                            "{}\n{}\n",
                            marker::started_line(&dispatch_id),
                            marker::result_line(&payload)
                        ),
                        stderr: String::new(),
                    }
                }
            })
        })
    }

    fn stop(&self, unit_id: &str, grace: Duration) -> BoxFuture<'_, TransportResult<()>> {
        let call = format!("stop {} {}", unit_id, grace.as_secs());
        Box::pin(async move {
            self.record(call);
            Ok(())
        })
    }

    fn kill(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let call = format!("kill {}", unit_id);
        Box::pin(async move {
            self.record(call);
            Ok(())
        })
    }

    fn remove(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            self.record(format!("remove {}", unit_id));
            self.behave(UnitPhase::Remove).await?;
            self.release(&unit_id);
            Ok(())
        })
    }
}
