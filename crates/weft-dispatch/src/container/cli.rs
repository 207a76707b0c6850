use std::process::Output;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::debug;

use weft_core::error::{TransportError, TransportResult};
use weft_core::traits::UnitRuntime;
use weft_core::types::{TransportErrorKind, UnitLogs, UnitPhase, UnitSpec};

/// Container runtime driven through the container CLI (`docker` by default).
///
/// Every invocation is killed when its future is dropped, so a timed-out
/// phase never leaves a stray CLI process behind.
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, phase: UnitPhase, args: &[String]) -> TransportResult<Output> {
        debug!(binary = %self.binary, ?args, "Running container CLI");
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    TransportErrorKind::SocketMissing
                } else {
                    TransportErrorKind::from_message(&e.to_string())
                };
                TransportError::new(kind, phase, format!("{}: {}", self.binary, e))
            })
    }

    /// Run the CLI and return trimmed stdout, failing on a non-zero exit.
    async fn run(&self, phase: UnitPhase, args: &[String]) -> TransportResult<String> {
        let output = self.output(phase, args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{} exited with {}", self.binary, output.status)
        } else {
            stderr
        };
        Err(TransportError::classify(phase, message))
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// `create` arguments for a unit descriptor.
fn create_args(spec: &UnitSpec) -> Vec<String> {
    let mut out = args(["create", "--name", spec.name.as_str()]);
    for (k, v) in &spec.labels {
        out.push("--label".into());
        out.push(format!("{}={}", k, v));
    }
    for (k, v) in &spec.env {
        out.push("-e".into());
        out.push(format!("{}={}", k, v));
    }
    if let Some(mb) = spec.memory_mb {
        out.push("--memory".into());
        out.push(format!("{}m", mb));
    }
    if let Some(network) = &spec.network_mode {
        out.push("--network".into());
        out.push(network.clone());
    }
    out.push(spec.image.clone());
    out.extend(spec.command.iter().cloned());
    out
}

/// Teardown calls treat an already-gone container as done.
fn gone(e: &TransportError) -> bool {
    let msg = e.message.to_lowercase();
    msg.contains("no such container") || msg.contains("is not running")
}

impl UnitRuntime for CliRuntime {
    fn name(&self) -> &str {
        "docker-cli"
    }

    /// Precondition probe: the binary exists and reaches a daemon.
    fn probe(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.run(UnitPhase::Probe, &args(["version", "--format", "{{.Server.Version}}"]))
                .await
                .map(|_| ())
        })
    }

    fn pull(&self, image: &str) -> BoxFuture<'_, TransportResult<()>> {
        let argv = args(["pull", image]);
        Box::pin(async move { self.run(UnitPhase::Pull, &argv).await.map(|_| ()) })
    }

    fn create(&self, spec: &UnitSpec) -> BoxFuture<'_, TransportResult<String>> {
        let argv = create_args(spec);
        Box::pin(async move {
            let id = self.run(UnitPhase::Create, &argv).await?;
            if id.is_empty() {
                return Err(TransportError::new(
                    TransportErrorKind::Other,
                    UnitPhase::Create,
                    "create printed no container id",
                ));
            }
            Ok(id)
        })
    }

    fn start(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let argv = args(["start", unit_id]);
        Box::pin(async move { self.run(UnitPhase::Start, &argv).await.map(|_| ()) })
    }

    fn wait(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<i64>> {
        let argv = args(["wait", unit_id]);
        Box::pin(async move {
            let out = self.run(UnitPhase::Wait, &argv).await?;
            let code = out.lines().last().unwrap_or_default().trim();
            code.parse::<i64>().map_err(|_| {
                TransportError::new(
                    TransportErrorKind::Other,
                    UnitPhase::Wait,
                    format!("unexpected wait output: {:?}", out),
                )
            })
        })
    }

    fn logs(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<UnitLogs>> {
        let argv = args(["logs", unit_id]);
        Box::pin(async move {
            let output = self.output(UnitPhase::Logs, &argv).await?;
            if !output.status.success() {
                return Err(TransportError::classify(
                    UnitPhase::Logs,
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
            Ok(UnitLogs {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn stop(&self, unit_id: &str, grace: Duration) -> BoxFuture<'_, TransportResult<()>> {
        let secs = grace.as_secs().to_string();
        let argv = args(["stop", "-t", secs.as_str(), unit_id]);
        Box::pin(async move {
            match self.run(UnitPhase::Remove, &argv).await {
                Err(e) if !gone(&e) => Err(e),
                _ => Ok(()),
            }
        })
    }

    fn kill(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let argv = args(["kill", unit_id]);
        Box::pin(async move {
            match self.run(UnitPhase::Remove, &argv).await {
                Err(e) if !gone(&e) => Err(e),
                _ => Ok(()),
            }
        })
    }

    fn remove(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let argv = args(["rm", "-f", unit_id]);
        Box::pin(async move {
            match self.run(UnitPhase::Remove, &argv).await {
                Err(e) if !gone(&e) => Err(e),
                _ => Ok(()),
            }
        })
    }
}
