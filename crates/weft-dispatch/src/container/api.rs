use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::future::BoxFuture;
use futures::StreamExt;

use weft_core::error::{TransportError, TransportResult};
use weft_core::traits::UnitRuntime;
use weft_core::types::{TransportErrorKind, UnitLogs, UnitPhase, UnitSpec};

/// Container runtime over the Docker Engine API.
pub struct BollardRuntime {
    docker: std::result::Result<Docker, String>,
}

impl BollardRuntime {
    /// Connect with the local defaults (`DOCKER_HOST` or the unix socket).
    /// A failed connection is reported by `probe`, not here.
    pub fn connect() -> Self {
        Self {
            docker: Docker::connect_with_local_defaults().map_err(|e| e.to_string()),
        }
    }

    fn docker(&self, phase: UnitPhase) -> TransportResult<&Docker> {
        self.docker
            .as_ref()
            .map_err(|e| TransportError::classify(phase, format!("Docker connect failed: {}", e)))
    }
}

fn api_error(phase: UnitPhase, e: bollard::errors::Error) -> TransportError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => TransportError::new(TransportErrorKind::AuthError, phase, message.clone()),
        _ => TransportError::classify(phase, e.to_string()),
    }
}

/// 304 (already stopped) and 404 (already gone) are success for teardown calls.
fn ignore_gone(phase: UnitPhase, result: Result<(), bollard::errors::Error>) -> TransportResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304 | 404,
            ..
        }) => Ok(()),
        Err(e) => Err(api_error(phase, e)),
    }
}

impl UnitRuntime for BollardRuntime {
    fn name(&self) -> &str {
        "docker-api"
    }

    fn probe(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Probe)?;
            docker
                .ping()
                .await
                .map(|_| ())
                .map_err(|e| api_error(UnitPhase::Probe, e))
        })
    }

    fn pull(&self, image: &str) -> BoxFuture<'_, TransportResult<()>> {
        let image = image.to_string();
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Pull)?;
            let options = CreateImageOptions {
                from_image: image.as_str(),
                ..Default::default()
            };
            let mut stream = docker.create_image(Some(options), None, None);
            while let Some(item) = stream.next().await {
                item.map_err(|e| api_error(UnitPhase::Pull, e))?;
            }
            Ok(())
        })
    }

    fn create(&self, spec: &UnitSpec) -> BoxFuture<'_, TransportResult<String>> {
        let spec = spec.clone();
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Create)?;
            let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            let labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();

            let config = Config {
                image: Some(spec.image.clone()),
                cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
                env: Some(env),
                labels: Some(labels),
                host_config: Some(bollard::models::HostConfig {
                    memory: spec.memory_mb.map(|mb| (mb as i64) * 1024 * 1024),
                    network_mode: spec.network_mode.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let options = CreateContainerOptions {
                name: spec.name.as_str(),
                platform: None,
            };

            let container = docker
                .create_container(Some(options), config)
                .await
                .map_err(|e| api_error(UnitPhase::Create, e))?;
            Ok(container.id)
        })
    }

    fn start(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Start)?;
            docker
                .start_container(&unit_id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| api_error(UnitPhase::Start, e))
        })
    }

    fn wait(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<i64>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Wait)?;
            let mut stream = docker.wait_container(&unit_id, None::<WaitContainerOptions<String>>);
            match stream.next().await {
                Some(Ok(exit)) => Ok(exit.status_code),
                // Non-zero exits surface as an error carrying the code.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(api_error(UnitPhase::Wait, e)),
                None => Err(TransportError::new(
                    TransportErrorKind::Other,
                    UnitPhase::Wait,
                    "wait stream ended without an exit status",
                )),
            }
        })
    }

    fn logs(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<UnitLogs>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Logs)?;
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&unit_id, Some(options));
            let mut logs = UnitLogs::default();
            while let Some(item) = stream.next().await {
                match item.map_err(|e| api_error(UnitPhase::Logs, e))? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        logs.stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => {
                        logs.stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
            Ok(logs)
        })
    }

    fn stop(&self, unit_id: &str, grace: Duration) -> BoxFuture<'_, TransportResult<()>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Remove)?;
            let options = StopContainerOptions {
                t: grace.as_secs() as i64,
            };
            ignore_gone(
                UnitPhase::Remove,
                docker.stop_container(&unit_id, Some(options)).await,
            )
        })
    }

    fn kill(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Remove)?;
            ignore_gone(
                UnitPhase::Remove,
                docker
                    .kill_container(&unit_id, None::<KillContainerOptions<String>>)
                    .await,
            )
        })
    }

    fn remove(&self, unit_id: &str) -> BoxFuture<'_, TransportResult<()>> {
        let unit_id = unit_id.to_string();
        Box::pin(async move {
            let docker = self.docker(UnitPhase::Remove)?;
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            ignore_gone(
                UnitPhase::Remove,
                docker.remove_container(&unit_id, Some(options)).await,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_status_maps_to_auth_error() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 403,
            message: "denied".into(),
        };
        assert_eq!(api_error(UnitPhase::Create, err).kind, TransportErrorKind::AuthError);
    }

    #[test]
    fn test_gone_container_is_ignored_on_teardown() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(ignore_gone(UnitPhase::Remove, Err(err)).is_ok());
    }
}
