use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions,
    },
    errors::Error as EngineError,
    image::CreateImageOptions,
    models::{HostConfig, RestartPolicy, RestartPolicyNameEnum},
};
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

use super::runtime::ContainerRuntime;
use super::types::{Config, DockerResult, RuntimeError, RuntimeResult};

/// The engine calls the start and stop sequences are built from.
#[async_trait]
trait Engine: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;
    async fn create_container(
        &self,
        name: Option<&str>,
        config: bollard::container::Config<String>,
    ) -> Result<String, EngineError>;
    async fn start_container(&self, container_id: &str) -> Result<(), EngineError>;
    async fn drain_logs(&self, container_id: &str);
    async fn stop_container(&self, container_id: &str) -> Result<(), EngineError>;
    async fn remove_container(
        &self,
        container_id: &str,
        options: RemoveContainerOptions,
    ) -> Result<(), EngineError>;
}

#[async_trait]
impl Engine for Docker {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let mut stream = std::pin::pin!(self.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        ));

        while let Some(msg) = stream.next().await {
            if let Some(status) = msg?.status {
                debug!(image, "{}", status);
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        name: Option<&str>,
        config: bollard::container::Config<String>,
    ) -> Result<String, EngineError> {
        let options = name.map(|name| CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        });

        let response = Docker::create_container(self, options, config).await?;
        for warning in &response.warnings {
            warn!(container_id = %response.id, "{}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError> {
        Docker::start_container(self, container_id, None::<StartContainerOptions<String>>).await
    }

    /// Drains whatever the container has written so far to stdout and stderr.
    async fn drain_logs(&self, container_id: &str) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut logs = std::pin::pin!(self.logs(container_id, Some(options)));
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    debug!(container_id, stream = "stdout", "{}", String::from_utf8_lossy(&message).trim_end());
                }
                Ok(LogOutput::StdErr { message }) => {
                    debug!(container_id, stream = "stderr", "{}", String::from_utf8_lossy(&message).trim_end());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id, error = %e, "error reading container logs");
                    break;
                }
            }
        }
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), EngineError> {
        Docker::stop_container(self, container_id, None).await
    }

    async fn remove_container(
        &self,
        container_id: &str,
        options: RemoveContainerOptions,
    ) -> Result<(), EngineError> {
        Docker::remove_container(self, container_id, Some(options)).await
    }
}

/// Container runtime backed by a local Docker engine.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(client: Docker) -> Self {
        DockerRuntime { client }
    }

    /// Connects using the platform defaults (unix socket, or `DOCKER_HOST`).
    pub fn connect() -> RuntimeResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;
        Ok(DockerRuntime { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, config: &Config) -> RuntimeResult<DockerResult> {
        start_on(&self.client, config).await
    }

    async fn stop(&self, container_id: &str) -> RuntimeResult<DockerResult> {
        stop_on(&self.client, container_id).await
    }
}

/// Pull, create, start. A container that was created but failed to start is
/// removed before the error is returned.
async fn start_on(engine: &dyn Engine, config: &Config) -> RuntimeResult<DockerResult> {
    info!(image = %config.image, "pulling image");
    engine
        .pull_image(&config.image)
        .await
        .map_err(|e| RuntimeError::Pull {
            image: config.image.clone(),
            reason: e.to_string(),
        })?;

    let name = (!config.name.is_empty()).then_some(config.name.as_str());
    let container_id = engine
        .create_container(name, container_config(config))
        .await
        .map_err(|e| RuntimeError::Create {
            image: config.image.clone(),
            reason: e.to_string(),
        })?;
    info!(container_id = %container_id, image = %config.image, "container created");

    if let Err(e) = engine.start_container(&container_id).await {
        let mut reason = e.to_string();
        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };
        match engine.remove_container(&container_id, options).await {
            Ok(()) => info!(container_id = %container_id, "removed container that failed to start"),
            Err(cleanup) => {
                warn!(container_id = %container_id, error = %cleanup, "could not remove container that failed to start");
                reason = format!("{reason}; removing the container also failed: {cleanup}");
            }
        }
        return Err(RuntimeError::Start {
            container_id,
            reason,
        });
    }
    info!(container_id = %container_id, "container started");

    engine.drain_logs(&container_id).await;

    Ok(DockerResult::success(container_id, "start"))
}

/// Graceful stop, then removal with volumes. Fails if either step does.
async fn stop_on(engine: &dyn Engine, container_id: &str) -> RuntimeResult<DockerResult> {
    info!(container_id, "stopping container");
    engine
        .stop_container(container_id)
        .await
        .map_err(|e| RuntimeError::Stop {
            container_id: container_id.to_string(),
            reason: e.to_string(),
        })?;

    let options = RemoveContainerOptions {
        v: true,
        link: false,
        force: false,
    };
    engine
        .remove_container(container_id, options)
        .await
        .map_err(|e| RuntimeError::Remove {
            container_id: container_id.to_string(),
            reason: e.to_string(),
        })?;

    info!(container_id, "container stopped and removed");
    Ok(DockerResult::success(container_id, "stop"))
}

/// Unknown restart policy names fall back to the engine default.
fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    policy.parse().unwrap_or(RestartPolicyNameEnum::EMPTY)
}

fn nano_cpus(cpu: f64) -> i64 {
    (cpu * 1_000_000_000.0) as i64
}

fn host_config(config: &Config) -> HostConfig {
    HostConfig {
        restart_policy: Some(RestartPolicy {
            name: Some(restart_policy_name(&config.restart_policy)),
            maximum_retry_count: None,
        }),
        nano_cpus: Some(nano_cpus(config.cpu)),
        memory: Some(config.memory),
        publish_all_ports: Some(true),
        ..Default::default()
    }
}

fn container_config(config: &Config) -> bollard::container::Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = config
        .exposed_ports
        .iter()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();

    bollard::container::Config {
        image: Some(config.image.clone()),
        env: Some(config.env.clone()),
        cmd: if config.cmd.is_empty() {
            None
        } else {
            Some(config.cmd.clone())
        },
        attach_stdin: Some(config.attach_stdin),
        attach_stdout: Some(config.attach_stdout),
        attach_stderr: Some(config.attach_stderr),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config(config)),
        ..Default::default()
    }
}
