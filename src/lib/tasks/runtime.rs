use async_trait::async_trait;

use super::types::{Config, DockerResult, RuntimeResult};

/// The two things the worker asks of a container engine.
///
/// Both calls block the caller until the engine answers; no deadline is applied.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls, creates and starts a container, returning its id on success.
    async fn start(&self, config: &Config) -> RuntimeResult<DockerResult>;

    /// Stops and removes a container. Succeeds only if both steps do.
    async fn stop(&self, container_id: &str) -> RuntimeResult<DockerResult>;
}
