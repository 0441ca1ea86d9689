use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[default]
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Pending => "Pending",
            State::Scheduled => "Scheduled",
            State::Running => "Running",
            State::Completed => "Completed",
            State::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// A unit of work: one container image plus the resources it asks for.
///
/// `container_id` is only set once the container has started, and
/// `finish_time` only once the task reaches `Completed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: Uuid,
    #[serde(default)]
    pub container_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub state: State,
    pub image: String,
    /// CPU request in cores.
    #[serde(default)]
    pub cpu: f64,
    /// Memory request in bytes.
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub disk: i64,
    /// `KEY=VALUE` pairs handed to the container.
    #[serde(default)]
    pub env: Vec<String>,
    /// Ports in `port/proto` form, e.g. `80/tcp`.
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    #[serde(default)]
    pub port_bindings: HashMap<String, String>,
    #[serde(default)]
    pub restart_policy: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
}

/// Submission envelope. Only lives long enough to be unwrapped into its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEvent {
    pub id: Uuid,
    #[serde(default)]
    pub state: State,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub task: Task,
}

/// What the runtime needs to know to launch a task's container.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub name: String,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub exposed_ports: Vec<String>,
    pub cmd: Vec<String>,
    pub image: String,
    pub cpu: f64,
    pub memory: i64,
    pub disk: i64,
    pub env: Vec<String>,
    pub restart_policy: String,
}

pub fn new_config(task: &Task) -> Config {
    Config {
        name: task.name.clone(),
        attach_stdout: true,
        attach_stderr: true,
        exposed_ports: task.exposed_ports.clone(),
        image: task.image.clone(),
        cpu: task.cpu,
        memory: task.memory,
        disk: task.disk,
        env: task.env.clone(),
        restart_policy: task.restart_policy.clone(),
        ..Default::default()
    }
}

/// Outcome of a successful runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerResult {
    pub action: String,
    pub container_id: String,
    pub result: String,
}

impl DockerResult {
    pub fn success(container_id: impl Into<String>, action: impl Into<String>) -> Self {
        DockerResult {
            action: action.into(),
            container_id: container_id.into(),
            result: "success".to_string(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to connect to container engine: {0}")]
    Connect(String),

    #[error("failed to pull image {image}: {reason}")]
    Pull { image: String, reason: String },

    #[error("failed to create container from {image}: {reason}")]
    Create { image: String, reason: String },

    #[error("failed to start container {container_id}: {reason}")]
    Start { container_id: String, reason: String },

    #[error("failed to stop container {container_id}: {reason}")]
    Stop { container_id: String, reason: String },

    #[error("failed to remove container {container_id}: {reason}")]
    Remove { container_id: String, reason: String },
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
