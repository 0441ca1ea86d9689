use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use super::store::TaskStore;
use crate::tasks::{
    runtime::ContainerRuntime,
    types::{RuntimeError, State},
};

/// A single node's execution engine: the task store, the runtime it drives
/// and the most recent stats snapshot.
pub struct Worker {
    pub name: String,
    pub store: TaskStore,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) stats: watch::Sender<Arc<Stats>>,
}

/// Memory figures in kB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_available: u64,
}

/// Usage of the root filesystem in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub all: u64,
    pub free: u64,
    pub used: u64,
}

/// Aggregate CPU time counters, in clock ticks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAvg {
    pub last1min: f64,
    pub last5min: f64,
    pub last15min: f64,
}

/// One complete host sample. Replaced wholesale, never mutated once published.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Stats {
    pub mem_stats: MemInfo,
    pub disk_stats: DiskInfo,
    pub cpu_stats: CpuStat,
    pub load_stats: LoadAvg,
    pub task_count: usize,
}

pub struct TaskServer {
    pub worker: Arc<Worker>,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid state transition for task {id} from {from} to {to}")]
    InvalidStateTransition { id: Uuid, from: State, to: State },

    #[error("task {id} reached the queue in unexpected state {state}")]
    UnexpectedState { id: Uuid, state: State },

    #[error("task {id} has no container to stop")]
    MissingContainer { id: Uuid },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("{0} accounting is unavailable on this host")]
    Unavailable(&'static str),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {0}")]
    Parse(String),
}
