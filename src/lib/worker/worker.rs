use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    stats::HostMetrics,
    store::TaskStore,
    types::{Stats, Worker, WorkerError, WorkerResult},
};
use crate::tasks::{
    runtime::ContainerRuntime,
    state::valid_state_transition,
    types::{State, Task, new_config},
};

impl Worker {
    pub fn new(name: &str, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let (stats, _) = watch::channel(Arc::new(Stats::default()));
        Worker {
            name: name.to_string(),
            store: TaskStore::new(),
            runtime,
            stats,
        }
    }

    /// Queues a task snapshot. Validation happens when it is processed.
    pub async fn add_task(&self, task: Task) {
        self.store.enqueue(task).await;
    }

    pub async fn get_tasks(&self) -> Vec<Task> {
        self.store.all().await
    }

    pub async fn get_task(&self, id: &Uuid) -> Option<Task> {
        self.store.get(id).await
    }

    /// Takes the next task off the queue and drives it towards its requested
    /// state. Returns the stored record afterwards, or `None` when the queue
    /// was empty.
    pub async fn process_next(&self) -> WorkerResult<Option<Task>> {
        let Some(queued) = self.store.dequeue().await else {
            debug!("no tasks in the queue");
            return Ok(None);
        };

        // A task seen for the first time is its own prior state.
        let persisted = self.store.get(&queued.id).await;
        if let Some(prior) = &persisted {
            if !valid_state_transition(&prior.state, &queued.state) {
                return Err(WorkerError::InvalidStateTransition {
                    id: queued.id,
                    from: prior.state,
                    to: queued.state,
                });
            }
        }

        match queued.state {
            State::Scheduled => self.start_task(queued).await.map(Some),
            State::Completed => self.stop_task(persisted, queued).await.map(Some),
            state => {
                // Only a fresh Pending task is recorded as-is; any other state
                // must be reached through the worker itself.
                if persisted.is_none() && state == State::Pending {
                    self.store.put(queued.clone()).await;
                }
                Err(WorkerError::UnexpectedState {
                    id: queued.id,
                    state,
                })
            }
        }
    }

    async fn start_task(&self, mut task: Task) -> WorkerResult<Task> {
        task.start_time = Some(Utc::now());
        let config = new_config(&task);

        match self.runtime.start(&config).await {
            Ok(result) => {
                task.container_id = Some(result.container_id);
                task.state = State::Running;
                self.store.put(task.clone()).await;
                info!(task_id = %task.id, container_id = ?task.container_id, "task running");
                Ok(task)
            }
            Err(e) => {
                task.container_id = None;
                task.state = State::Failed;
                self.store.put(task).await;
                Err(e.into())
            }
        }
    }

    /// Stops the container recorded for the task. The stored record is the
    /// source of the container id; it is only rewritten once the runtime
    /// confirms the stop.
    async fn stop_task(&self, persisted: Option<Task>, queued: Task) -> WorkerResult<Task> {
        let Some(mut task) = persisted else {
            return Err(WorkerError::MissingContainer { id: queued.id });
        };
        let Some(container_id) = task.container_id.clone() else {
            return Err(WorkerError::MissingContainer { id: task.id });
        };

        self.runtime.stop(&container_id).await?;

        task.state = State::Completed;
        task.finish_time = Some(Utc::now());
        self.store.put(task.clone()).await;
        info!(task_id = %task.id, container_id = %container_id, "stopped and removed container");
        Ok(task)
    }

    /// The most recently published stats snapshot.
    pub fn stats(&self) -> Arc<Stats> {
        self.stats.borrow().clone()
    }

    /// Samples the host once and publishes the result as the current snapshot.
    pub async fn refresh_stats(&self, metrics: &dyn HostMetrics) -> Arc<Stats> {
        let task_count = self.store.running_count().await;
        let snapshot = Arc::new(Stats::sample(metrics, task_count));
        self.stats.send_replace(snapshot.clone());
        snapshot
    }
}

/// Drains the queue, then waits `period` before looking again. Never returns.
pub async fn run_tasks(worker: Arc<Worker>, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        loop {
            match worker.process_next().await {
                Ok(Some(task)) => debug!(task_id = %task.id, state = %task.state, "task processed"),
                Ok(None) => break,
                Err(e @ WorkerError::Runtime(_)) => error!(error = %e, "error running task"),
                Err(e) => warn!(error = %e, "dropping task event"),
            }
        }
    }
}

/// Refreshes the worker's stats snapshot every `period`. Never returns.
pub async fn collect_stats(worker: Arc<Worker>, metrics: Arc<dyn HostMetrics>, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!("collecting stats");
        worker.refresh_stats(metrics.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::tasks::types::{Config, DockerResult, RuntimeError, RuntimeResult};
    use crate::worker::types::{CpuStat, DiskInfo, LoadAvg, MemInfo, StatsError};

    #[derive(Default)]
    struct FakeRuntime {
        fail_start: bool,
        fail_stop: bool,
        started: Mutex<Vec<String>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn start(&self, config: &Config) -> RuntimeResult<DockerResult> {
            if self.fail_start {
                return Err(RuntimeError::Pull {
                    image: config.image.clone(),
                    reason: "manifest unknown".to_string(),
                });
            }
            let mut started = self.started.lock().unwrap();
            let id = format!("container-{}", started.len());
            started.push(config.image.clone());
            Ok(DockerResult::success(id, "start"))
        }

        async fn stop(&self, container_id: &str) -> RuntimeResult<DockerResult> {
            if self.fail_stop {
                return Err(RuntimeError::Stop {
                    container_id: container_id.to_string(),
                    reason: "engine unreachable".to_string(),
                });
            }
            self.stopped.lock().unwrap().push(container_id.to_string());
            Ok(DockerResult::success(container_id, "stop"))
        }
    }

    struct FixedHost;

    impl HostMetrics for FixedHost {
        fn memory(&self) -> Result<MemInfo, StatsError> {
            Ok(MemInfo {
                mem_total: 4096,
                mem_available: 1024,
            })
        }
        fn disk(&self) -> Result<DiskInfo, StatsError> {
            Ok(DiskInfo {
                all: 100,
                free: 40,
                used: 60,
            })
        }
        fn cpu(&self) -> Result<CpuStat, StatsError> {
            Ok(CpuStat {
                user: 7,
                idle: 3,
                ..Default::default()
            })
        }
        fn load_avg(&self) -> Result<LoadAvg, StatsError> {
            Ok(LoadAvg {
                last1min: 0.5,
                last5min: 0.25,
                last15min: 0.125,
            })
        }
    }

    fn worker_with(runtime: FakeRuntime) -> (Worker, Arc<FakeRuntime>) {
        let runtime = Arc::new(runtime);
        (Worker::new("test-worker", runtime.clone()), runtime)
    }

    fn task(state: State) -> Task {
        Task {
            id: Uuid::new_v4(),
            name: "web".to_string(),
            image: "nginx:latest".to_string(),
            state,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let (worker, _) = worker_with(FakeRuntime::default());
        assert!(worker.process_next().await.unwrap().is_none());
        assert!(worker.get_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn first_sighting_of_pending_task_is_recorded() {
        let (worker, runtime) = worker_with(FakeRuntime::default());
        let t = task(State::Pending);
        worker.add_task(t.clone()).await;

        let result = worker.process_next().await;
        assert!(matches!(result, Err(WorkerError::UnexpectedState { .. })));

        let stored = worker.get_task(&t.id).await.unwrap();
        assert_eq!(stored.state, State::Pending);
        assert!(stored.container_id.is_none());
        assert!(runtime.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_task_is_started() {
        let (worker, runtime) = worker_with(FakeRuntime::default());
        let t = task(State::Scheduled);
        worker.add_task(t.clone()).await;

        let running = worker.process_next().await.unwrap().unwrap();
        assert_eq!(running.state, State::Running);
        assert_eq!(running.container_id.as_deref(), Some("container-0"));
        assert!(running.start_time.is_some());
        assert!(running.finish_time.is_none());
        assert_eq!(worker.get_task(&t.id).await.unwrap(), running);
        assert_eq!(*runtime.started.lock().unwrap(), vec!["nginx:latest".to_string()]);
    }

    #[tokio::test]
    async fn pending_then_scheduled_is_valid() {
        let (worker, _) = worker_with(FakeRuntime::default());
        let mut t = task(State::Pending);
        worker.add_task(t.clone()).await;
        t.state = State::Scheduled;
        worker.add_task(t.clone()).await;

        let _ = worker.process_next().await;
        let running = worker.process_next().await.unwrap().unwrap();
        assert_eq!(running.state, State::Running);
    }

    #[tokio::test]
    async fn start_failure_marks_task_failed() {
        let (worker, _) = worker_with(FakeRuntime {
            fail_start: true,
            ..Default::default()
        });
        let t = task(State::Scheduled);
        worker.add_task(t.clone()).await;

        let result = worker.process_next().await;
        assert!(matches!(result, Err(WorkerError::Runtime(RuntimeError::Pull { .. }))));

        let stored = worker.get_task(&t.id).await.unwrap();
        assert_eq!(stored.state, State::Failed);
        assert!(stored.container_id.is_none());
        assert_eq!(worker.stats().task_count, 0);
    }

    #[tokio::test]
    async fn running_task_is_stopped() {
        let (worker, runtime) = worker_with(FakeRuntime::default());
        let t = task(State::Scheduled);
        worker.add_task(t.clone()).await;
        let mut running = worker.process_next().await.unwrap().unwrap();

        running.state = State::Completed;
        worker.add_task(running).await;
        let completed = worker.process_next().await.unwrap().unwrap();

        assert_eq!(completed.state, State::Completed);
        assert!(completed.finish_time.is_some());
        assert_eq!(*runtime.stopped.lock().unwrap(), vec!["container-0".to_string()]);
        assert_eq!(worker.get_task(&t.id).await.unwrap().state, State::Completed);
    }

    #[tokio::test]
    async fn stop_failure_leaves_task_running() {
        let (worker, _) = worker_with(FakeRuntime {
            fail_stop: true,
            ..Default::default()
        });
        worker.add_task(task(State::Scheduled)).await;
        let running = worker.process_next().await.unwrap().unwrap();

        let mut stop = running.clone();
        stop.state = State::Completed;
        worker.add_task(stop).await;

        let result = worker.process_next().await;
        assert!(matches!(result, Err(WorkerError::Runtime(RuntimeError::Stop { .. }))));
        assert_eq!(worker.get_task(&running.id).await.unwrap(), running);
    }

    #[tokio::test]
    async fn skipping_running_is_rejected() {
        let (worker, runtime) = worker_with(FakeRuntime {
            fail_start: true,
            ..Default::default()
        });
        let mut t = task(State::Scheduled);
        worker.store.put(t.clone()).await;

        t.state = State::Completed;
        t.container_id = Some("abc".to_string());
        worker.add_task(t.clone()).await;

        let result = worker.process_next().await;
        assert!(matches!(
            result,
            Err(WorkerError::InvalidStateTransition {
                from: State::Scheduled,
                to: State::Completed,
                ..
            })
        ));

        let stored = worker.get_task(&t.id).await.unwrap();
        assert_eq!(stored.state, State::Scheduled);
        assert!(stored.container_id.is_none());
        assert!(runtime.stopped.lock().unwrap().is_empty());
        assert_eq!(worker.store.queue_len().await, 0);
    }

    #[tokio::test]
    async fn terminal_tasks_cannot_be_restarted() {
        let (worker, runtime) = worker_with(FakeRuntime::default());
        let mut t = task(State::Failed);
        worker.store.put(t.clone()).await;

        t.state = State::Scheduled;
        worker.add_task(t.clone()).await;

        assert!(worker.process_next().await.is_err());
        assert_eq!(worker.get_task(&t.id).await.unwrap().state, State::Failed);
        assert!(runtime.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_without_container_is_reported() {
        let (worker, _) = worker_with(FakeRuntime::default());
        worker.add_task(task(State::Completed)).await;

        let result = worker.process_next().await;
        assert!(matches!(result, Err(WorkerError::MissingContainer { .. })));
        assert!(worker.get_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_completed_task_is_never_recorded_as_completed() {
        let (worker, runtime) = worker_with(FakeRuntime {
            fail_stop: true,
            ..Default::default()
        });
        let mut t = task(State::Completed);
        t.container_id = Some("unrelated-container".to_string());
        worker.add_task(t.clone()).await;

        assert!(worker.process_next().await.is_err());
        assert!(worker.get_task(&t.id).await.is_none());
        assert!(runtime.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_uses_the_stored_container_id() {
        let (worker, runtime) = worker_with(FakeRuntime::default());
        let t = task(State::Scheduled);
        worker.add_task(t.clone()).await;
        worker.process_next().await.unwrap();

        let mut stop = t.clone();
        stop.state = State::Completed;
        stop.container_id = Some("unrelated-container".to_string());
        worker.add_task(stop).await;

        let completed = worker.process_next().await.unwrap().unwrap();
        assert_eq!(completed.container_id.as_deref(), Some("container-0"));
        assert_eq!(*runtime.stopped.lock().unwrap(), vec!["container-0".to_string()]);
    }

    #[tokio::test]
    async fn unknown_running_task_is_not_recorded() {
        let (worker, runtime) = worker_with(FakeRuntime::default());
        let mut t = task(State::Running);
        t.container_id = Some("unrelated-container".to_string());
        worker.add_task(t.clone()).await;

        let result = worker.process_next().await;
        assert!(matches!(result, Err(WorkerError::UnexpectedState { state: State::Running, .. })));
        assert!(worker.get_task(&t.id).await.is_none());
        assert_eq!(worker.store.running_count().await, 0);
        assert!(runtime.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_stats_publishes_running_count() {
        let (worker, _) = worker_with(FakeRuntime::default());
        worker.add_task(task(State::Scheduled)).await;
        worker.add_task(task(State::Scheduled)).await;
        worker.process_next().await.unwrap();
        worker.process_next().await.unwrap();

        assert_eq!(worker.stats().task_count, 0);
        let snapshot = worker.refresh_stats(&FixedHost).await;
        assert_eq!(snapshot.task_count, 2);
        assert_eq!(snapshot.cpu_usage(), 0.7);
        assert_eq!(worker.stats(), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn run_tasks_drains_queue_on_each_tick() {
        let (worker, _) = worker_with(FakeRuntime::default());
        let worker = Arc::new(worker);
        let handle = tokio::spawn(run_tasks(worker.clone(), Duration::from_secs(5)));

        // The first tick fires immediately; let the loop park on the next one.
        tokio::time::sleep(Duration::from_millis(10)).await;

        worker.add_task(task(State::Scheduled)).await;
        worker.add_task(task(State::Scheduled)).await;
        assert_eq!(worker.store.running_count().await, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(worker.store.queue_len().await, 0);
        assert_eq!(worker.store.running_count().await, 2);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn collect_stats_replaces_snapshot_each_period() {
        let (worker, _) = worker_with(FakeRuntime::default());
        let worker = Arc::new(worker);
        let before = worker.stats();
        let handle = tokio::spawn(collect_stats(
            worker.clone(),
            Arc::new(FixedHost),
            Duration::from_secs(15),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = worker.stats();
        assert!(!Arc::ptr_eq(&before, &first));
        assert_eq!(first.mem_stats.mem_total, 4096);

        tokio::time::sleep(Duration::from_secs(15)).await;
        let second = worker.stats();
        assert!(!Arc::ptr_eq(&first, &second));

        handle.abort();
    }
}
