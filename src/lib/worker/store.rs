use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::tasks::types::{State, Task};

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Task>,
    db: HashMap<Uuid, Task>,
}

/// Owns the pending-task queue and the latest known record of every task.
///
/// Both live behind one lock. The lock is never held across a runtime call.
#[derive(Debug, Default)]
pub struct TaskStore {
    inner: Mutex<Inner>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, task: Task) {
        self.inner.lock().await.queue.push_back(task);
    }

    pub async fn dequeue(&self) -> Option<Task> {
        self.inner.lock().await.queue.pop_front()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn get(&self, id: &Uuid) -> Option<Task> {
        self.inner.lock().await.db.get(id).cloned()
    }

    pub async fn put(&self, task: Task) {
        self.inner.lock().await.db.insert(task.id, task);
    }

    pub async fn all(&self) -> Vec<Task> {
        self.inner.lock().await.db.values().cloned().collect()
    }

    /// Number of records currently in `Running`.
    pub async fn running_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .db
            .values()
            .filter(|t| t.state == State::Running)
            .count()
    }
}
