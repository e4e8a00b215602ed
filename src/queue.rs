//! Single-consumer priority task queue.
//!
//! At most one task per type is ever pending or running: a new arrival is
//! dropped when an equal-or-higher-priority task of its type already exists,
//! and replaces a queued lower-priority one. Higher priorities run first;
//! equal priorities keep FIFO order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::db::{now_seconds, second_ts, TestKind};

/// What a task asks the consumer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PingAll,
    SpeedAll,
}

impl TaskType {
    pub fn test_kind(&self) -> TestKind {
        match self {
            TaskType::PingAll => TestKind::Ping,
            TaskType::SpeedAll => TestKind::Speed,
        }
    }
}

/// Execution priority. Scheduled triggers are normal; manual ones are high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal = 0,
    High = 1,
}

impl Serialize for Priority {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match u8::deserialize(d)? {
            0 => Ok(Priority::Normal),
            1 => Ok(Priority::High),
            other => Err(serde::de::Error::custom(format!("unknown priority {}", other))),
        }
    }
}

/// A unit of work. The queue assigns the id token on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskType,
    pub priority: Priority,
    #[serde(with = "second_ts")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(kind: TaskType, priority: Priority) -> Self {
        Self {
            id: String::new(),
            kind,
            priority,
            created_at: now_seconds(),
        }
    }
}

/// Atomic snapshot of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub running: Option<Task>,
    pub queued: Vec<Task>,
    pub length: usize,
}

/// Executes dequeued tasks. The scheduler is the production implementation.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, task: Task);
}

#[derive(Default)]
struct State {
    queued: Vec<Task>,
    running: Option<Task>,
    stopped: bool,
}

/// The queue itself. One consumer drains it; any number of producers enqueue.
pub struct TaskQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Insert a task, applying type dedup and priority preemption.
    pub fn enqueue(&self, mut task: Task) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }

        if task.id.is_empty() {
            task.id = Uuid::new_v4().simple().to_string()[..8].to_string();
        }

        // A running task of the same type absorbs the new one unless the
        // arrival is strictly higher priority (which then queues behind it).
        if let Some(running) = &state.running {
            if running.kind == task.kind && task.priority <= running.priority {
                debug!(id = %task.id, "dropping task; same type already running");
                return;
            }
        }

        if let Some(pos) = state.queued.iter().position(|t| t.kind == task.kind) {
            if state.queued[pos].priority >= task.priority {
                debug!(id = %task.id, "dropping task; same type already queued");
                return;
            }
            state.queued.remove(pos);
        }

        let insert_at = state
            .queued
            .iter()
            .position(|t| task.priority > t.priority)
            .unwrap_or(state.queued.len());
        state.queued.insert(insert_at, task);

        self.notify.notify_one();
    }

    /// Launch the single consumer.
    pub fn start(self: Arc<Self>, executor: Arc<dyn TaskExecutor>) -> tokio::task::JoinHandle<()> {
        let queue = self;
        tokio::spawn(async move {
            loop {
                let task = loop {
                    {
                        let mut state = queue.state.lock().unwrap();
                        if state.stopped {
                            return;
                        }
                        if !state.queued.is_empty() {
                            let task = state.queued.remove(0);
                            state.running = Some(task.clone());
                            break task;
                        }
                    }
                    queue.notify.notified().await;
                };

                executor.execute(task).await;

                queue.state.lock().unwrap().running = None;
            }
        })
    }

    /// Stop the consumer. The in-flight task finishes; queued tasks never run.
    pub fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
        self.notify.notify_one();
    }

    /// Snapshot of the current queue state.
    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock().unwrap();
        QueueStatus {
            running: state.running.clone(),
            queued: state.queued.clone(),
            length: state.queued.len(),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records executions; optionally holds each task until released.
    struct RecordingExecutor {
        executed: Mutex<Vec<Task>>,
        started_tx: mpsc::UnboundedSender<String>,
        release: Notify,
        hold: bool,
    }

    impl RecordingExecutor {
        fn new(hold: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    executed: Mutex::new(Vec::new()),
                    started_tx: tx,
                    release: Notify::new(),
                    hold,
                }),
                rx,
            )
        }

        fn executed(&self) -> Vec<Task> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(&self, task: Task) {
            self.executed.lock().unwrap().push(task.clone());
            let _ = self.started_tx.send(task.id);
            if self.hold {
                self.release.notified().await;
            }
        }
    }

    #[test]
    fn duplicate_normal_tasks_coalesce() {
        let queue = TaskQueue::new();
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));

        let status = queue.status();
        assert_eq!(status.length, 1);
        assert!(status.running.is_none());
    }

    #[test]
    fn high_replaces_queued_normal() {
        let queue = TaskQueue::new();
        queue.enqueue(Task::new(TaskType::SpeedAll, Priority::Normal));
        queue.enqueue(Task::new(TaskType::SpeedAll, Priority::High));

        let status = queue.status();
        assert_eq!(status.length, 1);
        assert_eq!(status.queued[0].priority, Priority::High);
    }

    #[test]
    fn normal_does_not_replace_queued_high() {
        let queue = TaskQueue::new();
        queue.enqueue(Task::new(TaskType::SpeedAll, Priority::High));
        let high_id = queue.status().queued[0].id.clone();

        queue.enqueue(Task::new(TaskType::SpeedAll, Priority::Normal));
        let status = queue.status();
        assert_eq!(status.length, 1);
        assert_eq!(status.queued[0].id, high_id);
    }

    #[test]
    fn high_priority_jumps_ahead_of_normal() {
        let queue = TaskQueue::new();
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));
        queue.enqueue(Task::new(TaskType::SpeedAll, Priority::High));

        let status = queue.status();
        assert_eq!(status.length, 2);
        assert_eq!(status.queued[0].kind, TaskType::SpeedAll);
        assert_eq!(status.queued[1].kind, TaskType::PingAll);
    }

    #[test]
    fn equal_priorities_keep_fifo_order() {
        let queue = TaskQueue::new();
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));
        queue.enqueue(Task::new(TaskType::SpeedAll, Priority::Normal));

        let status = queue.status();
        assert_eq!(status.queued[0].kind, TaskType::PingAll);
        assert_eq!(status.queued[1].kind, TaskType::SpeedAll);
    }

    #[tokio::test]
    async fn coalesced_task_executes_once() {
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));

        let (executor, mut started) = RecordingExecutor::new(false);
        let _ = queue.clone().start(executor.clone());

        started.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.executed().len(), 1);
    }

    #[tokio::test]
    async fn high_coexists_with_running_normal() {
        let queue = Arc::new(TaskQueue::new());
        let (executor, mut started) = RecordingExecutor::new(true);
        let _ = queue.clone().start(executor.clone());

        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));
        started.recv().await.unwrap();

        // Same type, higher priority: queued behind the running task.
        queue.enqueue(Task::new(TaskType::PingAll, Priority::High));
        // Same type, same priority as running: dropped.
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));

        let status = queue.status();
        assert!(status.running.is_some());
        assert_eq!(status.running.as_ref().unwrap().priority, Priority::Normal);
        assert_eq!(status.length, 1);
        assert_eq!(status.queued[0].priority, Priority::High);

        executor.release.notify_one();
        started.recv().await.unwrap();
        assert_eq!(queue.status().running.as_ref().unwrap().priority, Priority::High);
        executor.release.notify_one();
    }

    #[tokio::test]
    async fn stop_drains_current_task_only() {
        let queue = Arc::new(TaskQueue::new());
        let (executor, mut started) = RecordingExecutor::new(true);
        let handle = queue.clone().start(executor.clone());

        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));
        started.recv().await.unwrap();
        queue.enqueue(Task::new(TaskType::SpeedAll, Priority::Normal));

        queue.stop();
        executor.release.notify_one();
        handle.await.unwrap();

        // Only the in-flight task ran.
        assert_eq!(executor.executed().len(), 1);
        assert_eq!(executor.executed()[0].kind, TaskType::PingAll);
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_ignored() {
        let queue = TaskQueue::new();
        queue.stop();
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));
        assert_eq!(queue.status().length, 0);
    }

    #[test]
    fn task_ids_are_assigned_on_insert() {
        let queue = TaskQueue::new();
        queue.enqueue(Task::new(TaskType::PingAll, Priority::Normal));
        let status = queue.status();
        assert_eq!(status.queued[0].id.len(), 8);
    }

    #[test]
    fn status_serializes_priority_as_number() {
        let task = Task {
            id: "abcd1234".to_string(),
            kind: TaskType::PingAll,
            priority: Priority::High,
            created_at: now_seconds(),
        };
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        assert_eq!(v["type"], "ping_all");
        assert_eq!(v["priority"], 1);
    }
}
