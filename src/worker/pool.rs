//! # Worker Pool
//!
//! Bounded FIFO queue of spatialization tasks drained by a single dispatcher
//! into at most `max_concurrent` simultaneous runs.
//!
//! ## Key Components:
//! - **Task table**: every known task plus a per-user index, behind one async
//!   `RwLock`
//! - **Queue**: bounded `mpsc` channel of task ids; its capacity is the queue
//!   limit, so a full channel is a rejected enqueue with no side effects
//! - **Slots**: a `Semaphore` with `max_concurrent` permits. The dispatcher
//!   takes a permit *before* dequeuing, so queued work stays in the channel
//!   (and counts against capacity) until a slot is actually free
//! - **Completion**: an optional `oneshot` sender per task, fired exactly once
//!   after the terminal transition
//!
//! ## Thread Safety:
//! Processing runs in its own spawned task; a panic there becomes a failed
//! task instead of taking down the dispatcher. Table locks are never held
//! across processing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{EngineError, SpatialEngine};
use crate::worker::task::{Task, TaskRequest, TaskStatus};

pub const STOPPED_REASON: &str = "Worker stopped";
pub const MISSING_OUTPUT_REASON: &str = "Processing failed or output not created";

/// The work a pool runs for each task.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        input: &Path,
        output: &Path,
        preset_id: &str,
        timeout: Duration,
    ) -> Result<(), EngineError>;
}

#[async_trait]
impl TaskProcessor for SpatialEngine {
    async fn process(
        &self,
        input: &Path,
        output: &Path,
        preset_id: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.process_file(input, output, preset_id, timeout).await
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    /// Upper bound on how long the dispatcher blocks waiting for work
    pub poll_interval: Duration,
    /// Passed to the processor; bounds each external subprocess
    pub task_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub processing: usize,
    pub active_tasks: usize,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub running: bool,
    pub avg_processing_secs: f64,
}

struct TaskEntry {
    task: Task,
    completion: Option<oneshot::Sender<Task>>,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<String, TaskEntry>,
    by_user: HashMap<String, Vec<String>>,
}

struct PoolShared {
    settings: PoolSettings,
    processor: Arc<dyn TaskProcessor>,
    table: RwLock<TaskTable>,
    slots: Arc<Semaphore>,
    running: AtomicBool,
}

struct Control {
    sender: mpsc::Sender<String>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    control: Mutex<Option<Control>>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings, processor: Arc<dyn TaskProcessor>) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            shared: Arc::new(PoolShared {
                settings,
                processor,
                table: RwLock::new(TaskTable::default()),
                slots,
                running: AtomicBool::new(false),
            }),
            control: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the dispatcher. Calling this on a running pool is a no-op.
    pub async fn start(&self) {
        let mut control = self.control.lock().await;
        if control.is_some() {
            warn!("Worker pool already running");
            return;
        }

        let (sender, receiver) = mpsc::channel(self.shared.settings.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        self.shared.running.store(true, Ordering::SeqCst);

        let dispatcher = tokio::spawn(dispatch(self.shared.clone(), receiver, cancel.clone()));
        *control = Some(Control {
            sender,
            cancel,
            dispatcher,
        });

        info!(
            max_concurrent = self.shared.settings.max_concurrent,
            queue_capacity = self.shared.settings.queue_capacity,
            "Worker pool started"
        );
    }

    /// Stop dequeuing and fail every non-terminal task with "Worker stopped".
    ///
    /// In-flight processing is not interrupted; when it finishes its result is
    /// discarded because the task is already terminal.
    pub async fn stop(&self) {
        let Some(control) = self.control.lock().await.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        control.cancel.cancel();
        drop(control.sender);
        if let Err(e) = control.dispatcher.await {
            error!(error = %e, "Dispatcher task ended abnormally");
        }

        let mut stopped = Vec::new();
        {
            let mut table = self.shared.table.write().await;
            for entry in table.tasks.values_mut() {
                let was_queued = entry.task.status == TaskStatus::Queued;
                if entry.task.status.is_active() && entry.task.fail(STOPPED_REASON) {
                    stopped.push((entry.task.clone(), entry.completion.take(), was_queued));
                }
            }
        }

        let count = stopped.len();
        for (task, completion, was_queued) in stopped {
            // Processing tasks remove their own input once the run returns.
            if was_queued {
                remove_input(&task.input_path).await;
            }
            if let Some(tx) = completion {
                let _ = tx.send(task);
            }
        }

        info!(failed = count, "Worker pool stopped");
    }

    /// Queue a task. Returns `false` (and changes nothing) if the pool is not
    /// running, the queue is at capacity, or the id is already known.
    pub async fn enqueue(
        &self,
        request: TaskRequest,
        completion: Option<oneshot::Sender<Task>>,
    ) -> bool {
        let sender = match self.control.lock().await.as_ref() {
            Some(control) if self.is_running() => control.sender.clone(),
            _ => {
                warn!(task_id = %request.task_id, "Enqueue rejected: worker not running");
                return false;
            }
        };

        let slot = match sender.try_reserve() {
            Ok(slot) => slot,
            Err(mpsc::error::TrySendError::Full(())) => {
                warn!(
                    task_id = %request.task_id,
                    capacity = self.shared.settings.queue_capacity,
                    "Enqueue rejected: queue full"
                );
                return false;
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!(task_id = %request.task_id, "Enqueue rejected: queue closed");
                return false;
            }
        };

        let task_id = request.task_id.clone();
        let user_id = request.user_id.clone();
        {
            let mut table = self.shared.table.write().await;
            if table.tasks.contains_key(&task_id) {
                warn!(task_id = %task_id, "Enqueue rejected: duplicate task id");
                return false;
            }
            table.tasks.insert(
                task_id.clone(),
                TaskEntry {
                    task: Task::new(request),
                    completion,
                },
            );
            table
                .by_user
                .entry(user_id.clone())
                .or_default()
                .push(task_id.clone());
        }

        slot.send(task_id.clone());
        info!(task_id = %task_id, user_id = %user_id, "Task enqueued");
        true
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        let table = self.shared.table.read().await;
        table.tasks.get(task_id).map(|e| e.task.clone())
    }

    /// All tasks for `user_id`, oldest first.
    pub async fn tasks_for_user(&self, user_id: &str) -> Vec<Task> {
        let table = self.shared.table.read().await;
        table
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.tasks.get(id))
                    .map(|e| e.task.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn user_active_count(&self, user_id: &str) -> usize {
        self.tasks_for_user(user_id)
            .await
            .iter()
            .filter(|t| t.status.is_active())
            .count()
    }

    /// Queued plus processing.
    pub async fn active_count(&self) -> usize {
        let table = self.shared.table.read().await;
        table
            .tasks
            .values()
            .filter(|e| e.task.status.is_active())
            .count()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        let table = self.shared.table.read().await;
        let count = |status: TaskStatus| {
            table
                .tasks
                .values()
                .filter(|e| e.task.status == status)
                .count()
        };

        let queued = count(TaskStatus::Queued);
        let processing = count(TaskStatus::Processing);
        let completed: Vec<f64> = table
            .tasks
            .values()
            .filter(|e| e.task.status == TaskStatus::Completed)
            .map(|e| e.task.duration_secs())
            .collect();
        let avg = if completed.is_empty() {
            0.0
        } else {
            completed.iter().sum::<f64>() / completed.len() as f64
        };

        QueueStats {
            queue_size: queued,
            processing,
            active_tasks: queued + processing,
            total_tasks: table.tasks.len(),
            completed: completed.len(),
            failed: count(TaskStatus::Failed),
            max_concurrent: self.shared.settings.max_concurrent,
            queue_capacity: self.shared.settings.queue_capacity,
            running: self.is_running(),
            avg_processing_secs: (avg * 10.0).round() / 10.0,
        }
    }

    /// Most recently created tasks, newest first.
    pub async fn recent_tasks(&self, limit: usize) -> Vec<Task> {
        let table = self.shared.table.read().await;
        let mut tasks: Vec<Task> = table.tasks.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        tasks
    }

    /// Drop finished tasks whose `end_time` is more than `hours` ago and
    /// return them so their outputs can be cleaned up.
    pub async fn evict_older_than(&self, hours: u64) -> Vec<Task> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);
        self.evict_ended_before(cutoff).await
    }

    async fn evict_ended_before(&self, cutoff: chrono::DateTime<Utc>) -> Vec<Task> {
        let mut table = self.shared.table.write().await;
        let expired: Vec<String> = table
            .tasks
            .iter()
            .filter(|(_, e)| e.task.end_time.is_some_and(|end| end < cutoff))
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = table.tasks.remove(&id) {
                if let Some(ids) = table.by_user.get_mut(&entry.task.user_id) {
                    ids.retain(|t| t != &id);
                    if ids.is_empty() {
                        table.by_user.remove(&entry.task.user_id);
                    }
                }
                evicted.push(entry.task);
            }
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted old tasks");
        }
        evicted
    }
}

async fn dispatch(
    shared: Arc<PoolShared>,
    mut receiver: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    debug!("Dispatcher started");

    while shared.running.load(Ordering::SeqCst) {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = shared.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(shared.settings.poll_interval, receiver.recv()) => next,
        };

        match next {
            Ok(Some(task_id)) => {
                tokio::spawn(run_task(shared.clone(), task_id, permit));
            }
            Ok(None) => break,
            // Poll timeout; the slot is released and the loop re-checks state.
            Err(_) => continue,
        }
    }

    debug!("Dispatcher stopped");
}

async fn run_task(shared: Arc<PoolShared>, task_id: String, permit: OwnedSemaphorePermit) {
    let job = {
        let mut table = shared.table.write().await;
        match table.tasks.get_mut(&task_id) {
            Some(entry) => {
                if entry.task.begin() {
                    entry.task.set_progress(25.0);
                    Some((
                        entry.task.input_path.clone(),
                        entry.task.output_path.clone(),
                        entry.task.preset_id.clone(),
                    ))
                } else {
                    None
                }
            }
            None => {
                warn!(task_id = %task_id, "Dequeued unknown task");
                None
            }
        }
    };

    let Some((input, output, preset_id)) = job else {
        drop(permit);
        return;
    };
    info!(task_id = %task_id, preset = %preset_id, "Processing task");

    let processor = shared.processor.clone();
    let timeout = shared.settings.task_timeout;
    let (run_input, run_output, run_preset) = (input.clone(), output.clone(), preset_id.clone());
    let outcome = tokio::spawn(async move {
        processor
            .process(&run_input, &run_output, &run_preset, timeout)
            .await
    })
    .await;

    let outcome: Result<u64, String> = match outcome {
        Ok(Ok(())) => match tokio::fs::metadata(&output).await {
            Ok(meta) => Ok(meta.len()),
            Err(_) => Err(MISSING_OUTPUT_REASON.to_string()),
        },
        Ok(Err(e)) => Err(e.to_string()),
        Err(join) => Err(format!("processing task panicked: {join}")),
    };

    let finished = {
        let mut table = shared.table.write().await;
        table.tasks.get_mut(&task_id).and_then(|entry| {
            entry.task.set_progress(95.0);
            let transitioned = match &outcome {
                Ok(size) => entry.task.complete(*size),
                Err(reason) => entry.task.fail(reason.clone()),
            };
            transitioned.then(|| (entry.task.clone(), entry.completion.take()))
        })
    };

    match (&finished, &outcome) {
        (Some((task, _)), Ok(size)) => info!(
            task_id = %task_id,
            output_size = size,
            elapsed_secs = task.duration_secs(),
            "Task completed"
        ),
        (Some(_), Err(reason)) => error!(task_id = %task_id, error = %reason, "Task failed"),
        (None, _) => debug!(task_id = %task_id, "Task finished after it was already terminal"),
    }

    remove_input(&input).await;

    if let Some((task, Some(tx))) = finished {
        if tx.send(task).is_err() {
            debug!(task_id = %task_id, "Completion receiver dropped");
        }
    }
    drop(permit);
}

async fn remove_input(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove input file"),
    }
}
