//! # Processing Tasks
//!
//! A task is one queued spatialization job. Its lifecycle is a strict state
//! machine:
//!
//! ```text
//! queued ──► processing ──► completed
//!    │            │
//!    └────────────┴───────► failed
//! ```
//!
//! Terminal states (`completed`, `failed`) have no exits. Any attempt to
//! leave one is refused and logged.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Processing)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

/// Outcome of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub output_size: u64,
    pub elapsed_secs: f64,
}

/// Everything a caller supplies to enqueue work.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: String,
    pub user_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub preset_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: String,
    pub user_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub preset_id: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// 0..=100
    pub progress: f32,
    pub error: Option<String>,
    pub result: Option<TaskResult>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            task_id: request.task_id,
            user_id: request.user_id,
            input_path: request.input_path,
            output_path: request.output_path,
            preset_id: request.preset_id,
            created_at: Utc::now(),
            status: TaskStatus::Queued,
            progress: 0.0,
            error: None,
            result: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Seconds spent processing: finished tasks report their total, running
    /// tasks their time so far, queued tasks zero.
    pub fn duration_secs(&self) -> f64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => secs_between(start, end),
            (Some(start), None) => secs_between(start, Utc::now()),
            _ => 0.0,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                task_id = %self.task_id,
                from = self.status.as_str(),
                to = next.as_str(),
                "Refused task state transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    pub(crate) fn begin(&mut self) -> bool {
        if !self.transition(TaskStatus::Processing) {
            return false;
        }
        self.start_time = Some(Utc::now());
        self.progress = 10.0;
        true
    }

    pub(crate) fn set_progress(&mut self, progress: f32) {
        if self.status == TaskStatus::Processing {
            self.progress = progress.clamp(0.0, 100.0);
        }
    }

    pub(crate) fn complete(&mut self, output_size: u64) -> bool {
        if !self.transition(TaskStatus::Completed) {
            return false;
        }
        self.end_time = Some(Utc::now());
        self.progress = 100.0;
        self.result = Some(TaskResult {
            output_size,
            elapsed_secs: self.duration_secs(),
        });
        true
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.end_time = Some(Utc::now());
        self.error = Some(reason.into());
        true
    }
}

fn secs_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(TaskRequest {
            task_id: "t1".into(),
            user_id: "u1".into(),
            input_path: "in.wav".into(),
            output_path: "out.mp3".into(),
            preset_id: "cinema".into(),
        })
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = task();
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!(t.duration_secs(), 0.0);

        assert!(t.begin());
        assert_eq!(t.progress, 10.0);
        assert!(t.start_time.is_some());

        t.set_progress(95.0);
        assert!(t.complete(1234));
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 100.0);
        assert_eq!(t.result.as_ref().unwrap().output_size, 1234);
        assert!(t.end_time.is_some());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let mut t = task();
        assert!(t.fail("Worker stopped"));
        assert!(!t.begin());
        assert!(!t.complete(1));
        assert!(!t.fail("again"));
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("Worker stopped"));

        let mut done = task();
        assert!(done.begin());
        assert!(done.complete(1));
        assert!(!done.fail("late failure"));
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.error.is_none());
    }

    #[test]
    fn test_queued_cannot_complete_directly() {
        let mut t = task();
        assert!(!t.complete(1));
        assert_eq!(t.status, TaskStatus::Queued);
        t.set_progress(50.0);
        assert_eq!(t.progress, 0.0);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_value(TaskStatus::Processing).unwrap();
        assert_eq!(json, "processing");
        assert!(TaskStatus::Queued.is_active());
        assert!(TaskStatus::Completed.is_terminal());
    }
}
