//! # Submission Pipeline
//!
//! Glue between an upload and the worker pool. Everything that can be
//! rejected synchronously is rejected here, before a task exists.
//!
//! ## Order of Checks:
//! 1. **Admission**: per-user hourly and concurrent limits
//! 2. **Size**: raw byte count against `max_file_size_bytes`
//! 3. **Cache**: a hit is returned directly, the engine is never touched
//! 4. **Probe**: the upload is written to the work dir and must decode and
//!    sit inside the duration bounds
//! 5. **Enqueue**: a full queue rolls back the admission record and the file
//!
//! A spawned listener follows every queued task to its terminal state,
//! releases the user's concurrency slot and caches successful output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::SpatialEngine;
use crate::cache::{cache_key, ResultCache};
use crate::rate_limit::{RateLimitRejection, UserRateLimiter};
use crate::worker::{Task, TaskRequest, TaskStatus, WorkerPool};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_file_size_bytes: u64,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    pub work_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("empty upload")]
    Empty,

    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("audio too short: {duration:.1}s (min {min}s)")]
    TooShort { duration: f64, min: f64 },

    #[error("audio too long: {duration:.1}s (max {max}s)")]
    TooLong { duration: f64, max: f64 },

    #[error("unreadable or unsupported audio file")]
    Unreadable,

    #[error(transparent)]
    RateLimited(#[from] RateLimitRejection),

    #[error("processing queue is full, try again later")]
    QueueFull,

    #[error("failed to stage upload: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum Submission {
    /// Served from the result cache.
    Cached { path: PathBuf, preset_id: String },
    /// Accepted for processing. `finished` resolves after the task reaches
    /// a terminal state and, if it completed, after its output is cached.
    Queued {
        task_id: String,
        preset_id: String,
        finished: oneshot::Receiver<Task>,
    },
}

pub struct SpatialPipeline {
    settings: PipelineSettings,
    engine: Arc<SpatialEngine>,
    cache: Arc<ResultCache>,
    pool: Arc<WorkerPool>,
    limiter: Arc<UserRateLimiter>,
}

impl SpatialPipeline {
    pub fn new(
        settings: PipelineSettings,
        engine: Arc<SpatialEngine>,
        cache: Arc<ResultCache>,
        pool: Arc<WorkerPool>,
        limiter: Arc<UserRateLimiter>,
    ) -> Self {
        Self {
            settings,
            engine,
            cache,
            pool,
            limiter,
        }
    }

    pub async fn submit(
        &self,
        user_id: &str,
        input: &[u8],
        file_name: Option<&str>,
        preset: &str,
    ) -> Result<Submission, SubmitError> {
        let preset_id = self.engine.catalog().lookup(preset).id.to_string();

        self.limiter.may_submit(user_id).await?;

        if input.is_empty() {
            return Err(SubmitError::Empty);
        }
        let size = input.len() as u64;
        if size > self.settings.max_file_size_bytes {
            return Err(SubmitError::TooLarge {
                size,
                max: self.settings.max_file_size_bytes,
            });
        }

        let hash = cache_key(input, &preset_id);
        if let Some(entry) = self.cache.lookup_key(&preset_id, &hash).await {
            return Ok(Submission::Cached {
                path: entry.path,
                preset_id,
            });
        }

        let task_id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        let input_path = self
            .settings
            .work_dir
            .join(format!("{task_id}_input.{}", upload_extension(file_name)));
        let output_path = self.settings.work_dir.join(format!(
            "{task_id}_spatial.{}",
            self.engine.settings().output_format.extension()
        ));
        tokio::fs::write(&input_path, input).await?;

        if let Err(e) = self.check_duration(&input_path).await {
            remove_staged(&input_path).await;
            return Err(e);
        }

        self.limiter.on_submit(user_id).await;

        let (completion_tx, completion_rx) = oneshot::channel();
        let request = TaskRequest {
            task_id: task_id.clone(),
            user_id: user_id.to_string(),
            input_path: input_path.clone(),
            output_path,
            preset_id: preset_id.clone(),
        };
        if !self.pool.enqueue(request, Some(completion_tx)).await {
            self.limiter.on_complete(user_id).await;
            remove_staged(&input_path).await;
            return Err(SubmitError::QueueFull);
        }

        let (finished_tx, finished_rx) = oneshot::channel();
        tokio::spawn(follow_task(
            completion_rx,
            finished_tx,
            user_id.to_string(),
            hash,
            Arc::clone(&self.cache),
            Arc::clone(&self.limiter),
        ));

        info!(task_id = %task_id, user_id = %user_id, preset = %preset_id, size_bytes = size, "Submission queued");
        Ok(Submission::Queued {
            task_id,
            preset_id,
            finished: finished_rx,
        })
    }

    async fn check_duration(&self, input_path: &Path) -> Result<(), SubmitError> {
        let info = self.engine.probe(input_path).await;
        if !info.is_known() {
            return Err(SubmitError::Unreadable);
        }
        let duration = info.duration_secs;
        if duration < self.settings.min_duration_secs {
            return Err(SubmitError::TooShort {
                duration,
                min: self.settings.min_duration_secs,
            });
        }
        if duration > self.settings.max_duration_secs {
            return Err(SubmitError::TooLong {
                duration,
                max: self.settings.max_duration_secs,
            });
        }
        Ok(())
    }
}

async fn follow_task(
    completion: oneshot::Receiver<Task>,
    finished: oneshot::Sender<Task>,
    user_id: String,
    hash: String,
    cache: Arc<ResultCache>,
    limiter: Arc<UserRateLimiter>,
) {
    let task = match completion.await {
        Ok(task) => task,
        Err(_) => {
            warn!(user_id = %user_id, "Task completion dropped without a result");
            limiter.on_complete(&user_id).await;
            return;
        }
    };
    limiter.on_complete(&user_id).await;

    if task.status == TaskStatus::Completed {
        let mut extra = serde_json::Map::new();
        extra.insert("task_id".into(), task.task_id.clone().into());
        if let Some(result) = &task.result {
            extra.insert("processing_secs".into(), result.elapsed_secs.into());
        }
        cache
            .store_key(&hash, &task.preset_id, &task.output_path, extra)
            .await;
    }

    if finished.send(task).is_err() {
        debug!(user_id = %user_id, "Nobody waiting on finished task");
    }
}

fn upload_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

async fn remove_staged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove staged upload");
    }
}
