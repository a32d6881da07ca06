//! # Spatialization Task Handlers
//!
//! Upload, status and download endpoints for spatialization tasks.
//!
//! ## Available Endpoints:
//! - `POST /api/v1/spatialize` - Upload a file (multipart field `audio`,
//!   optional text fields `preset` and `user_id`)
//! - `GET /api/v1/tasks/{task_id}` - Task status and progress
//! - `GET /api/v1/tasks/{task_id}/download` - Processed audio
//! - `GET /api/v1/users/{user_id}/tasks` - A user's tasks and limits
//! - `GET /api/v1/queue` - Queue statistics and recent tasks

use crate::pipeline::Submission;
use crate::worker::{Task, TaskResult, TaskStatus};
use crate::{error::AppError, state::AppState};
use actix_multipart::{Field, Multipart};
use actix_web::{http::header, web, HttpResponse};
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::path::Path;

const ANONYMOUS_USER: &str = "anonymous";
const RECENT_TASKS: usize = 20;

/// Public view of a task; server-side paths stay private.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub user_id: String,
    pub preset: String,
    pub status: TaskStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: f64,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            user_id: task.user_id.clone(),
            preset: task.preset_id.clone(),
            status: task.status,
            progress: task.progress,
            error: task.error.clone(),
            result: task.result.clone(),
            created_at: task.created_at,
            start_time: task.start_time,
            end_time: task.end_time,
            duration_secs: task.duration_secs(),
        }
    }
}

#[derive(Debug, Default)]
struct UploadForm {
    audio: Option<Vec<u8>>,
    filename: Option<String>,
    preset: Option<String>,
    user_id: Option<String>,
}

async fn read_field(field: &mut Field, limit: u64) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
        if bytes.len() as u64 > limit {
            return Err(AppError::ValidationError(format!(
                "File too large: more than {} bytes",
                limit
            )));
        }
    }
    Ok(bytes)
}

async fn read_text(field: &mut Field) -> Result<String, AppError> {
    let bytes = read_field(field, 1024).await?;
    String::from_utf8(bytes)
        .map(|s| s.trim().to_string())
        .map_err(|_| AppError::ValidationError("Form field is not valid UTF-8".to_string()))
}

async fn read_upload(mut payload: Multipart, max_file_size: u64) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field.content_disposition().ok_or_else(|| {
            AppError::ValidationError("Missing content disposition".to_string())
        })?;

        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();
        let filename = content_disposition.get_filename().map(|s| s.to_string());

        match field_name.as_str() {
            "audio" => {
                form.filename = filename;
                form.audio = Some(read_field(&mut field, max_file_size).await?);
            }
            "preset" => form.preset = Some(read_text(&mut field).await?),
            "user_id" => form.user_id = Some(read_text(&mut field).await?),
            _ => {
                // drain unknown fields
                read_field(&mut field, max_file_size).await?;
            }
        }
    }

    Ok(form)
}

async fn audio_response(path: &Path, content_type: &'static str, cache: &str) -> Result<HttpResponse, AppError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AppError::NotFound(format!("Output file unavailable: {}", e)))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "spatial_audio".to_string());

    Ok(HttpResponse::Ok()
        .content_type(content_type)
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        ))
        .insert_header(("X-Cache", cache.to_string()))
        .body(bytes))
}

/// Submit an upload for spatialization.
///
/// ## Endpoint: `POST /api/v1/spatialize`
///
/// ## Responses:
/// - `200` with the processed audio when the result is already cached
/// - `202` with `{"task_id": ...}` when queued
/// - `400` invalid upload, `429` rate limited, `503` queue full
pub async fn spatialize(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let limits = &state.get_config().limits;
    let form = read_upload(payload, limits.max_file_size_bytes).await?;

    let audio = form
        .audio
        .ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;
    let user_id = form
        .user_id
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());
    let preset = form
        .preset
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| state.get_config().audio.default_preset.clone());
    let preset_fallback = !state.catalog().contains(&preset);

    let submission = state
        .pipeline
        .submit(&user_id, &audio, form.filename.as_deref(), &preset)
        .await?;

    match submission {
        Submission::Cached { path, .. } => {
            let content_type = state.engine.settings().output_format.content_type();
            audio_response(&path, content_type, "HIT").await
        }
        Submission::Queued {
            task_id, preset_id, ..
        } => Ok(HttpResponse::Accepted().json(json!({
            "task_id": task_id,
            "status": TaskStatus::Queued,
            "preset": preset_id,
            "preset_fallback": preset_fallback,
            "status_url": format!("/api/v1/tasks/{}", task_id),
            "download_url": format!("/api/v1/tasks/{}/download", task_id),
            "timestamp": Utc::now().to_rfc3339()
        }))),
    }
}

/// `GET /api/v1/tasks/{task_id}`
pub async fn get_task(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    let task = state
        .pool
        .get(&task_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;

    Ok(HttpResponse::Ok().json(TaskView::from(&task)))
}

/// `GET /api/v1/tasks/{task_id}/download`
///
/// Unfinished tasks answer `202` with their status instead of audio.
pub async fn download_task(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    let task = state
        .pool
        .get(&task_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;

    match task.status {
        TaskStatus::Completed => {
            let content_type = state.engine.settings().output_format.content_type();
            audio_response(&task.output_path, content_type, "MISS").await
        }
        TaskStatus::Failed => Err(AppError::NotFound(format!(
            "Task {} failed: {}",
            task_id,
            task.error.as_deref().unwrap_or("unknown error")
        ))),
        TaskStatus::Queued | TaskStatus::Processing => {
            Ok(HttpResponse::Accepted().json(TaskView::from(&task)))
        }
    }
}

/// `GET /api/v1/users/{user_id}/tasks`
pub async fn user_tasks(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let tasks: Vec<TaskView> = state
        .pool
        .tasks_for_user(&user_id)
        .await
        .iter()
        .map(TaskView::from)
        .collect();
    let active = state.pool.user_active_count(&user_id).await;
    let usage = state.limiter.usage(&user_id).await;
    let limits = state.limiter.settings();

    Ok(HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "tasks": tasks,
        "active_tasks": active,
        "usage": usage,
        "limits": {
            "enabled": limits.enabled,
            "max_requests_per_hour": limits.max_requests,
            "max_concurrent": limits.max_concurrent
        }
    })))
}

/// `GET /api/v1/queue`
pub async fn queue_status(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.pool.queue_stats().await;
    let recent: Vec<TaskView> = state
        .pool
        .recent_tasks(RECENT_TASKS)
        .await
        .iter()
        .map(TaskView::from)
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "stats": stats,
        "recent_tasks": recent
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wavio::{write_wav_16, AudioBuffer};
    use crate::state::testing::test_state;
    use actix_web::{http::StatusCode, test, App};
    use std::f64::consts::PI;
    use std::time::Duration;

    const BOUNDARY: &str = "spatialboundary";

    fn sine_wav(seconds: f64) -> Vec<u8> {
        let rate = 44_100;
        let frames = (seconds * rate as f64) as usize;
        let samples = (0..frames)
            .map(|i| 0.4 * (2.0 * PI * 330.0 * i as f64 / rate as f64).sin())
            .collect();
        let file = tempfile::NamedTempFile::new().unwrap();
        write_wav_16(file.path(), &AudioBuffer::new(rate, vec![samples])).unwrap();
        std::fs::read(file.path()).unwrap()
    }

    fn multipart_body(audio: &[u8], preset: Option<&str>, user_id: &str) -> Vec<u8> {
        let mut body = Vec::new();
        let text = |name: &str, value: &str, body: &mut Vec<u8>| {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        };
        text("user_id", user_id, &mut body);
        if let Some(preset) = preset {
            text("preset", preset, &mut body);
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(audio);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload(audio: &[u8], preset: Option<&str>, user_id: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/api/v1/spatialize")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart_body(audio, preset, user_id))
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .route("/api/v1/spatialize", web::post().to(spatialize))
                    .route("/api/v1/tasks/{task_id}", web::get().to(get_task))
                    .route("/api/v1/tasks/{task_id}/download", web::get().to(download_task))
                    .route("/api/v1/users/{user_id}/tasks", web::get().to(user_tasks))
                    .route("/api/v1/queue", web::get().to(queue_status)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_upload_then_download_then_cache_hit() {
        let harness = test_state().await;
        let app = app!(harness.state);
        let audio = sine_wav(6.0);

        let resp = test::call_service(&app, upload(&audio, Some("club"), "u-1").to_request()).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = test::read_body_json(resp).await;
        let task_id = body["task_id"].as_str().unwrap().to_string();
        assert_eq!(body["preset"], "club");
        assert_eq!(body["preset_fallback"], false);

        let mut status = String::new();
        for _ in 0..500 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/v1/tasks/{task_id}"))
                .to_request();
            let task: serde_json::Value = test::call_and_read_body_json(&app, req).await;
            status = task["status"].as_str().unwrap().to_string();
            if status == "completed" || status == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, "completed");

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/tasks/{task_id}/download"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("X-Cache").unwrap(), "MISS");
        let bytes = test::read_body(resp).await;
        assert_eq!(&bytes[..4], b"RIFF");

        // The listener caches the output just after the task completes.
        for _ in 0..200 {
            if harness.state.cache.stats().await.entries == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let hit = test::call_service(&app, upload(&audio, Some("club"), "u-1").to_request()).await;
        assert_eq!(hit.status(), StatusCode::OK);
        assert_eq!(hit.headers().get("X-Cache").unwrap(), "HIT");
        harness.state.pool.stop().await;
    }

    #[actix_web::test]
    async fn test_rejections_map_to_statuses() {
        let harness = test_state().await;
        let app = app!(harness.state);

        let resp = test::call_service(&app, upload(&sine_wav(1.0), None, "u-2").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "validation_error");

        let req = test::TestRequest::get().uri("/api/v1/tasks/missing").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        for _ in 0..10 {
            harness.state.limiter.on_submit("u-3").await;
            harness.state.limiter.on_complete("u-3").await;
        }
        let resp = test::call_service(&app, upload(&sine_wav(6.0), None, "u-3").to_request()).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        harness.state.pool.stop().await;
        let resp = test::call_service(&app, upload(&sine_wav(6.0), None, "u-4").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let req = test::TestRequest::get().uri("/api/v1/queue").to_request();
        let queue: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(queue["stats"]["total_tasks"], 0);
        assert_eq!(queue["stats"]["running"], false);
    }

    #[actix_web::test]
    async fn test_user_tasks_lists_only_that_user() {
        let harness = test_state().await;
        let app = app!(harness.state);

        let resp = test::call_service(&app, upload(&sine_wav(6.0), None, "u-5").to_request()).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let req = test::TestRequest::get().uri("/api/v1/users/u-5/tasks").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let tasks = body["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["preset"], "cinema");
        assert!(tasks[0].get("input_path").is_none());
        assert_eq!(body["usage"]["requests_in_window"], 1);

        let req = test::TestRequest::get().uri("/api/v1/users/nobody/tasks").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert!(body["tasks"].as_array().unwrap().is_empty());
        harness.state.pool.stop().await;
    }
}
