use crate::state::{AppMetrics, AppState};
use crate::worker::QueueStats;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let queue = state.pool.queue_stats().await;
    let cache = state.cache.stats().await;
    let engine = state.engine.stats();

    let status = if state.pool.is_running() { "healthy" } else { "degraded" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "rate_limited": metrics.rate_limited_count
        },
        "engine": {
            "sample_rate": state.engine.settings().sample_rate,
            "output_format": state.engine.settings().output_format.extension(),
            "hrir_loaded": engine.hrir_loaded,
            "presets": state.catalog().list().len()
        },
        "worker": queue,
        "cache": cache,
        "memory": get_memory_info(),
        "system": get_system_status(&queue)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": overall_metrics(&metrics, uptime_seconds),
        "endpoints": endpoint_stats,
        "engine": state.engine.stats(),
        "worker": state.pool.queue_stats().await,
        "cache": state.cache.stats().await,
        "memory": get_memory_info()
    }))
}

fn overall_metrics(metrics: &AppMetrics, uptime_seconds: u64) -> serde_json::Value {
    json!({
        "total_requests": metrics.request_count,
        "total_errors": metrics.error_count,
        "error_rate": metrics.error_rate(),
        "rate_limited": metrics.rate_limited_count,
        "requests_per_second": if uptime_seconds > 0 {
            metrics.request_count as f64 / uptime_seconds as f64
        } else {
            0.0
        }
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available (pid {})", process::id())
    })
}

/// Load level from queue occupancy.
fn get_system_status(queue: &QueueStats) -> serde_json::Value {
    let queue_usage = if queue.queue_capacity > 0 {
        queue.queue_size as f64 / queue.queue_capacity as f64
    } else {
        0.0
    };

    let status = if queue_usage > 0.9 {
        "high_load"
    } else if queue_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "queue_usage_percent": (queue_usage * 100.0).round(),
        "processing": queue.processing,
        "max_concurrent": queue.max_concurrent,
        "load_warnings": if queue_usage > 0.8 {
            vec!["Queue nearly full - consider increasing worker.max_concurrent"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use actix_web::{test, App};

    fn queue(queue_size: usize) -> QueueStats {
        QueueStats {
            queue_size,
            processing: 2,
            active_tasks: queue_size + 2,
            total_tasks: queue_size + 2,
            completed: 0,
            failed: 0,
            max_concurrent: 2,
            queue_capacity: 50,
            running: true,
            avg_processing_secs: 0.0,
        }
    }

    #[::core::prelude::v1::test]
    fn test_system_status_thresholds() {
        assert_eq!(get_system_status(&queue(10))["status"], "normal");
        assert_eq!(get_system_status(&queue(40))["status"], "moderate_load");
        assert_eq!(get_system_status(&queue(48))["status"], "high_load");
        assert_eq!(get_system_status(&queue(48))["load_warnings"].as_array().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn test_health_reports_components() {
        let harness = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(harness.state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["engine"]["hrir_loaded"], false);
        assert_eq!(body["engine"]["presets"], 7);
        assert_eq!(body["worker"]["max_concurrent"], 2);
        assert_eq!(body["cache"]["entries"], 0);
        harness.state.pool.stop().await;
    }
}
