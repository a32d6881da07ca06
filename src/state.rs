//! # Application State
//!
//! Everything request handlers share: the effective configuration, the
//! service components, and per-endpoint request metrics.
//!
//! ## Key Components:
//! - **Components**: engine, cache, worker pool, rate limiter and submission
//!   pipeline, each behind an `Arc` and internally synchronized
//! - **Metrics**: request counters behind a `std::sync::RwLock`; every lock
//!   is held for a single update, never across an `.await`
//!
//! ## Thread Safety:
//! `AppState` is cheap to clone and is cloned into every actix worker.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::audio::{PresetCatalog, SpatialEngine};
use crate::cache::ResultCache;
use crate::config::AppConfig;
use crate::pipeline::SpatialPipeline;
use crate::rate_limit::UserRateLimiter;
use crate::worker::WorkerPool;

#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed at startup
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub engine: Arc<SpatialEngine>,
    pub cache: Arc<ResultCache>,
    pub pool: Arc<WorkerPool>,
    pub limiter: Arc<UserRateLimiter>,
    pub pipeline: Arc<SpatialPipeline>,
    pub start_time: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Responses with status 429
    pub rate_limited_count: u64,
    /// Key: route pattern, e.g. "GET /api/v1/tasks/{task_id}"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Wire the shared components into state. The pipeline is built from
    /// the same engine, cache, pool and limiter handles.
    pub fn new(
        config: AppConfig,
        engine: Arc<SpatialEngine>,
        cache: Arc<ResultCache>,
        pool: Arc<WorkerPool>,
        limiter: Arc<UserRateLimiter>,
    ) -> Self {
        let pipeline = Arc::new(SpatialPipeline::new(
            config.pipeline_settings(),
            Arc::clone(&engine),
            Arc::clone(&cache),
            Arc::clone(&pool),
            Arc::clone(&limiter),
        ));

        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            engine,
            cache,
            pool,
            limiter,
            pipeline,
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PresetCatalog {
        self.engine.catalog()
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    pub fn increment_rate_limited_count(&self) {
        self.metrics_write().rate_limited_count += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
