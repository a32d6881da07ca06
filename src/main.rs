//! # Spatial Audio Backend
//!
//! HTTP service that turns uploaded audio into binaural stereo.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **audio**: Presets, DSP building blocks, ffmpeg boundary and the engine
//! - **cache**: Content-addressed store of finished outputs
//! - **worker**: Bounded task queue drained by a fixed-size worker pool
//! - **rate_limit**: Per-user admission limits
//! - **pipeline**: Upload validation and the cache → queue flow
//! - **state / health / middleware / handlers / error**: HTTP surface
//!
//! ## Background Work:
//! A janitor task sweeps the cache and evicts old finished tasks every
//! `cache.check_interval_secs`. On SIGINT/SIGTERM the worker pool is stopped
//! (pending tasks fail with "Worker stopped") before the server shuts down.

mod audio;
mod cache;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod rate_limit;
mod state;
mod worker;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::{FfmpegTranscoder, HrirPair, PresetCatalog, SpatialEngine};
use cache::ResultCache;
use config::AppConfig;
use rate_limit::UserRateLimiter;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::WorkerPool;

static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting spatial-audio-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    if config.features.enable_vocal_separation {
        warn!("Vocal separation is enabled in config but not supported, ignoring");
    }

    tokio::fs::create_dir_all(&config.worker.work_dir).await?;
    if config.cache.enabled {
        tokio::fs::create_dir_all(&config.cache.root).await?;
    }

    let engine = Arc::new(build_engine(&config));
    let cache = Arc::new(ResultCache::new(config.cache_settings()));
    let pool = Arc::new(WorkerPool::new(config.pool_settings(), engine.clone()));
    let limiter = Arc::new(UserRateLimiter::new(config.rate_limit_settings()));
    pool.start().await;

    let app_state = AppState::new(config.clone(), engine, cache, pool, limiter);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let janitor_cancel = CancellationToken::new();
    let janitor = tokio::spawn(run_janitor(
        app_state.clone(),
        janitor_cancel.clone(),
        Duration::from_secs(config.cache.check_interval_secs),
        config.worker.retention_hours,
    ));

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let http_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/presets", web::get().to(handlers::list_presets))
                    .route("/spatialize", web::post().to(handlers::spatialize))
                    .route("/tasks/{task_id}", web::get().to(handlers::get_task))
                    .route("/tasks/{task_id}/download", web::get().to(handlers::download_task))
                    .route("/users/{user_id}/tasks", web::get().to(handlers::user_tasks))
                    .route("/queue", web::get().to(handlers::queue_status))
                    .route("/cache", web::get().to(handlers::cache_stats))
                    .route("/cache", web::delete().to(handlers::clear_cache)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping worker pool...");
            app_state.pool.stop().await;
            server_handle.stop(true).await;
        }
    }

    janitor_cancel.cancel();
    if let Err(e) = janitor.await {
        error!("Janitor task error: {}", e);
    }
    app_state.pool.stop().await;

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spatial_audio_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Build the engine; missing or unreadable HRIR files fall back to
/// synthetic rendering.
fn build_engine(config: &AppConfig) -> SpatialEngine {
    let builtin = PresetCatalog::builtin();
    let catalog = PresetCatalog::from_presets(builtin.list().to_vec(), &config.audio.default_preset)
        .unwrap_or_else(|| {
            warn!(
                preset = %config.audio.default_preset,
                "Configured default preset is unknown, using built-in default"
            );
            builtin
        });

    let audio = &config.audio;
    let hrir = if audio.hrir_left.exists() && audio.hrir_right.exists() {
        match HrirPair::load(&audio.hrir_left, &audio.hrir_right, audio.sample_rate) {
            Ok(pair) => {
                info!(left = %audio.hrir_left.display(), right = %audio.hrir_right.display(), "Loaded HRIR pair");
                Some(pair)
            }
            Err(e) => {
                warn!(error = %e, "Failed to load HRIR files, using synthetic rendering");
                None
            }
        }
    } else {
        warn!(
            left = %audio.hrir_left.display(),
            right = %audio.hrir_right.display(),
            "HRIR files not found, using synthetic rendering"
        );
        None
    };

    SpatialEngine::new(
        Arc::new(FfmpegTranscoder::new(
            audio.ffmpeg_path.clone(),
            audio.ffprobe_path.clone(),
        )),
        Arc::new(catalog),
        config.engine_settings(),
        hrir,
    )
}

/// Periodic cache sweep and task-table eviction. Outputs of evicted tasks
/// are deleted; cached copies are separate files and survive.
async fn run_janitor(
    state: AppState,
    cancel: CancellationToken,
    interval: Duration,
    retention_hours: u64,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = state.cache.sweep().await;
        let evicted = state.pool.evict_older_than(retention_hours).await;
        for task in &evicted {
            if let Err(e) = tokio::fs::remove_file(&task.output_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(task_id = %task.task_id, error = %e, "Failed to remove task output");
                }
            }
        }

        info!(
            cache_expired = report.expired,
            cache_evicted = report.evicted,
            cache_entries = report.remaining_entries,
            tasks_evicted = evicted.len(),
            "Janitor pass complete"
        );
    }
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
