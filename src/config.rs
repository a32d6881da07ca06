//! # Configuration Management
//!
//! Loads the service configuration from layered sources and hands each
//! component its own settings struct.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables `SPATIAL_<SECTION>__<KEY>`, e.g.
//!    `SPATIAL_WORKER__MAX_CONCURRENT=4`
//! 3. Configuration file (`config.toml`, optional)
//! 4. Default values (defined in the `Default` impls)
//!
//! ## Sections:
//! - **server**: bind address
//! - **audio**: working format, output encoding, external tools, HRIR files
//! - **limits**: upload size and duration bounds
//! - **cache**: result cache location, TTL and size limits
//! - **worker**: queue and concurrency limits, task retention
//! - **rate_limit**: per-user admission limits
//! - **features**: optional behaviour switches

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::presets::DEFAULT_PRESET;
use crate::audio::{EngineSettings, OutputFormat};
use crate::cache::CacheSettings;
use crate::pipeline::PipelineSettings;
use crate::rate_limit::RateLimitSettings;
use crate::worker::PoolSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
    pub rate_limit: RateLimitConfig,
    pub features: FeaturesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Working format, output encoding and the external tools.
///
/// `hrir_left` / `hrir_right` are optional assets: when either file is
/// missing the engine falls back to synthetic rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// mp3, aac, flac or wav
    pub output_format: String,
    pub bitrate: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub transcode_timeout_secs: u64,
    pub hrir_left: PathBuf,
    pub hrir_right: PathBuf,
    pub default_preset: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            output_format: "mp3".to_string(),
            bitrate: "320k".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            transcode_timeout_secs: 300,
            hrir_left: PathBuf::from("assets/hrir/kemar_45_l.wav"),
            hrir_right: PathBuf::from("assets/hrir/kemar_45_r.wav"),
            default_preset: DEFAULT_PRESET.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_file_size_bytes: u64,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 100 * 1024 * 1024,
            min_duration_secs: 5.0,
            max_duration_secs: 600.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub root: PathBuf,
    pub ttl_secs: u64,
    pub check_interval_secs: u64,
    pub max_size_bytes: u64,
    /// Newest entries that size eviction never touches
    pub retain_floor: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("tmp/audio_cache"),
            ttl_secs: 86_400,
            check_interval_secs: 1_800,
            max_size_bytes: 1024 * 1024 * 1024,
            retain_floor: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    /// Per-subprocess bound for a task; `audio.transcode_timeout_secs` caps it
    pub task_timeout_secs: u64,
    /// Finished tasks older than this are dropped from the task table
    pub retention_hours: u64,
    pub work_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            queue_capacity: 50,
            poll_interval_ms: 500,
            task_timeout_secs: 300,
            retention_hours: 24,
            work_dir: PathBuf::from("tmp/audio_work"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests_per_hour: usize,
    pub max_concurrent_per_user: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_hour: 10,
            max_concurrent_per_user: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Not implemented; enabling it only logs a warning at startup.
    pub enable_vocal_separation: bool,
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("SPATIAL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Channel count must be greater than 0"));
        }

        if self.audio.transcode_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Transcode timeout must be greater than 0"));
        }

        if self.limits.max_file_size_bytes == 0 {
            return Err(anyhow::anyhow!("Max file size must be greater than 0"));
        }

        if self.limits.min_duration_secs < 0.0
            || self.limits.max_duration_secs <= self.limits.min_duration_secs
        {
            return Err(anyhow::anyhow!(
                "Duration bounds are invalid: min {}s, max {}s",
                self.limits.min_duration_secs,
                self.limits.max_duration_secs
            ));
        }

        if self.cache.ttl_secs == 0 || self.cache.check_interval_secs == 0 {
            return Err(anyhow::anyhow!("Cache TTL and check interval must be greater than 0"));
        }

        if self.worker.max_concurrent == 0 {
            return Err(anyhow::anyhow!("Max concurrent tasks must be greater than 0"));
        }

        if self.worker.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacity must be greater than 0"));
        }

        if self.worker.task_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Task timeout must be greater than 0"));
        }

        if self.worker.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Poll interval must be greater than 0"));
        }

        if self.rate_limit.enabled
            && (self.rate_limit.max_requests_per_hour == 0
                || self.rate_limit.max_concurrent_per_user == 0)
        {
            return Err(anyhow::anyhow!(
                "Rate limits must be greater than 0 when rate limiting is enabled"
            ));
        }

        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            output_format: OutputFormat::parse(&self.audio.output_format),
            bitrate: self.audio.bitrate.clone(),
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            enabled: self.cache.enabled,
            root: self.cache.root.clone(),
            ttl: Duration::from_secs(self.cache.ttl_secs),
            check_interval: Duration::from_secs(self.cache.check_interval_secs),
            max_size_bytes: self.cache.max_size_bytes,
            retain_floor: self.cache.retain_floor,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_concurrent: self.worker.max_concurrent,
            queue_capacity: self.worker.queue_capacity,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            task_timeout: Duration::from_secs(
                self.worker
                    .task_timeout_secs
                    .min(self.audio.transcode_timeout_secs),
            ),
        }
    }

    pub fn rate_limit_settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            enabled: self.rate_limit.enabled,
            max_requests: self.rate_limit.max_requests_per_hour,
            window: Duration::from_secs(3600),
            max_concurrent: self.rate_limit.max_concurrent_per_user,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_file_size_bytes: self.limits.max_file_size_bytes,
            min_duration_secs: self.limits.min_duration_secs,
            max_duration_secs: self.limits.max_duration_secs,
            work_dir: self.worker.work_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.default_preset, "cinema");
        assert_eq!(config.limits.max_file_size_bytes, 104_857_600);
        assert_eq!(config.cache.max_size_bytes, 1_073_741_824);
        assert_eq!(config.worker.queue_capacity, 50);
        assert_eq!(config.rate_limit.max_requests_per_hour, 10);
        assert!(!config.features.enable_vocal_separation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.limits.max_duration_secs = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rate_limit.max_requests_per_hour = 0;
        assert!(config.validate().is_err());
        config.rate_limit.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_fill_from_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"worker": {"max_concurrent": 4}, "audio": {"output_format": "flac"}}"#)
                .unwrap();
        assert_eq!(config.worker.max_concurrent, 4);
        assert_eq!(config.worker.queue_capacity, 50);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.engine_settings().output_format, OutputFormat::Flac);
    }

    #[test]
    fn test_component_settings() {
        let config = AppConfig::default();
        let pool = config.pool_settings();
        assert_eq!(pool.max_concurrent, 2);
        assert_eq!(pool.poll_interval, Duration::from_millis(500));
        assert_eq!(pool.task_timeout, Duration::from_secs(300));

        let cache = config.cache_settings();
        assert_eq!(cache.ttl, Duration::from_secs(86_400));
        assert_eq!(cache.retain_floor, 5);

        let limiter = config.rate_limit_settings();
        assert_eq!(limiter.window, Duration::from_secs(3600));
        assert_eq!(limiter.max_concurrent, 2);
    }
}
