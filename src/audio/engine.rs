//! # Spatial Audio Engine
//!
//! Turns an arbitrary input file into an encoded binaural stereo file.
//!
//! ## Pipeline:
//! 1. **Probe** the input (rejects unreadable files early)
//! 2. **Transcode** to PCM WAV at the working rate/channel count
//! 3. **Load** and **resample** if the decoder did not honour the rate
//! 4. **Spatialize** on the blocking pool (downmix → EQ → binaural render →
//!    ILD → loudness → peak limit)
//! 5. **Write** a 16-bit WAV and **encode** it to the output format
//!
//! Intermediate files live next to the output and are removed on every exit
//! path by a drop guard.
//!
//! ## Thread Safety:
//! `SpatialEngine` is shared behind an `Arc`; its counters are atomics and the
//! DSP state (`Spatializer`) is immutable and cheap to clone into
//! `spawn_blocking` closures.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::convolve::convolve_same;
use crate::audio::filters::apply_eq;
use crate::audio::loudness;
use crate::audio::presets::{Preset, PresetCatalog};
use crate::audio::resample::{resample_channels, resample_linear};
use crate::audio::transcoder::{AudioInfo, OutputFormat, TranscodeError, Transcoder};
use crate::audio::wavio::{read_wav, write_wav_16, AudioBuffer};

/// Output ceiling after peak limiting.
pub const PEAK_CEILING: f64 = 0.99;

/// Base interaural time difference for the synthetic renderer, in seconds.
const BASE_ITD_SECS: f64 = 0.0007;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transcode failed: {0}")]
    Transcode(#[source] TranscodeError),

    #[error("encode failed: {0}")]
    Encode(#[source] TranscodeError),

    #[error("wav i/o failed: {0}")]
    Wav(#[from] hound::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("Processing failed or output not created")]
    MissingOutput,
}

/// Left/right head-related impulse responses at the working sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct HrirPair {
    pub left: Vec<f64>,
    pub right: Vec<f64>,
}

impl HrirPair {
    /// Load a pair of WAV impulse responses, keeping the first channel of
    /// each and resampling to `sample_rate`.
    pub fn load(left: &Path, right: &Path, sample_rate: u32) -> Result<Self, EngineError> {
        let load_one = |path: &Path| -> Result<Vec<f64>, EngineError> {
            let audio = read_wav(path)?;
            let first = audio
                .channels
                .into_iter()
                .next()
                .filter(|ch| !ch.is_empty())
                .ok_or_else(|| EngineError::InvalidInput(format!("empty HRIR: {}", path.display())))?;
            Ok(resample_linear(&first, audio.sample_rate, sample_rate))
        };

        Ok(Self {
            left: load_one(left)?,
            right: load_one(right)?,
        })
    }
}

/// Immutable DSP state for one working sample rate.
#[derive(Debug, Clone)]
pub struct Spatializer {
    sample_rate: u32,
    hrir: Option<Arc<HrirPair>>,
}

impl Spatializer {
    pub fn new(sample_rate: u32, hrir: Option<HrirPair>) -> Self {
        Self {
            sample_rate,
            hrir: hrir.map(Arc::new),
        }
    }

    pub fn has_hrir(&self) -> bool {
        self.hrir.is_some()
    }

    /// Render `channels` to binaural stereo. Never fails: if rendering breaks
    /// down the downmix is duplicated to both ears and still peak limited.
    pub fn spatialize(&self, channels: &[Vec<f64>], preset: &Preset) -> Vec<Vec<f64>> {
        let mono = downmix(channels);

        let rendered = catch_unwind(AssertUnwindSafe(|| self.render(mono.clone(), preset)))
            .unwrap_or_else(|_| Err(EngineError::Internal("renderer panicked".into())));

        match rendered {
            Ok(stereo) => stereo,
            Err(e) => {
                error!(preset = %preset.id, error = %e, "Spatialization failed, using degraded stereo");
                let mut stereo = vec![mono.clone(), mono];
                limit_peak(&mut stereo);
                stereo
            }
        }
    }

    fn render(&self, mut mono: Vec<f64>, preset: &Preset) -> Result<Vec<Vec<f64>>, EngineError> {
        if mono.is_empty() {
            return Err(EngineError::InvalidInput("no samples".into()));
        }
        let sr = self.sample_rate as f64;

        if preset.use_eq {
            let applied = apply_eq(&mut mono, sr, &preset.eq_bands);
            debug!(preset = %preset.id, bands = applied, "EQ applied");
        }

        let (mut left, mut right) = match &self.hrir {
            Some(hrir) => (convolve_same(&mono, &hrir.left), convolve_same(&mono, &hrir.right)),
            None => {
                let delay = (BASE_ITD_SECS * sr * preset.itd_exaggeration) as usize;
                (delayed(&mono, delay), mono)
            }
        };

        for s in left.iter_mut() {
            *s *= preset.ild_exaggeration;
        }
        for s in right.iter_mut() {
            *s /= preset.ild_exaggeration;
        }

        if preset.normalize_loudness {
            for channel in [&mut left, &mut right] {
                loudness::normalize(std::slice::from_mut(channel), sr, preset.target_loudness);
            }
        }

        let mut stereo = vec![left, right];
        if stereo.iter().flatten().any(|s| !s.is_finite()) {
            return Err(EngineError::Internal("non-finite samples after render".into()));
        }
        limit_peak(&mut stereo);
        Ok(stereo)
    }
}

/// Average all channels to mono. Non-finite input samples count as silence.
pub fn downmix(channels: &[Vec<f64>]) -> Vec<f64> {
    let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
    if channels.is_empty() {
        return Vec::new();
    }
    let count = channels.len() as f64;
    (0..frames)
        .map(|i| {
            channels
                .iter()
                .map(|ch| if ch[i].is_finite() { ch[i] } else { 0.0 })
                .sum::<f64>()
                / count
        })
        .collect()
}

fn delayed(samples: &[f64], delay: usize) -> Vec<f64> {
    let delay = delay.min(samples.len());
    let mut out = vec![0.0; delay];
    out.extend_from_slice(&samples[..samples.len() - delay]);
    out
}

/// Scale so the absolute peak is at most [`PEAK_CEILING`].
pub fn limit_peak(channels: &mut [Vec<f64>]) {
    let peak = channels
        .iter()
        .flatten()
        .filter(|s| s.is_finite())
        .fold(0.0f64, |acc, s| acc.max(s.abs()));

    let scale = if peak > PEAK_CEILING { PEAK_CEILING / peak } else { 1.0 };
    for sample in channels.iter_mut().flatten() {
        *sample = if sample.is_finite() {
            (*sample * scale).clamp(-PEAK_CEILING, PEAK_CEILING)
        } else {
            0.0
        };
    }
}

/// Working format and output encoding.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub output_format: OutputFormat,
    pub bitrate: String,
}

#[derive(Debug, Default)]
struct EngineCounters {
    spatialize_calls: AtomicU64,
    transcodes: AtomicU64,
    encodes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub spatialize_calls: u64,
    pub transcodes: u64,
    pub encodes: u64,
    pub failures: u64,
    pub hrir_loaded: bool,
}

/// Removes intermediate files when dropped.
struct ScratchFiles(Vec<PathBuf>);

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove intermediate file");
                }
            }
        }
    }
}

pub struct SpatialEngine {
    transcoder: Arc<dyn Transcoder>,
    catalog: Arc<PresetCatalog>,
    spatializer: Spatializer,
    settings: EngineSettings,
    counters: EngineCounters,
}

impl SpatialEngine {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        catalog: Arc<PresetCatalog>,
        settings: EngineSettings,
        hrir: Option<HrirPair>,
    ) -> Self {
        if hrir.is_some() {
            info!(sample_rate = settings.sample_rate, "Engine using HRIR convolution");
        } else {
            warn!("No HRIR loaded, engine will use synthetic stereo rendering");
        }

        Self {
            transcoder,
            catalog,
            spatializer: Spatializer::new(settings.sample_rate, hrir),
            settings,
            counters: EngineCounters::default(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &PresetCatalog {
        &self.catalog
    }

    /// Probe `path`, returning [`AudioInfo::UNKNOWN`] if it cannot be read.
    pub async fn probe(&self, path: &Path) -> AudioInfo {
        match self.transcoder.probe(path).await {
            Ok(info) => info,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Probe failed");
                AudioInfo::UNKNOWN
            }
        }
    }

    pub async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
        timeout: Duration,
    ) -> bool {
        self.try_transcode(input, output, sample_rate, channels, timeout)
            .await
            .is_ok()
    }

    pub async fn encode(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        bitrate: &str,
        timeout: Duration,
    ) -> bool {
        self.try_encode(input, output, format, bitrate, timeout)
            .await
            .is_ok()
    }

    async fn try_transcode(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
        timeout: Duration,
    ) -> Result<(), TranscodeError> {
        self.transcoder
            .transcode(input, output, sample_rate, channels, timeout)
            .await?;
        self.counters.transcodes.fetch_add(1, Ordering::Relaxed);
        debug!(output = %output.display(), sample_rate, channels, "Transcoded to WAV");
        Ok(())
    }

    async fn try_encode(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        bitrate: &str,
        timeout: Duration,
    ) -> Result<(), TranscodeError> {
        self.transcoder
            .encode(input, output, format, bitrate, timeout)
            .await?;
        self.counters.encodes.fetch_add(1, Ordering::Relaxed);
        debug!(output = %output.display(), codec = format.codec(), bitrate, "Encoded output");
        Ok(())
    }

    /// Synchronous spatialization at the engine's working rate.
    pub fn spatialize(&self, channels: &[Vec<f64>], preset: &Preset) -> Vec<Vec<f64>> {
        self.counters.spatialize_calls.fetch_add(1, Ordering::Relaxed);
        self.spatializer.spatialize(channels, preset)
    }

    /// Run the full file pipeline. `timeout` bounds each subprocess.
    pub async fn process_file(
        &self,
        input: &Path,
        output: &Path,
        preset_id: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let result = self.run_pipeline(input, output, preset_id, timeout).await;
        if let Err(e) = &result {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            error!(input = %input.display(), preset = %preset_id, error = %e, "Processing failed");
        }
        result
    }

    async fn run_pipeline(
        &self,
        input: &Path,
        output: &Path,
        preset_id: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let preset = self.catalog.lookup(preset_id).clone();

        let info = self.probe(input).await;
        if !info.is_known() {
            return Err(EngineError::InvalidInput(format!(
                "unreadable audio: {}",
                input.display()
            )));
        }
        info!(
            input = %input.display(),
            preset = %preset.id,
            sample_rate = info.sample_rate,
            channels = info.channels,
            duration_secs = info.duration_secs,
            "Processing file"
        );

        let work_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let token = Uuid::new_v4().simple().to_string();
        let decoded_path = work_dir.join(format!("{stem}_{token}_work.wav"));
        let rendered_path = work_dir.join(format!("{stem}_{token}_spatial.wav"));
        let _scratch = ScratchFiles(vec![decoded_path.clone(), rendered_path.clone()]);

        let sample_rate = self.settings.sample_rate;
        self.try_transcode(input, &decoded_path, sample_rate, self.settings.channels, timeout)
            .await
            .map_err(EngineError::Transcode)?;

        self.counters.spatialize_calls.fetch_add(1, Ordering::Relaxed);
        let spatializer = self.spatializer.clone();
        let (decoded, rendered) = (decoded_path.clone(), rendered_path.clone());
        tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
            let audio = read_wav(&decoded)?;
            let channels = if audio.sample_rate != sample_rate {
                debug!(from = audio.sample_rate, to = sample_rate, "Resampling decoded audio");
                resample_channels(&audio.channels, audio.sample_rate, sample_rate)
            } else {
                audio.channels
            };
            let stereo = spatializer.spatialize(&channels, &preset);
            write_wav_16(&rendered, &AudioBuffer::new(sample_rate, stereo))?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("spatialize task failed: {e}")))??;

        self.try_encode(
            &rendered_path,
            output,
            self.settings.output_format,
            &self.settings.bitrate,
            timeout,
        )
        .await
        .map_err(EngineError::Encode)?;

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => {
                info!(output = %output.display(), size_bytes = meta.len(), "Processing complete");
                Ok(())
            }
            _ => Err(EngineError::MissingOutput),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            spatialize_calls: self.counters.spatialize_calls.load(Ordering::Relaxed),
            transcodes: self.counters.transcodes.load(Ordering::Relaxed),
            encodes: self.counters.encodes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            hrir_loaded: self.spatializer.has_hrir(),
        }
    }
}
