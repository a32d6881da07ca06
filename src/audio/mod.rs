//! # Audio Processing Module
//!
//! Offline spatialization of uploaded audio files into binaural stereo.
//!
//! ## Key Components:
//! - **Presets**: Fixed catalog of named EQ/geometry/loudness settings
//! - **Filters / Convolve / Loudness / Resample**: Pure DSP building blocks
//! - **WAV I/O**: Intermediate PCM files
//! - **Transcoder**: ffmpeg/ffprobe subprocess boundary
//! - **Engine**: The full file pipeline and its counters
//!
//! ## Working Format:
//! - **Sample Rate**: 48 kHz by default
//! - **Channels**: Stereo output regardless of input layout
//! - **Intermediates**: 16-bit PCM WAV

pub mod convolve;
pub mod engine;
pub mod filters;
pub mod loudness;
pub mod presets;
pub mod resample;
pub mod transcoder;
pub mod wavio;

pub use engine::{EngineError, EngineSettings, HrirPair, SpatialEngine};
pub use presets::PresetCatalog;
pub use transcoder::{FfmpegTranscoder, OutputFormat};
