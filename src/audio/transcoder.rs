//! # External Transcoder Boundary
//!
//! Container/codec work (decode anything to PCM WAV, probe, final encode) is
//! delegated to `ffmpeg`/`ffprobe` subprocesses. Everything the engine needs
//! from them goes through the [`Transcoder`] trait so the DSP path can be
//! exercised without the binaries installed.
//!
//! ## Hard Timeouts:
//! Every subprocess runs under `tokio::time::timeout` with `kill_on_drop`, so
//! a timed-out child is killed when its future is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const STDERR_TAIL: usize = 500;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("unreadable probe output: {0}")]
    Probe(String),
}

/// Basic stream properties reported by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_secs: f64,
}

impl AudioInfo {
    /// Sentinel returned when a file cannot be probed.
    pub const UNKNOWN: AudioInfo = AudioInfo {
        sample_rate: 0,
        channels: 0,
        duration_secs: 0.0,
    };

    pub fn is_known(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }
}

/// Final output container/codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    Aac,
    Flac,
    Wav,
}

impl OutputFormat {
    /// Parse a configured format name; unknown names fall back to mp3.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "mp3" => Self::Mp3,
            "aac" | "m4a" => Self::Aac,
            "flac" => Self::Flac,
            "wav" => Self::Wav,
            other => {
                warn!(format = %other, "Unknown output format, using mp3");
                Self::Mp3
            }
        }
    }

    pub fn codec(&self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Wav => "pcm_s16le",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "m4a",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Aac => "audio/mp4",
            Self::Flac => "audio/flac",
            Self::Wav => "audio/wav",
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<AudioInfo, TranscodeError>;

    /// Decode `input` to 16-bit PCM WAV at the given rate and channel count.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
        timeout: Duration,
    ) -> Result<(), TranscodeError>;

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        bitrate: &str,
        timeout: Duration,
    ) -> Result<(), TranscodeError>;
}

/// `ffmpeg`/`ffprobe` subprocess implementation.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn run(
        &self,
        program: &Path,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TranscodeError> {
        let name = program.display().to_string();
        debug!(program = %name, args = ?args, "Running subprocess");

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(TranscodeError::Spawn {
                    program: name,
                    source,
                })
            }
            Err(_) => {
                error!(program = %name, timeout_secs = timeout.as_secs(), "Subprocess timed out");
                return Err(TranscodeError::Timeout {
                    program: name,
                    timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr_tail(&stderr);
            error!(program = %name, status = %output.status, stderr = %tail, "Subprocess failed");
            return Err(TranscodeError::Failed {
                program: name,
                status: output.status.to_string(),
                stderr: tail,
            });
        }

        Ok(output.stdout)
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL).collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Extract the first audio stream from `ffprobe -print_format json` output.
pub fn parse_probe_output(output: &[u8]) -> Result<AudioInfo, TranscodeError> {
    let probe: Value =
        serde_json::from_slice(output).map_err(|e| TranscodeError::Probe(e.to_string()))?;

    let stream = probe["streams"]
        .as_array()
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s["codec_type"].as_str() == Some("audio"))
        })
        .ok_or_else(|| TranscodeError::Probe("no audio stream".into()))?;

    let sample_rate = stream["sample_rate"]
        .as_str()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| TranscodeError::Probe("missing sample rate".into()))?;

    let channels = stream["channels"]
        .as_u64()
        .ok_or_else(|| TranscodeError::Probe("missing channel count".into()))? as u16;

    // Prefer the container duration; some codecs only report it per-stream.
    let duration_secs = probe["format"]["duration"]
        .as_str()
        .or_else(|| stream["duration"].as_str())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(AudioInfo {
        sample_rate,
        channels,
        duration_secs,
    })
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn probe(&self, path: &Path) -> Result<AudioInfo, TranscodeError> {
        let args = vec![
            "-v".into(),
            "quiet".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            "-show_streams".into(),
            path_arg(path),
        ];
        let stdout = self.run(&self.ffprobe, args, PROBE_TIMEOUT).await?;
        parse_probe_output(&stdout)
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        sample_rate: u32,
        channels: u16,
        timeout: Duration,
    ) -> Result<(), TranscodeError> {
        let args = vec![
            "-i".into(),
            path_arg(input),
            "-acodec".into(),
            "pcm_s16le".into(),
            "-ar".into(),
            sample_rate.to_string(),
            "-ac".into(),
            channels.to_string(),
            "-y".into(),
            path_arg(output),
        ];
        self.run(&self.ffmpeg, args, timeout).await.map(|_| ())
    }

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
        bitrate: &str,
        timeout: Duration,
    ) -> Result<(), TranscodeError> {
        let args = vec![
            "-i".into(),
            path_arg(input),
            "-codec:a".into(),
            format.codec().into(),
            "-b:a".into(),
            bitrate.into(),
            "-y".into(),
            path_arg(output),
        ];
        self.run(&self.ffmpeg, args, timeout).await.map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_table() {
        assert_eq!(OutputFormat::parse("mp3").codec(), "libmp3lame");
        assert_eq!(OutputFormat::parse("AAC").extension(), "m4a");
        assert_eq!(OutputFormat::parse("flac").codec(), "flac");
        assert_eq!(OutputFormat::parse("wav").codec(), "pcm_s16le");
        assert_eq!(OutputFormat::parse("ogg"), OutputFormat::Mp3);
    }

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "codec_name": "mjpeg"},
                {"codec_type": "audio", "sample_rate": "44100", "channels": 2, "duration": "12.5"}
            ],
            "format": {"duration": "12.480000"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channels, 2);
        assert!((info.duration_secs - 12.48).abs() < 1e-9);
        assert!(info.is_known());
    }

    #[test]
    fn test_parse_probe_output_without_audio() {
        let json = br#"{"streams": [{"codec_type": "video"}], "format": {}}"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(TranscodeError::Probe(_))
        ));
        assert!(parse_probe_output(b"not json").is_err());
        assert!(!AudioInfo::UNKNOWN.is_known());
    }

    #[test]
    fn test_stderr_is_truncated_to_tail() {
        let long = "x".repeat(1000) + "END";
        let tail = stderr_tail(&long);
        assert_eq!(tail.chars().count(), STDERR_TAIL);
        assert!(tail.ends_with("END"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let transcoder = FfmpegTranscoder::new(
            "/nonexistent/ffmpeg-binary",
            "/nonexistent/ffprobe-binary",
        );
        let result = transcoder
            .transcode(
                Path::new("in.mp3"),
                Path::new("out.wav"),
                48_000,
                2,
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(TranscodeError::Spawn { .. })));
    }
}
