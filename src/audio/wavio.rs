//! WAV file I/O for the engine's intermediate files.
//!
//! Samples are held planar (`channels[ch][frame]`) as `f64` in [-1, 1].
//! Output is always 16-bit integer PCM.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

/// Planar, decoded audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f64>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f64>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Decode any integer or float PCM WAV into planar `f64`.
pub fn read_wav(path: &Path) -> hound::Result<AudioBuffer> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channel_count = spec.channels.max(1) as usize;

    let interleaved: Vec<f64> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect::<hound::Result<_>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f64;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f64 / scale))
                .collect::<hound::Result<_>>()?
        }
    };

    let frames = interleaved.len() / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for frame in interleaved.chunks_exact(channel_count) {
        for (ch, &sample) in frame.iter().enumerate() {
            channels[ch].push(sample);
        }
    }

    Ok(AudioBuffer::new(spec.sample_rate, channels))
}

/// Write 16-bit PCM. Samples outside [-1, 1] are clamped.
pub fn write_wav_16(path: &Path, audio: &AudioBuffer) -> hound::Result<()> {
    let spec = WavSpec {
        channels: audio.channel_count().max(1) as u16,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for frame in 0..audio.frames() {
        for channel in &audio.channels {
            let sample = channel.get(frame).copied().unwrap_or(0.0);
            writer.write_sample(to_i16(sample))?;
        }
    }
    writer.finalize()
}

fn to_i16(sample: f64) -> i16 {
    let clamped = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
    (clamped * i16::MAX as f64).round() as i16
}
