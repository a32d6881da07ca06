//! # Loudness Normalization
//!
//! Approximate integrated-loudness correction. This is **not** a certified
//! ITU-R BS.1770 meter: there is no K-weighting shelf and no gating. The
//! measurement is a 75 Hz high-passed mean square per channel:
//!
//! ```text
//! L_ch = -0.691 + 10 * log10(mean(hp(x)^2) + 1e-10)
//! L    = mean(L_ch)
//! gain = 10^((target - L) / 20)
//! y    = tanh(x * gain)
//! ```
//!
//! The `tanh` stage soft-saturates instead of hard clipping when the gain
//! pushes peaks past full scale.

use crate::audio::filters::Biquad;

/// High-pass cutoff applied before measuring.
pub const MEASUREMENT_HIGHPASS_HZ: f64 = 75.0;

const LOUDNESS_OFFSET: f64 = -0.691;
const SILENCE_FLOOR: f64 = 1e-10;

/// Estimated loudness of a single channel (approximate LUFS).
pub fn channel_loudness(samples: &[f64], sample_rate: f64) -> f64 {
    if samples.is_empty() {
        return LOUDNESS_OFFSET + 10.0 * SILENCE_FLOOR.log10();
    }

    let mut filtered = samples.to_vec();
    Biquad::highpass(MEASUREMENT_HIGHPASS_HZ, sample_rate).process(&mut filtered);

    let mean_square = filtered.iter().map(|s| s * s).sum::<f64>() / filtered.len() as f64;
    LOUDNESS_OFFSET + 10.0 * (mean_square + SILENCE_FLOOR).log10()
}

/// Loudness averaged across channels.
pub fn measure(channels: &[Vec<f64>], sample_rate: f64) -> f64 {
    if channels.is_empty() {
        return LOUDNESS_OFFSET + 10.0 * SILENCE_FLOOR.log10();
    }
    channels
        .iter()
        .map(|ch| channel_loudness(ch, sample_rate))
        .sum::<f64>()
        / channels.len() as f64
}

/// Normalize all channels toward `target_lufs` with a shared gain, then
/// soft-saturate. Returns the linear gain that was applied.
pub fn normalize(channels: &mut [Vec<f64>], sample_rate: f64, target_lufs: f64) -> f64 {
    let current = measure(channels, sample_rate);
    let gain = 10f64.powf((target_lufs - current) / 20.0);

    for channel in channels.iter_mut() {
        for sample in channel.iter_mut() {
            *sample = (*sample * gain).tanh();
        }
    }
    gain
}
