//! Linear-interpolation sample-rate conversion.
//!
//! Output length is `round(len * to / from)`, so duration is preserved to
//! within one output sample.

pub fn resample_linear(samples: &[f64], from_rate: u32, to_rate: u32) -> Vec<f64> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) * to_rate as f64 / from_rate as f64).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = pos - idx as f64;
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        })
        .collect()
}

/// Resample every channel independently.
pub fn resample_channels(channels: &[Vec<f64>], from_rate: u32, to_rate: u32) -> Vec<Vec<f64>> {
    channels
        .iter()
        .map(|ch| resample_linear(ch, from_rate, to_rate))
        .collect()
}
