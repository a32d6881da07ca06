//! # Biquad Filters
//!
//! Second-order IIR sections used by the EQ stage and the loudness meter.
//!
//! ## Designs:
//! - **Peaking (bell)**: RBJ analog prototype mapped with the bilinear
//!   transform, `w0 = 2*pi*f/sr`, `alpha = sin(w0)/(2Q)`, `A = 10^(gain/40)`
//! - **High-pass**: 2nd-order Butterworth (Q = 1/sqrt(2)), used for the
//!   75 Hz loudness pre-filter
//!
//! Filtering runs in transposed direct form II over `f64` samples.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use crate::audio::presets::EqBand;

/// Normalized biquad coefficients (`a0 == 1`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    fn normalized(b: [f64; 3], a: [f64; 3]) -> Self {
        let a0 = a[0];
        Self {
            b0: b[0] / a0,
            b1: b[1] / a0,
            b2: b[2] / a0,
            a1: a[1] / a0,
            a2: a[2] / a0,
        }
    }

    /// Peaking EQ section. Returns `None` for a 0 dB band or parameters that
    /// would not produce a finite filter.
    pub fn peaking(frequency: f64, gain_db: f64, q_factor: f64, sample_rate: f64) -> Option<Self> {
        if gain_db == 0.0 || frequency <= 0.0 || q_factor <= 0.0 || sample_rate <= 0.0 {
            return None;
        }

        let w0 = 2.0 * PI * frequency / sample_rate;
        let alpha = w0.sin() / (2.0 * q_factor);
        let a = 10f64.powf(gain_db / 40.0);
        let cos_w0 = w0.cos();

        let coeffs = Self::normalized(
            [1.0 + alpha * a, -2.0 * cos_w0, 1.0 - alpha * a],
            [1.0 + alpha / a, -2.0 * cos_w0, 1.0 - alpha / a],
        );
        coeffs.is_finite().then_some(coeffs)
    }

    /// 2nd-order Butterworth high-pass.
    pub fn highpass(cutoff: f64, sample_rate: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let alpha = w0.sin() / (2.0 * FRAC_1_SQRT_2);
        let cos_w0 = w0.cos();

        Self::normalized(
            [(1.0 + cos_w0) / 2.0, -(1.0 + cos_w0), (1.0 + cos_w0) / 2.0],
            [1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha],
        )
    }

    fn is_finite(&self) -> bool {
        [self.b0, self.b1, self.b2, self.a1, self.a2]
            .iter()
            .all(|c| c.is_finite())
    }

    /// Filter `samples` in place, starting from zero state.
    pub fn process(&self, samples: &mut [f64]) {
        let mut z1 = 0.0;
        let mut z2 = 0.0;

        for sample in samples.iter_mut() {
            let x = *sample;
            let y = self.b0 * x + z1;
            z1 = self.b1 * x - self.a1 * y + z2;
            z2 = self.b2 * x - self.a2 * y;
            *sample = y;
        }
    }
}

/// Apply the EQ bands in order as a cascade of peaking filters.
///
/// Zero-gain bands are skipped, so an all-flat curve leaves the buffer
/// untouched. Returns the number of sections actually applied.
pub fn apply_eq(samples: &mut [f64], sample_rate: f64, bands: &[EqBand]) -> usize {
    let mut applied = 0;
    for band in bands {
        if let Some(section) = Biquad::peaking(band.frequency, band.gain, band.q_factor, sample_rate) {
            section.process(samples);
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f64 = 48_000.0;

    fn sine(freq: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f64 / SR).sin())
            .collect()
    }

    fn rms(samples: &[f64]) -> f64 {
        (samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64).sqrt()
    }

    #[test]
    fn test_zero_gain_band_is_skipped() {
        assert!(Biquad::peaking(1000.0, 0.0, 0.7, SR).is_none());

        let original = sine(440.0, 4800);
        let mut filtered = original.clone();
        let bands = vec![EqBand::new(1000.0, 0.0, 0.7), EqBand::new(63.0, 0.0, 0.7)];
        assert_eq!(apply_eq(&mut filtered, SR, &bands), 0);
        assert_eq!(filtered, original);
    }

    #[test]
    fn test_peaking_boost_at_centre_frequency() {
        let section = Biquad::peaking(1000.0, 6.0, 0.7, SR).unwrap();
        let mut tone = sine(1000.0, 48_000);
        let before = rms(&tone[24_000..]);
        section.process(&mut tone);
        let after = rms(&tone[24_000..]);

        let gain_db = 20.0 * (after / before).log10();
        assert!((gain_db - 6.0).abs() < 0.3, "gain was {gain_db}");
    }

    #[test]
    fn test_peaking_leaves_distant_frequencies_alone() {
        let section = Biquad::peaking(8000.0, 6.0, 0.7, SR).unwrap();
        let mut tone = sine(100.0, 48_000);
        let before = rms(&tone[24_000..]);
        section.process(&mut tone);
        let after = rms(&tone[24_000..]);

        let gain_db = 20.0 * (after / before).log10();
        assert!(gain_db.abs() < 0.5, "gain was {gain_db}");
    }

    #[test]
    fn test_highpass_attenuates_low_frequencies() {
        let section = Biquad::highpass(75.0, SR);

        let mut low = sine(20.0, 96_000);
        let low_before = rms(&low[48_000..]);
        section.process(&mut low);
        let low_after = rms(&low[48_000..]);

        let mut high = sine(1000.0, 96_000);
        let high_before = rms(&high[48_000..]);
        section.process(&mut high);
        let high_after = rms(&high[48_000..]);

        assert!(low_after / low_before < 0.1);
        assert!((high_after / high_before - 1.0).abs() < 0.01);
    }
}
