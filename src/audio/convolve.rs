//! # FFT Convolution
//!
//! Linear convolution via zero-padded FFTs. The binaural renderer uses the
//! "same" variant: the full `N + M - 1` result is cropped around its centre to
//! the input length `N`, so the output stays sample-aligned with the input.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Full linear convolution, length `signal.len() + kernel.len() - 1`.
pub fn convolve_full(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    if signal.is_empty() || kernel.is_empty() {
        return Vec::new();
    }

    let full_len = signal.len() + kernel.len() - 1;
    let fft_len = full_len.next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(fft_len);
    let inverse = planner.plan_fft_inverse(fft_len);

    let mut a = zero_padded(signal, fft_len);
    let mut b = zero_padded(kernel, fft_len);
    forward.process(&mut a);
    forward.process(&mut b);

    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x *= *y;
    }
    inverse.process(&mut a);

    // rustfft leaves the inverse unnormalized
    let scale = 1.0 / fft_len as f64;
    a.iter().take(full_len).map(|c| c.re * scale).collect()
}

/// Convolution cropped to `signal.len()` samples, centred the same way as
/// `scipy.signal.fftconvolve(..., mode="same")`.
pub fn convolve_same(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    if signal.is_empty() {
        return Vec::new();
    }
    if kernel.is_empty() {
        return vec![0.0; signal.len()];
    }

    let full = convolve_full(signal, kernel);
    let start = (kernel.len() - 1) / 2;
    full[start..start + signal.len()].to_vec()
}

fn zero_padded(samples: &[f64], len: usize) -> Vec<Complex<f64>> {
    let mut out = vec![Complex::new(0.0, 0.0); len];
    for (slot, &s) in out.iter_mut().zip(samples) {
        slot.re = s;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; signal.len() + kernel.len() - 1];
        for (i, &x) in signal.iter().enumerate() {
            for (j, &h) in kernel.iter().enumerate() {
                out[i + j] += x * h;
            }
        }
        out
    }

    #[test]
    fn test_full_matches_direct_convolution() {
        let signal = [1.0, -2.0, 3.0, 0.5, 0.25, -1.0, 2.0];
        let kernel = [0.5, 0.25, -0.125];
        let fast = convolve_full(&signal, &kernel);
        let slow = direct(&signal, &kernel);

        assert_eq!(fast.len(), signal.len() + kernel.len() - 1);
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_same_mode_preserves_length_and_alignment() {
        let signal: Vec<f64> = (0..100).map(|i| (i as f64 * 0.1).sin()).collect();

        // A centred unit impulse is the identity in "same" mode.
        let kernel = [0.0, 0.0, 1.0, 0.0, 0.0];
        let out = convolve_same(&signal, &kernel);
        assert_eq!(out.len(), signal.len());
        for (a, b) in out.iter().zip(signal.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_same_mode_with_even_kernel() {
        let signal = [1.0, 2.0, 3.0, 4.0];
        let kernel = [1.0, 1.0];
        // full = [1, 3, 5, 7, 4]; start = (2 - 1) / 2 = 0
        let out = convolve_same(&signal, &kernel);
        let expected = [1.0, 3.0, 5.0, 7.0];
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_empty_inputs() {
        assert!(convolve_full(&[], &[1.0]).is_empty());
        assert!(convolve_same(&[], &[1.0]).is_empty());
        assert_eq!(convolve_same(&[1.0, 2.0], &[]), vec![0.0, 0.0]);
    }
}
