//! Analytic signal and instantaneous frequency
//!
//! Block-oriented helpers used by the spread-spectrum decoder to recover the
//! FM trajectory of a dwell window:
//!
//! ```text
//! real window ─FFT─► zero negative bins, double positive ─IFFT─► z[n]
//!     z[n] ─arg─► unwrap ─diff × fs/2π─► f_inst[n]
//!     f_inst[n] − f_c ─Hann, zero-pad, FFT─► peak ─parabolic─► f_m
//! ```
//!
//! The FFT-based Hilbert transform is exact for periodic input and leaks
//! near the window edges otherwise, so callers trim a margin before using the
//! results.

use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Analytic signal of a real block: `re` is the input, `im` its Hilbert transform.
pub fn analytic_signal(input: &[f64]) -> Vec<Complex64> {
    let n = input.len();
    if n == 0 {
        return Vec::new();
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let mut spectrum: Vec<Complex64> = input.iter().map(|&x| Complex64::new(x, 0.0)).collect();
    fft.process(&mut spectrum);

    // DC (and Nyquist for even n) keep unit weight, positive bins double.
    let half = n / 2;
    for (k, bin) in spectrum.iter_mut().enumerate() {
        let weight = if k == 0 || (n % 2 == 0 && k == half) {
            1.0
        } else if k <= (n - 1) / 2 {
            2.0
        } else {
            0.0
        };
        *bin *= weight;
    }

    ifft.process(&mut spectrum);
    let scale = 1.0 / n as f64;
    spectrum.iter_mut().for_each(|z| *z *= scale);
    spectrum
}

/// Remove 2π jumps from a wrapped phase sequence.
pub fn unwrap_phase(phases: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phases.len());
    let mut correction = 0.0;
    let mut prev: Option<f64> = None;
    for &p in phases {
        if let Some(last) = prev {
            let diff = p - last;
            if diff > PI {
                correction -= 2.0 * PI;
            } else if diff < -PI {
                correction += 2.0 * PI;
            }
        }
        prev = Some(p);
        out.push(p + correction);
    }
    out
}

/// Instantaneous frequency in Hz from the unwrapped phase of `signal`.
///
/// Entry `n` is the forward difference between samples `n` and `n + 1`, so
/// the output is one shorter than the input.
pub fn instantaneous_frequency(signal: &[Complex64], sample_rate: f64) -> Vec<f64> {
    if signal.len() < 2 {
        return Vec::new();
    }
    let phases: Vec<f64> = signal.iter().map(|z| z.arg()).collect();
    let unwrapped = unwrap_phase(&phases);
    let scale = sample_rate / (2.0 * PI);
    unwrapped.windows(2).map(|w| (w[1] - w[0]) * scale).collect()
}

/// Wrap an angle into `(-π, π]`.
pub fn wrap_phase(phase: f64) -> f64 {
    let wrapped = (phase + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Estimate the dominant frequency of a real sequence.
///
/// The mean is removed, a Hann window applied, and the block zero-padded to
/// at least `8 × len` (power of two) before the FFT. The strongest non-DC bin
/// is refined by parabolic interpolation on the magnitude.
/// Returns `None` for blocks shorter than four samples or with no AC energy.
pub fn dominant_frequency(input: &[f64], sample_rate: f64) -> Option<f64> {
    let n = input.len();
    if n < 4 {
        return None;
    }

    let mean = input.iter().sum::<f64>() / n as f64;
    let fft_len = (n * 8).next_power_of_two();
    let mut buffer = vec![Complex64::new(0.0, 0.0); fft_len];
    for (i, (&x, slot)) in input.iter().zip(buffer.iter_mut()).enumerate() {
        let w = 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos());
        *slot = Complex64::new((x - mean) * w, 0.0);
    }

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(fft_len).process(&mut buffer);

    let half = fft_len / 2;
    let mags: Vec<f64> = buffer[..=half].iter().map(|c| c.norm()).collect();
    let (peak, peak_mag) = mags
        .iter()
        .enumerate()
        .skip(1)
        .fold((0, 0.0), |best, (i, &m)| if m > best.1 { (i, m) } else { best });
    if peak == 0 || peak_mag <= f64::EPSILON {
        return None;
    }

    let offset = if peak + 1 < mags.len() {
        let (a, b, c) = (mags[peak - 1], mags[peak], mags[peak + 1]);
        let denom = a - 2.0 * b + c;
        if denom.abs() > f64::EPSILON {
            (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        }
    } else {
        0.0
    };

    Some((peak as f64 + offset) * sample_rate / fft_len as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| (2.0 * PI * freq * i as f64 / fs).cos()).collect()
    }

    #[test]
    fn test_analytic_of_bin_centered_cosine() {
        // 10 full cycles in 400 samples: the transform is exact.
        let x = tone(1000.0, 40_000.0, 400);
        let z = analytic_signal(&x);
        for (i, s) in z.iter().enumerate() {
            let phase = 2.0 * PI * 1000.0 * i as f64 / 40_000.0;
            assert_relative_eq!(s.re, phase.cos(), epsilon = 1e-9);
            assert_relative_eq!(s.im, phase.sin(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_analytic_magnitude_off_bin() {
        let x = tone(1234.5, 48_000.0, 1000);
        let z = analytic_signal(&x);
        for s in &z[100..900] {
            assert!((s.norm() - 1.0).abs() < 0.05, "magnitude {}", s.norm());
        }
    }

    #[test]
    fn test_unwrap() {
        let wrapped = vec![0.0, 1.0, 2.0, 3.0, -3.0, -2.0, -1.0, 0.0];
        let unwrapped = unwrap_phase(&wrapped);
        for w in unwrapped.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn test_instantaneous_frequency_of_tone() {
        let fs = 48_000.0;
        let z: Vec<Complex64> = (0..256)
            .map(|i| Complex64::from_polar(1.0, 2.0 * PI * 3000.0 * i as f64 / fs))
            .collect();
        let f = instantaneous_frequency(&z, fs);
        assert_eq!(f.len(), 255);
        for v in f {
            assert_relative_eq!(v, 3000.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_wrap_phase() {
        assert_relative_eq!(wrap_phase(2.5 * PI), 0.5 * PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_phase(-PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_phase(2.0 * PI + 0.25), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_dominant_frequency() {
        let fs = 192_000.0;
        let x: Vec<f64> = (0..1500)
            .map(|i| 7.0 + (2.0 * PI * 1730.0 * i as f64 / fs).sin())
            .collect();
        let f = dominant_frequency(&x, fs).unwrap();
        assert!((f - 1730.0).abs() < 10.0, "estimated {f}");
    }

    #[test]
    fn test_dominant_frequency_flat_input() {
        assert_eq!(dominant_frequency(&[2.0; 64], 1000.0), None);
        assert_eq!(dominant_frequency(&[1.0, 2.0], 1000.0), None);
    }
}
