//! Frequency-domain analysis engine: windowed FFT, magnitude in dBFS,
//! phase, and parabolic peak interpolation for a finer frequency estimate
//! than one FFT bin gives alone. The FFT planner is cached across calls
//! rather than re-planned every cycle.

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Rectangular,
    Hann,
    Hamming,
    BlackmanHarris,
}

fn window_coefficients(kind: WindowKind, n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![1.0; n];
    }
    let m = (n - 1) as f64;
    (0..n)
        .map(|i| {
            let x = i as f64 / m;
            let value = match kind {
                WindowKind::Rectangular => 1.0,
                WindowKind::Hann => 0.5 - 0.5 * (2.0 * std::f64::consts::PI * x).cos(),
                WindowKind::Hamming => 0.54 - 0.46 * (2.0 * std::f64::consts::PI * x).cos(),
                WindowKind::BlackmanHarris => {
                    0.35875 - 0.48829 * (2.0 * std::f64::consts::PI * x).cos()
                        + 0.14128 * (4.0 * std::f64::consts::PI * x).cos()
                        - 0.01168 * (6.0 * std::f64::consts::PI * x).cos()
                }
            };
            value as f32
        })
        .collect()
}

/// One bin's result: frequency in Hz, magnitude in dBFS (0 dBFS = a
/// full-scale sinusoid), and phase in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    pub frequency_hz: f64,
    pub magnitude_dbfs: f32,
    pub phase_rad: f32,
}

/// The result of one spectrum computation: all positive-frequency bins
/// plus the refined frequency/magnitude of the tallest peak.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub bins: Vec<Bin>,
    pub peak_frequency_hz: f64,
    pub peak_magnitude_dbfs: f32,
}

pub struct FftEngine {
    planner: FftPlanner<f32>,
    cached_len: usize,
    cached_fft: Option<Arc<dyn Fft<f32>>>,
}

impl Default for FftEngine {
    fn default() -> Self {
        FftEngine { planner: FftPlanner::new(), cached_len: 0, cached_fft: None }
    }
}

impl FftEngine {
    pub fn new() -> FftEngine {
        FftEngine::default()
    }

    fn fft_for_len(&mut self, len: usize) -> Arc<dyn Fft<f32>> {
        if self.cached_len != len || self.cached_fft.is_none() {
            self.cached_fft = Some(self.planner.plan_fft_forward(len));
            self.cached_len = len;
        }
        self.cached_fft.clone().unwrap()
    }

    /// Windows, forward-transforms, and converts `samples` to a one-sided
    /// spectrum. `full_scale_v` is the channel's full-scale range, used so
    /// magnitude is reported relative to a full-scale sinusoid (0 dBFS).
    pub fn compute_spectrum(&mut self, samples: &[f32], sample_rate_hz: f64, window: WindowKind, full_scale_v: f32) -> Spectrum {
        let n = samples.len();
        if n == 0 {
            return Spectrum { bins: Vec::new(), peak_frequency_hz: 0.0, peak_magnitude_dbfs: f32::NEG_INFINITY };
        }
        let coeffs = window_coefficients(window, n);
        let coherent_gain: f32 = coeffs.iter().sum::<f32>() / n as f32;

        let mut buffer: Vec<Complex32> = samples
            .iter()
            .zip(coeffs.iter())
            .map(|(s, w)| Complex32::new(s * w, 0.0))
            .collect();

        let fft = self.fft_for_len(n);
        fft.process(&mut buffer);

        let half = n / 2 + 1;
        let full_scale_amplitude = (full_scale_v / 2.0).max(f32::EPSILON);
        let mut bins = Vec::with_capacity(half);
        for (k, value) in buffer.iter().take(half).enumerate() {
            let amplitude = value.norm() / (n as f32 * coherent_gain.max(f32::EPSILON));
            let normalized = (amplitude / full_scale_amplitude).max(1e-12);
            let magnitude_dbfs = 20.0 * normalized.log10();
            bins.push(Bin {
                frequency_hz: k as f64 * sample_rate_hz / n as f64,
                magnitude_dbfs,
                phase_rad: value.arg(),
            });
        }

        let (peak_frequency_hz, peak_magnitude_dbfs) = interpolate_peak(&bins, sample_rate_hz / n as f64);
        Spectrum { bins, peak_frequency_hz, peak_magnitude_dbfs }
    }
}

/// Refines the tallest bin's frequency estimate with parabolic (quadratic)
/// interpolation across it and its two neighbors, giving sub-bin
/// resolution without a longer FFT.
fn interpolate_peak(bins: &[Bin], bin_width_hz: f64) -> (f64, f32) {
    if bins.is_empty() {
        return (0.0, f32::NEG_INFINITY);
    }
    let (peak_idx, peak_bin) = bins
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.magnitude_dbfs.partial_cmp(&b.1.magnitude_dbfs).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap();

    if peak_idx == 0 || peak_idx == bins.len() - 1 {
        return (peak_bin.frequency_hz, peak_bin.magnitude_dbfs);
    }
    let y_left = bins[peak_idx - 1].magnitude_dbfs as f64;
    let y_center = peak_bin.magnitude_dbfs as f64;
    let y_right = bins[peak_idx + 1].magnitude_dbfs as f64;
    let denom = y_left - 2.0 * y_center + y_right;
    if denom.abs() < 1e-9 {
        return (peak_bin.frequency_hz, peak_bin.magnitude_dbfs);
    }
    let delta = 0.5 * (y_left - y_right) / denom;
    let refined_freq = peak_bin.frequency_hz + delta * bin_width_hz;
    let refined_mag = y_center - 0.25 * (y_left - y_right) * delta;
    (refined_freq, refined_mag as f32)
}

#[cfg(test)]
mod test {
    use super::*;

    fn tone(freq_hz: f64, sample_rate_hz: f64, n: usize, amplitude: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amplitude * (2.0 * std::f64::consts::PI * freq_hz * i as f64 / sample_rate_hz).sin() as f32)
            .collect()
    }

    #[test]
    fn test_empty_input_yields_empty_spectrum() {
        let mut engine = FftEngine::new();
        let spectrum = engine.compute_spectrum(&[], 1.0e9, WindowKind::Hann, 1.0);
        assert!(spectrum.bins.is_empty());
    }

    #[test]
    fn test_peak_frequency_near_injected_tone() {
        let mut engine = FftEngine::new();
        let sample_rate_hz = 1.0e9;
        let samples = tone(50.0e6, sample_rate_hz, 1024, 0.9);
        let spectrum = engine.compute_spectrum(&samples, sample_rate_hz, WindowKind::Hann, 1.0);
        assert!((spectrum.peak_frequency_hz - 50.0e6).abs() < sample_rate_hz / 1024.0);
    }

    #[test]
    fn test_full_scale_tone_is_near_zero_dbfs() {
        let mut engine = FftEngine::new();
        let sample_rate_hz = 1.0e9;
        let samples = tone(10.0e6, sample_rate_hz, 2048, 1.0);
        let spectrum = engine.compute_spectrum(&samples, sample_rate_hz, WindowKind::BlackmanHarris, 2.0);
        assert!(spectrum.peak_magnitude_dbfs < 1.0 && spectrum.peak_magnitude_dbfs > -6.0);
    }

    #[test]
    fn test_window_coefficients_edges_taper_for_hann() {
        let w = window_coefficients(WindowKind::Hann, 16);
        assert!(w[0] < 0.01);
        assert!(w[8] > 0.9);
    }
}
