//! Per-channel FIR calibration bank.
//!
//! A flatness correction filter is designed once per channel from a
//! captured 10 MHz square wave (the board's internal calibration tone)
//! and then applied zero-phase to every subsequent acquisition on that
//! channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ConfigKind, Error, Result};

/// Calibration tone frequency the design routine expects in the input
/// capture.
pub const CALIBRATION_TONE_HZ: f64 = 10.0e6;

/// Odd tap count keeps the designed kernel's group delay an exact integer
/// number of samples, which is what makes the forward/backward zero-phase
/// application exact rather than approximate.
pub const DEFAULT_NUM_TAPS: usize = 65;

/// Whether a channel's filter came from the factory default (flat,
/// identity) or was measured against a real calibration capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirSource {
    Factory,
    Measured,
}

/// One channel's designed correction kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirCalibration {
    pub sample_rate_hz: f64,
    pub taps: Vec<f32>,
    pub source: FirSource,
}

impl FirCalibration {
    fn identity(sample_rate_hz: f64) -> FirCalibration {
        FirCalibration { sample_rate_hz, taps: vec![1.0], source: FirSource::Factory }
    }
}

/// The full set of per-channel kernels persisted alongside the rest of
/// the `StateStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FirBank {
    pub per_channel: HashMap<usize, FirCalibration>,
}

impl FirBank {
    pub fn identity(num_channels: usize, sample_rate_hz: f64) -> FirBank {
        let per_channel = (0..num_channels)
            .map(|c| (c, FirCalibration::identity(sample_rate_hz)))
            .collect();
        FirBank { per_channel }
    }

    /// Validates that a loaded/applied calibration's sample rate matches
    /// the live base rate within 0.1%.
    pub fn check_sample_rate(expected_hz: f64, found_hz: f64) -> Result<()> {
        if found_hz <= 0.0 || expected_hz <= 0.0 {
            return Err(Error::InvalidConfig {
                kind: ConfigKind::SampleRate,
                detail: "sample rate must be positive".to_string(),
            });
        }
        let relative_error = ((found_hz - expected_hz) / expected_hz).abs();
        if relative_error > 0.001 {
            return Err(Error::FirSampleRateMismatch { expected_hz, found_hz });
        }
        Ok(())
    }

    /// Designs a correction kernel for `channel` from a captured square
    /// wave at [`CALIBRATION_TONE_HZ`], and installs it. The square wave's
    /// rising-edge width tells us the channel's effective bandwidth; the
    /// kernel is a windowed-sinc filter whose cutoff compensates for that
    /// measured roll-off rather than imposing a fixed one.
    pub fn design_from_square_wave(
        &mut self,
        channel: usize,
        samples: &[f32],
        sample_rate_hz: f64,
    ) -> Result<()> {
        if let Some(existing) = self.per_channel.values().next() {
            Self::check_sample_rate(existing.sample_rate_hz, sample_rate_hz)?;
        }
        let rise_samples = estimate_rise_time_samples(samples, sample_rate_hz)?;
        let cutoff_hz = (0.35 * sample_rate_hz) / rise_samples.max(1.0);
        let taps = design_correction_kernel(cutoff_hz, sample_rate_hz, DEFAULT_NUM_TAPS);
        self.per_channel.insert(
            channel,
            FirCalibration { sample_rate_hz, taps, source: FirSource::Measured },
        );
        Ok(())
    }

    /// Applies `channel`'s kernel with zero phase: one forward convolution
    /// followed by one convolution of the time-reversed result, which
    /// cancels the linear phase of a symmetric odd-length kernel exactly
    /// (forward and backward group delays are equal and opposite).
    pub fn apply_zero_phase(&self, channel: usize, samples: &[f32]) -> Vec<f32> {
        let Some(calibration) = self.per_channel.get(&channel) else {
            return samples.to_vec();
        };
        if calibration.taps.len() <= 1 {
            return samples.to_vec();
        }
        let forward = convolve_same(samples, &calibration.taps);
        let mut reversed = forward;
        reversed.reverse();
        let mut result = convolve_same(&reversed, &calibration.taps);
        result.reverse();
        result
    }
}

/// Finds the first rising transition crossing the midpoint between the
/// capture's min and max, and measures its 10%-90% width in samples.
fn estimate_rise_time_samples(samples: &[f32], _sample_rate_hz: f64) -> Result<f32> {
    if samples.len() < 4 {
        return Err(Error::InsufficientData);
    }
    let min = samples.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = samples.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return Err(Error::InsufficientData);
    }
    let low = min + 0.1 * (max - min);
    let high = min + 0.9 * (max - min);

    let low_crossing = samples.windows(2).position(|w| w[0] <= low && w[1] > low);
    let Some(low_idx) = low_crossing else { return Err(Error::InsufficientData) };
    let high_crossing = samples[low_idx..].windows(2).position(|w| w[0] <= high && w[1] > high);
    let Some(high_idx) = high_crossing else { return Err(Error::InsufficientData) };

    Ok((high_idx.max(1)) as f32)
}

/// Windowed-sinc lowpass kernel, Hamming-windowed: a simple,
/// well-understood window where a Kaiser design's extra beta parameter
/// isn't needed.
fn design_correction_kernel(cutoff_hz: f64, sample_rate_hz: f64, num_taps: usize) -> Vec<f32> {
    let normalized_cutoff = (cutoff_hz / (sample_rate_hz / 2.0)).clamp(0.01, 0.99);
    let m = num_taps / 2;
    let mut taps = vec![0.0f32; num_taps];
    let mut sum = 0.0f64;
    for i in 0..num_taps {
        let n = i as isize - m as isize;
        let sinc = if n == 0 {
            normalized_cutoff
        } else {
            (std::f64::consts::PI * normalized_cutoff * n as f64).sin() / (std::f64::consts::PI * n as f64)
        };
        let window = 0.54 - 0.46 * (2.0 * std::f64::consts::PI * i as f64 / (num_taps - 1) as f64).cos();
        let value = sinc * window;
        taps[i] = value as f32;
        sum += value;
    }
    if sum.abs() > 1e-12 {
        for t in taps.iter_mut() {
            *t = (*t as f64 / sum) as f32;
        }
    }
    taps
}

/// Same-length convolution with zero-padded edges.
fn convolve_same(samples: &[f32], taps: &[f32]) -> Vec<f32> {
    let half = (taps.len() / 2) as isize;
    let mut out = vec![0.0f32; samples.len()];
    for (i, slot) in out.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for (k, tap) in taps.iter().enumerate() {
            let j = i as isize + half - k as isize;
            if j >= 0 && (j as usize) < samples.len() {
                acc += tap * samples[j as usize];
            }
        }
        *slot = acc;
    }
    out
}
