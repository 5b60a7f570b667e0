//! Scalar waveform measurements: amplitude statistics and timing
//! measurements derived from edge crossings.

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmplitudeStats {
    pub vpp: f32,
    pub vrms: f32,
    pub vmean: f32,
}

pub fn amplitude_stats(samples: &[f32]) -> Result<AmplitudeStats> {
    if samples.is_empty() {
        return Err(Error::InsufficientData);
    }
    let min = samples.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = samples.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum: f64 = samples.iter().map(|&v| v as f64).sum();
    let mean = (sum / samples.len() as f64) as f32;
    let sum_sq: f64 = samples.iter().map(|&v| (v as f64) * (v as f64)).sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    Ok(AmplitudeStats { vpp: max - min, vrms: rms, vmean: mean })
}

/// Indices (as fractional sample positions) where `samples` crosses
/// `threshold` going up (rising) — linear interpolation between the
/// bracketing samples gives sub-sample precision.
fn rising_crossings(samples: &[f32], threshold: f32) -> Vec<f64> {
    let mut crossings = Vec::new();
    for i in 1..samples.len() {
        let (prev, cur) = (samples[i - 1], samples[i]);
        if prev < threshold && cur >= threshold {
            let frac = (threshold - prev) as f64 / (cur - prev) as f64;
            crossings.push((i - 1) as f64 + frac);
        }
    }
    crossings
}

fn falling_crossings(samples: &[f32], threshold: f32) -> Vec<f64> {
    let mut crossings = Vec::new();
    for i in 1..samples.len() {
        let (prev, cur) = (samples[i - 1], samples[i]);
        if prev > threshold && cur <= threshold {
            let frac = (prev - threshold) as f64 / (prev - cur) as f64;
            crossings.push((i - 1) as f64 + frac);
        }
    }
    crossings
}

/// Frequency from the median period between consecutive rising-edge
/// crossings at the waveform's midpoint. Needs at least two rising
/// edges; otherwise [`Error::InsufficientData`].
pub fn frequency_hz(samples: &[f32], sample_rate_hz: f64) -> Result<f64> {
    let stats = amplitude_stats(samples)?;
    let threshold = stats.vmean;
    let crossings = rising_crossings(samples, threshold);
    if crossings.len() < 2 {
        return Err(Error::InsufficientData);
    }
    let mut periods: Vec<f64> = crossings.windows(2).map(|w| w[1] - w[0]).collect();
    periods.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median_period_samples = periods[periods.len() / 2];
    if median_period_samples <= 0.0 {
        return Err(Error::InsufficientData);
    }
    Ok(sample_rate_hz / median_period_samples)
}

/// Duty cycle: fraction of one median period spent above the waveform's
/// midpoint, computed from the first full rising-to-rising span.
pub fn duty_cycle(samples: &[f32]) -> Result<f64> {
    let stats = amplitude_stats(samples)?;
    let threshold = stats.vmean;
    let rising = rising_crossings(samples, threshold);
    let falling = falling_crossings(samples, threshold);
    if rising.len() < 2 || falling.is_empty() {
        return Err(Error::InsufficientData);
    }
    let period = rising[1] - rising[0];
    if period <= 0.0 {
        return Err(Error::InsufficientData);
    }
    let high_start = rising[0];
    let Some(&high_end) = falling.iter().find(|&&f| f > high_start) else {
        return Err(Error::InsufficientData);
    };
    Ok(((high_end - high_start) / period).clamp(0.0, 1.0))
}

/// 10%-90% rise time of the first qualifying rising edge, in seconds.
pub fn rise_time_s(samples: &[f32], sample_rate_hz: f64) -> Result<f64> {
    edge_time_s(samples, sample_rate_hz, true)
}

/// 90%-10% fall time of the first qualifying falling edge, in seconds.
pub fn fall_time_s(samples: &[f32], sample_rate_hz: f64) -> Result<f64> {
    edge_time_s(samples, sample_rate_hz, false)
}

fn edge_time_s(samples: &[f32], sample_rate_hz: f64, rising: bool) -> Result<f64> {
    let stats = amplitude_stats(samples)?;
    let low = stats.vmean - 0.4 * stats.vpp.max(f32::EPSILON);
    let high = stats.vmean + 0.4 * stats.vpp.max(f32::EPSILON);
    let (first_threshold, second_threshold) = if rising { (low, high) } else { (high, low) };

    let first_crossings = if rising { rising_crossings(samples, first_threshold) } else { falling_crossings(samples, first_threshold) };
    let Some(&start) = first_crossings.first() else { return Err(Error::InsufficientData) };

    let second_crossings = if rising { rising_crossings(samples, second_threshold) } else { falling_crossings(samples, second_threshold) };
    let Some(&end) = second_crossings.iter().find(|&&c| c > start) else {
        return Err(Error::InsufficientData);
    };
    Ok((end - start) / sample_rate_hz)
}

#[cfg(test)]
mod test {
    use super::*;

    fn square_wave(periods: usize, samples_per_period: usize, low: f32, high: f32) -> Vec<f32> {
        (0..periods * samples_per_period)
            .map(|i| if (i % samples_per_period) < samples_per_period / 2 { high } else { low })
            .collect()
    }

    #[test]
    fn test_empty_samples_is_insufficient_data() {
        assert!(matches!(amplitude_stats(&[]), Err(Error::InsufficientData)));
    }

    #[test]
    fn test_amplitude_stats_of_dc_signal() {
        let stats = amplitude_stats(&[2.0, 2.0, 2.0]).unwrap();
        assert_eq!(stats.vpp, 0.0);
        assert_eq!(stats.vmean, 2.0);
        assert_eq!(stats.vrms, 2.0);
    }

    #[test]
    fn test_frequency_of_square_wave() {
        let samples = square_wave(10, 100, -1.0, 1.0);
        let freq = frequency_hz(&samples, 1.0e9).unwrap();
        assert!((freq - 1.0e7).abs() / 1.0e7 < 0.05);
    }

    #[test]
    fn test_frequency_needs_two_edges() {
        let samples = vec![1.0; 5];
        assert!(matches!(frequency_hz(&samples, 1.0e9), Err(Error::InsufficientData)));
    }

    #[test]
    fn test_duty_cycle_of_50_percent_square_wave() {
        let samples = square_wave(10, 100, -1.0, 1.0);
        let duty = duty_cycle(&samples).unwrap();
        assert!((duty - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_rise_time_of_ramp() {
        let mut samples = vec![-1.0f32; 10];
        for i in 0..20 {
            samples.push(-1.0 + 2.0 * (i as f32 / 19.0));
        }
        samples.extend(vec![1.0f32; 10]);
        let rise = rise_time_s(&samples, 1.0e9).unwrap();
        assert!(rise > 0.0);
    }
}
