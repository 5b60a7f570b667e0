//! Derived math-channel engine: arithmetic combinations of channels,
//! temporal operators (derivative/integral/moving average), peak-hold
//! tracking operators, and Butterworth/Chebyshev IIR filtering applied
//! zero-phase via `filtfilt`.

use std::collections::HashMap;

/// A reference to another math channel's or a raw channel's output,
/// resolved by the caller before `MathEngine::evaluate` runs.
pub type SourceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Butterworth,
    Chebyshev { ripple_db_x10: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterBand {
    LowPass,
    HighPass,
}

/// One math-channel definition. `id` is the math channel's own source id,
/// used as the key into [`MathEngine`]'s per-channel tracking state.
#[derive(Debug, Clone, Copy)]
pub enum MathOperator {
    Arithmetic { op: ArithmeticOp, a: SourceId, b: SourceId },
    Invert(SourceId),
    Scale { source: SourceId, factor: f32 },
    Differentiate(SourceId),
    Integrate(SourceId),
    MovingAverage { source: SourceId, window: usize },
    /// Resettable peak-hold tracker: each sample updates a running
    /// maximum (or minimum) that persists across cycles until cleared.
    TrackMax(SourceId),
    TrackMin(SourceId),
    IirFilter { source: SourceId, band: FilterBand, kind: FilterKind, cutoff_hz: f64, order: usize },
}

/// One second-order IIR section in transposed direct-form-II, normalized
/// so `a0 = 1`.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn apply(&self, samples: &[f32]) -> Vec<f32> {
        let mut z1 = 0.0f64;
        let mut z2 = 0.0f64;
        let mut out = Vec::with_capacity(samples.len());
        for &x in samples {
            let x = x as f64;
            let y = self.b0 * x + z1;
            z1 = self.b1 * x - self.a1 * y + z2;
            z2 = self.b2 * x - self.a2 * y;
            out.push(y as f32);
        }
        out
    }
}

/// Designs `order / 2` cascaded biquad sections for a Butterworth or
/// (approximated) Chebyshev lowpass/highpass at `cutoff_hz` relative to
/// `sample_rate_hz`. Only even orders are supported; odd-order designs
/// would need an additional first-order section, which this engine does
/// not build since derived channels only ever request even orders
/// (2, 4, 6).
fn design_sos(band: FilterBand, kind: FilterKind, cutoff_hz: f64, sample_rate_hz: f64, order: usize) -> Vec<Biquad> {
    let order = if order % 2 == 0 { order } else { order + 1 };
    let sections = (order / 2).max(1);
    let q_values = quality_factors(kind, sections);

    let w0 = 2.0 * std::f64::consts::PI * cutoff_hz / sample_rate_hz;
    let cos_w0 = w0.cos();
    let sin_w0 = w0.sin();

    q_values
        .into_iter()
        .map(|q| {
            let alpha = sin_w0 / (2.0 * q);
            let (b0, b1, b2) = match band {
                FilterBand::LowPass => ((1.0 - cos_w0) / 2.0, 1.0 - cos_w0, (1.0 - cos_w0) / 2.0),
                FilterBand::HighPass => ((1.0 + cos_w0) / 2.0, -(1.0 + cos_w0), (1.0 + cos_w0) / 2.0),
            };
            let a0 = 1.0 + alpha;
            let a1 = -2.0 * cos_w0;
            let a2 = 1.0 - alpha;
            Biquad { b0: b0 / a0, b1: b1 / a0, b2: b2 / a0, a1: a1 / a0, a2: a2 / a0 }
        })
        .collect()
}

/// Per-section pole Q factors. Butterworth's are exact (equally spaced
/// angles on the unit circle); the Chebyshev variant scales them by a
/// ripple-dependent factor to sharpen the roll-off, which approximates
/// but does not exactly reproduce true Chebyshev Type I pole placement.
fn quality_factors(kind: FilterKind, sections: usize) -> Vec<f64> {
    let n = (sections * 2) as f64;
    let base: Vec<f64> = (0..sections)
        .map(|k| {
            let theta = std::f64::consts::PI * (2 * k + 1) as f64 / (2.0 * n);
            1.0 / (2.0 * theta.sin())
        })
        .collect();
    match kind {
        FilterKind::Butterworth => base,
        FilterKind::Chebyshev { ripple_db_x10 } => {
            let ripple_db = ripple_db_x10 as f64 / 10.0;
            let sharpen = 1.0 + (ripple_db / 10.0).min(2.0);
            base.into_iter().map(|q| q * sharpen).collect()
        }
    }
}

/// Applies a cascade of biquad sections forward, then backward over the
/// reversed result, cancelling phase distortion (`filtfilt`).
fn filtfilt(samples: &[f32], sections: &[Biquad]) -> Vec<f32> {
    let mut current = samples.to_vec();
    for section in sections {
        current = section.apply(&current);
    }
    current.reverse();
    for section in sections {
        current = section.apply(&current);
    }
    current.reverse();
    current
}

/// Evaluates math-channel operators against already-computed source
/// waveforms, and holds the peak-hold trackers' persistent state.
#[derive(Default)]
pub struct MathEngine {
    track_max: HashMap<SourceId, f32>,
    track_min: HashMap<SourceId, f32>,
}

impl MathEngine {
    pub fn new() -> MathEngine {
        MathEngine::default()
    }

    pub fn reset_tracking(&mut self, id: SourceId) {
        self.track_max.remove(&id);
        self.track_min.remove(&id);
    }

    /// `sources` resolves a `SourceId` to its waveform; `self_id` is the
    /// id this operator's own result will be published under (used to key
    /// tracking state for `TrackMax`/`TrackMin`).
    pub fn evaluate(&mut self, self_id: SourceId, op: &MathOperator, sources: impl Fn(SourceId) -> Vec<f32>, sample_rate_hz: f64) -> Vec<f32> {
        match *op {
            MathOperator::Arithmetic { op, a, b } => {
                let a = sources(a);
                let b = sources(b);
                let n = a.len().min(b.len());
                (0..n)
                    .map(|i| match op {
                        ArithmeticOp::Add => a[i] + b[i],
                        ArithmeticOp::Subtract => a[i] - b[i],
                        ArithmeticOp::Multiply => a[i] * b[i],
                        ArithmeticOp::Divide => if b[i] != 0.0 { a[i] / b[i] } else { 0.0 },
                    })
                    .collect()
            }
            MathOperator::Invert(source) => sources(source).into_iter().map(|v| -v).collect(),
            MathOperator::Scale { source, factor } => sources(source).into_iter().map(|v| v * factor).collect(),
            MathOperator::Differentiate(source) => {
                let s = sources(source);
                let dt = 1.0 / sample_rate_hz as f32;
                let mut out = vec![0.0f32; s.len()];
                for i in 1..s.len() {
                    out[i] = (s[i] - s[i - 1]) / dt;
                }
                out
            }
            MathOperator::Integrate(source) => {
                let s = sources(source);
                let dt = 1.0 / sample_rate_hz as f32;
                let mut out = vec![0.0f32; s.len()];
                let mut acc = 0.0f32;
                for (i, v) in s.iter().enumerate() {
                    acc += v * dt;
                    out[i] = acc;
                }
                out
            }
            MathOperator::MovingAverage { source, window } => {
                let s = sources(source);
                moving_average(&s, window.max(1))
            }
            MathOperator::TrackMax(source) => {
                let s = sources(source);
                let running = self.track_max.entry(self_id).or_insert(f32::NEG_INFINITY);
                let mut out = Vec::with_capacity(s.len());
                for v in s {
                    if v > *running {
                        *running = v;
                    }
                    out.push(*running);
                }
                out
            }
            MathOperator::TrackMin(source) => {
                let s = sources(source);
                let running = self.track_min.entry(self_id).or_insert(f32::INFINITY);
                let mut out = Vec::with_capacity(s.len());
                for v in s {
                    if v < *running {
                        *running = v;
                    }
                    out.push(*running);
                }
                out
            }
            MathOperator::IirFilter { source, band, kind, cutoff_hz, order } => {
                let s = sources(source);
                let sections = design_sos(band, kind, cutoff_hz, sample_rate_hz, order);
                filtfilt(&s, &sections)
            }
        }
    }
}

fn moving_average(samples: &[f32], window: usize) -> Vec<f32> {
    if window <= 1 || samples.is_empty() {
        return samples.to_vec();
    }
    let mut out = vec![0.0f32; samples.len()];
    let mut acc = 0.0f32;
    for i in 0..samples.len() {
        acc += samples[i];
        if i >= window {
            acc -= samples[i - window];
        }
        let n = (i + 1).min(window) as f32;
        out[i] = acc / n;
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_arithmetic_add() {
        let mut engine = MathEngine::new();
        let sources = |id: SourceId| if id == 0 { vec![1.0, 2.0] } else { vec![10.0, 20.0] };
        let out = engine.evaluate(2, &MathOperator::Arithmetic { op: ArithmeticOp::Add, a: 0, b: 1 }, sources, 1.0e9);
        assert_eq!(out, vec![11.0, 22.0]);
    }

    #[test]
    fn test_divide_by_zero_yields_zero() {
        let mut engine = MathEngine::new();
        let sources = |id: SourceId| if id == 0 { vec![5.0] } else { vec![0.0] };
        let out = engine.evaluate(2, &MathOperator::Arithmetic { op: ArithmeticOp::Divide, a: 0, b: 1 }, sources, 1.0e9);
        assert_eq!(out, vec![0.0]);
    }

    #[test]
    fn test_moving_average_smooths_step() {
        let mut engine = MathEngine::new();
        let mut samples = vec![0.0f32; 10];
        samples.extend(vec![10.0f32; 10]);
        let sources = move |_: SourceId| samples.clone();
        let out = engine.evaluate(0, &MathOperator::MovingAverage { source: 0, window: 4 }, sources, 1.0e9);
        assert!(out[19] <= 10.0);
        assert!(out[9] < out[19]);
    }

    #[test]
    fn test_track_max_holds_across_calls() {
        let mut engine = MathEngine::new();
        let out1 = engine.evaluate(5, &MathOperator::TrackMax(0), |_| vec![1.0, 3.0, 2.0], 1.0e9);
        assert_eq!(out1, vec![1.0, 3.0, 3.0]);
        let out2 = engine.evaluate(5, &MathOperator::TrackMax(0), |_| vec![0.0, 5.0], 1.0e9);
        assert_eq!(out2, vec![3.0, 5.0]);
    }

    #[test]
    fn test_reset_tracking_clears_state() {
        let mut engine = MathEngine::new();
        engine.evaluate(5, &MathOperator::TrackMax(0), |_| vec![9.0], 1.0e9);
        engine.reset_tracking(5);
        let out = engine.evaluate(5, &MathOperator::TrackMax(0), |_| vec![1.0], 1.0e9);
        assert_eq!(out, vec![1.0]);
    }

    #[test]
    fn test_lowpass_attenuates_high_frequency_more_than_dc() {
        let sections = design_sos(FilterBand::LowPass, FilterKind::Butterworth, 1.0e6, 1.0e9, 4);
        let dc = vec![1.0f32; 200];
        let dc_out = filtfilt(&dc, &sections);
        // DC should pass through close to unity once settled.
        assert!((dc_out[150] - 1.0).abs() < 0.1);
    }

    #[test]
    fn test_differentiate_of_ramp_is_constant() {
        let mut engine = MathEngine::new();
        let samples: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let out = engine.evaluate(0, &MathOperator::Differentiate(0), move |_| samples.clone(), 1.0);
        assert!((out[5] - 1.0).abs() < 1e-6);
    }
}
