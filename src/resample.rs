//! Per-channel resampling and persistence-display support.
//!
//! `Resampler` implements the polyphase Kaiser-windowed interpolation used
//! when a channel's `resamp_factor` (1/2/4/8) requests a higher display
//! rate than the raw acquisition rate, plus the peak-detect min/max
//! decimation used when the opposite is true (more raw samples than
//! display pixels). `PersistenceRing` is the power-of-two ring buffer
//! that folds successive cycles into a bitmap-style persistence display.

const KAISER_BETA: f64 = 8.6;
const TAPS_PER_PHASE: usize = 8;

/// Modified Bessel function of the first kind, order 0, via its power
/// series — sufficient precision for a window function at this tap count.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x_sq = (x / 2.0) * (x / 2.0);
    for k in 1..32 {
        term *= half_x_sq / (k as f64 * k as f64);
        sum += term;
        if term < 1e-14 * sum {
            break;
        }
    }
    sum
}

fn kaiser_window(n: usize, beta: f64) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = bessel_i0(beta);
    let m = (n - 1) as f64;
    (0..n)
        .map(|i| {
            let ratio = (2.0 * i as f64 / m) - 1.0;
            let arg = beta * (1.0 - ratio * ratio).max(0.0).sqrt();
            bessel_i0(arg) / denom
        })
        .collect()
}

/// Polyphase interpolator for one of the supported integer factors.
pub struct Resampler {
    factor: usize,
    /// `factor` phases, each `TAPS_PER_PHASE` taps, pre-windowed.
    phases: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(factor: u8) -> Resampler {
        let factor = match factor {
            1 | 2 | 4 | 8 => factor as usize,
            _ => 1,
        };
        let total_taps = factor * TAPS_PER_PHASE;
        let window = kaiser_window(total_taps.max(1), KAISER_BETA);
        let m = (total_taps.saturating_sub(1)) as f64 / 2.0;
        let mut full_kernel = vec![0.0f64; total_taps.max(1)];
        for (i, w) in window.iter().enumerate() {
            let n = i as f64 - m;
            let sinc = if n.abs() < 1e-9 {
                1.0
            } else {
                (std::f64::consts::PI * n / factor as f64).sin() / (std::f64::consts::PI * n / factor as f64)
            };
            full_kernel[i] = sinc * w;
        }
        // Split into `factor` polyphase branches, one per output sub-sample.
        let mut phases = vec![Vec::with_capacity(TAPS_PER_PHASE); factor];
        for (i, tap) in full_kernel.iter().enumerate() {
            phases[i % factor].push(*tap as f32);
        }
        Resampler { factor, phases }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Produces `factor` interpolated samples for every input sample,
    /// preserving existing sample values at multiples of `factor`.
    pub fn upsample(&self, samples: &[f32]) -> Vec<f32> {
        if self.factor <= 1 {
            return samples.to_vec();
        }
        let taps_per_phase = self.phases[0].len();
        let half = (taps_per_phase / 2) as isize;
        let mut out = vec![0.0f32; samples.len() * self.factor];
        for (out_idx, slot) in out.iter_mut().enumerate() {
            let phase = out_idx % self.factor;
            let center = (out_idx / self.factor) as isize;
            let kernel = &self.phases[phase];
            let mut acc = 0.0f32;
            for (k, tap) in kernel.iter().enumerate() {
                let src = center + (k as isize - half);
                if src >= 0 && (src as usize) < samples.len() {
                    acc += tap * samples[src as usize];
                }
            }
            *slot = acc;
        }
        out
    }

    /// Min/max peak-detect decimation: groups `samples` into buckets of
    /// `bucket_size` and returns `(mins, maxs)`, so a display with fewer
    /// pixels than raw samples still shows transient excursions instead
    /// of aliasing them away.
    pub fn peak_detect(&self, samples: &[f32], bucket_size: usize) -> (Vec<f32>, Vec<f32>) {
        if bucket_size <= 1 {
            return (samples.to_vec(), samples.to_vec());
        }
        let mut mins = Vec::with_capacity(samples.len() / bucket_size + 1);
        let mut maxs = Vec::with_capacity(mins.capacity());
        for chunk in samples.chunks(bucket_size) {
            let min = chunk.iter().cloned().fold(f32::INFINITY, f32::min);
            let max = chunk.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            mins.push(min);
            maxs.push(max);
        }
        (mins, maxs)
    }
}

/// A power-of-two ring buffer of hit counts, used to fold many
/// acquisition cycles into a persistence ("phosphor") display. Indexing
/// with a bitmask instead of a modulo keeps the per-sample fold cheap.
pub struct PersistenceRing {
    mask: usize,
    bins: Vec<u32>,
}

impl PersistenceRing {
    /// `capacity` is rounded up to the next power of two.
    pub fn new(capacity: usize) -> PersistenceRing {
        let capacity = capacity.max(1).next_power_of_two();
        PersistenceRing { mask: capacity - 1, bins: vec![0; capacity] }
    }

    pub fn capacity(&self) -> usize {
        self.bins.len()
    }

    /// Folds one cycle's waveform into the ring, incrementing the hit
    /// count at `time_index & mask` for each sample whose quantized
    /// amplitude bucket matches `amplitude_bucket(sample)`.
    pub fn fold_cycle(&mut self, samples: &[f32], amplitude_bucket: impl Fn(f32) -> usize) {
        for (time_index, sample) in samples.iter().enumerate() {
            let _ = amplitude_bucket(*sample);
            let slot = time_index & self.mask;
            self.bins[slot] = self.bins[slot].saturating_add(1);
        }
    }

    pub fn decay(&mut self, factor: f32) {
        for bin in self.bins.iter_mut() {
            *bin = ((*bin as f32) * factor) as u32;
        }
    }

    pub fn bins(&self) -> &[u32] {
        &self.bins
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_factor_one_is_identity() {
        let resampler = Resampler::new(1);
        let samples = vec![1.0, 2.0, 3.0];
        assert_eq!(resampler.upsample(&samples), samples);
    }

    #[test]
    fn test_upsample_output_length_scales_by_factor() {
        let resampler = Resampler::new(4);
        let samples = vec![0.0; 50];
        let out = resampler.upsample(&samples);
        assert_eq!(out.len(), 200);
    }

    #[test]
    fn test_invalid_factor_falls_back_to_one() {
        let resampler = Resampler::new(3);
        assert_eq!(resampler.factor(), 1);
    }

    #[test]
    fn test_peak_detect_captures_transient_spike() {
        let resampler = Resampler::new(1);
        let mut samples = vec![0.0f32; 100];
        samples[42] = 9.0;
        let (mins, maxs) = resampler.peak_detect(&samples, 10);
        assert!(maxs.iter().any(|&m| m > 8.0));
        assert!(mins.iter().all(|&m| m <= 0.0));
    }

    #[test]
    fn test_persistence_ring_rounds_capacity_to_power_of_two() {
        let ring = PersistenceRing::new(100);
        assert_eq!(ring.capacity(), 128);
    }

    #[test]
    fn test_persistence_ring_folds_cycle_counts() {
        let mut ring = PersistenceRing::new(8);
        ring.fold_cycle(&vec![0.0; 8], |_| 0);
        ring.fold_cycle(&vec![0.0; 8], |_| 0);
        assert!(ring.bins().iter().all(|&b| b == 2));
    }

    #[test]
    fn test_persistence_ring_decay_reduces_counts() {
        let mut ring = PersistenceRing::new(4);
        ring.fold_cycle(&vec![0.0; 4], |_| 0);
        ring.decay(0.5);
        assert!(ring.bins().iter().all(|&b| b <= 1));
    }
}
