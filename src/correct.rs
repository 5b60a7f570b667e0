//! Waveform correction stage: coupling, gain/offset, trigger phase
//! realignment, the gated "extra" trigger stabilizer, and the sub-sample
//! time-skew shifts that compensate for LVDS residual delay.

use crate::state::{Coupling, GlobalConfig, TriggerType};

/// Half-width (in samples) of the sinc kernel used for sub-sample shifts.
/// Symmetric and short enough to keep per-cycle cost low while still
/// suppressing ringing via the Hann taper.
const SINC_KERNEL_HALF: isize = 8;

/// Window (in samples) around the trigger index inspected by the extra
/// trigger stabilizer.
const STABILIZER_WINDOW: usize = 8;

/// Per-channel running DC estimate for AC coupling's single-pole
/// high-pass. The corrector does not own channel state itself — the
/// caller threads this through per channel, per cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CouplingState {
    pub dc_estimate: f32,
}

/// Stateless correction operators, parameterized once from the session's
/// [`GlobalConfig`].
pub struct Corrector {
    extra_trigger_stabilizer_on: bool,
}

impl Corrector {
    pub fn new(global: &GlobalConfig) -> Corrector {
        Corrector { extra_trigger_stabilizer_on: global.extra_trigger_stabilizer_on }
    }

    /// AC coupling is a single-pole high-pass tracking a slow DC estimate;
    /// DC coupling is a no-op. The pole is intentionally slow (time
    /// constant much longer than one acquisition) so consecutive cycles on
    /// the same channel see a consistent baseline rather than one that
    /// resets every cycle.
    pub fn apply_coupling(&self, samples: &mut [f32], coupling: Coupling, state: &mut CouplingState) {
        if coupling == Coupling::DC {
            return;
        }
        const ALPHA: f32 = 0.001;
        for sample in samples.iter_mut() {
            state.dc_estimate += ALPHA * (*sample - state.dc_estimate);
            *sample -= state.dc_estimate;
        }
    }

    /// Applies calibrated gain (dB) and DC offset (volts) in place.
    pub fn apply_gain_offset(&self, samples: &mut [f32], gain_db: f32, offset_v: f32) {
        let linear_gain = 10f32.powf(gain_db / 20.0);
        for sample in samples.iter_mut() {
            *sample = *sample * linear_gain + offset_v;
        }
    }

    /// Shifts a waveform by a fractional number of samples using a
    /// windowed-sinc kernel, used both for trigger phase realignment and
    /// for applying an LVDS residual delay in the time domain rather than
    /// re-chasing it in hardware.
    pub fn sub_sample_shift(&self, samples: &[f32], shift_samples: f32) -> Vec<f32> {
        let mut out = vec![0.0f32; samples.len()];
        for (i, slot) in out.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for k in -SINC_KERNEL_HALF..=SINC_KERNEL_HALF {
                let src = i as isize - k;
                if src < 0 || src as usize >= samples.len() {
                    continue;
                }
                let x = k as f32 + shift_samples;
                let sinc = if x.abs() < 1e-6 {
                    1.0
                } else {
                    (std::f32::consts::PI * x).sin() / (std::f32::consts::PI * x)
                };
                let hann = 0.5 * (1.0 + (std::f32::consts::PI * k as f32 / SINC_KERNEL_HALF as f32).cos());
                acc += samples[src as usize] * sinc * hann;
            }
            *slot = acc;
        }
        out
    }

    /// Realigns a waveform so its trigger event lands on an integer sample
    /// index, given the fractional trigger phase reported by the board.
    pub fn realign_trigger_phase(&self, samples: &[f32], fractional_phase: f32) -> Vec<f32> {
        self.sub_sample_shift(samples, -fractional_phase)
    }

    /// Converts a board pair's residual LVDS delay (ns, from
    /// [`crate::lvds::LvdsCalibrationSet`]) into a sample-domain shift and
    /// applies it.
    pub fn compensate_lvds_residual(&self, samples: &[f32], residual_delay_ns: f32, sample_rate_hz: f64) -> Vec<f32> {
        let shift_samples = (residual_delay_ns as f64 * 1e-9 * sample_rate_hz) as f32;
        self.sub_sample_shift(samples, shift_samples)
    }

    /// An additional per-cycle time-alignment stabilizer, gated
    /// independently of the board-level trigger-phase realignment above.
    /// Finds the first rising zero-crossing within `STABILIZER_WINDOW`
    /// samples of the nominal trigger index, fits a local line through
    /// the two bracketing samples, and sub-sample-shifts the whole
    /// waveform so that crossing lands exactly on `trigger_index` (t=0
    /// sits on the fit). Skipped when `extra_trigger_stabilizer_on` is
    /// false or `trigger_type` is `Auto`, since a free-running capture
    /// has no trigger edge to lock to. Leaves the waveform untouched if
    /// no qualifying rising edge is found in the window.
    pub fn extra_trigger_stabilizer(&self, samples: &mut [f32], trigger_index: usize, trigger_type: TriggerType) {
        if !self.extra_trigger_stabilizer_on || trigger_type == TriggerType::Auto {
            return;
        }
        let lo = trigger_index.saturating_sub(STABILIZER_WINDOW);
        let hi = (trigger_index + STABILIZER_WINDOW).min(samples.len());
        if hi <= lo + 1 {
            return;
        }
        let Some(crossing) = (lo + 1..hi).find_map(|i| {
            let (prev, cur) = (samples[i - 1], samples[i]);
            if prev <= 0.0 && cur > 0.0 {
                let frac = -prev as f64 / (cur - prev) as f64;
                Some((i - 1) as f64 + frac)
            } else {
                None
            }
        }) else {
            return;
        };
        let shift = trigger_index as f32 - crossing as f32;
        let shifted = self.sub_sample_shift(samples, shift);
        samples.copy_from_slice(&shifted);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dc_coupling_is_no_op() {
        let global = GlobalConfig::default();
        let corrector = Corrector::new(&global);
        let mut samples = vec![1.0, 2.0, 3.0];
        let mut state = CouplingState::default();
        corrector.apply_coupling(&mut samples, Coupling::DC, &mut state);
        assert_eq!(samples, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_ac_coupling_tracks_toward_zero_mean() {
        let global = GlobalConfig::default();
        let corrector = Corrector::new(&global);
        let mut samples = vec![5.0f32; 5000];
        let mut state = CouplingState::default();
        corrector.apply_coupling(&mut samples, Coupling::AC, &mut state);
        assert!(samples.last().unwrap().abs() < 0.5);
    }

    #[test]
    fn test_apply_gain_offset_scales_and_shifts() {
        let global = GlobalConfig::default();
        let corrector = Corrector::new(&global);
        let mut samples = vec![1.0, -1.0];
        corrector.apply_gain_offset(&mut samples, 20.0, 0.5);
        assert!((samples[0] - 10.5).abs() < 1e-3);
        assert!((samples[1] + 9.5).abs() < 1e-3);
    }

    #[test]
    fn test_sub_sample_shift_zero_is_identity() {
        let global = GlobalConfig::default();
        let corrector = Corrector::new(&global);
        let samples = vec![0.0, 1.0, 0.0, -1.0, 0.0, 1.0, 0.0, -1.0, 0.0, 1.0];
        let out = corrector.sub_sample_shift(&samples, 0.0);
        for (a, b) in out.iter().zip(samples.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    fn ramp_crossing_at(index: f32, len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 - index).collect()
    }

    #[test]
    fn test_extra_trigger_stabilizer_locks_crossing_to_trigger_index_when_on() {
        let mut global = GlobalConfig::default();
        global.extra_trigger_stabilizer_on = true;
        let corrector = Corrector::new(&global);
        // Rising zero-crossing sits at sample 12.5, nominal trigger index is 16.
        let mut samples = ramp_crossing_at(12.5, 32);
        corrector.extra_trigger_stabilizer(&mut samples, 16, TriggerType::Rising);
        assert!(samples[16].abs() < 0.05);
    }

    #[test]
    fn test_extra_trigger_stabilizer_is_no_op_when_disabled() {
        let mut global = GlobalConfig::default();
        global.extra_trigger_stabilizer_on = false;
        let corrector = Corrector::new(&global);
        let mut samples = ramp_crossing_at(12.5, 32);
        let before = samples.clone();
        corrector.extra_trigger_stabilizer(&mut samples, 16, TriggerType::Rising);
        assert_eq!(samples, before);
    }

    #[test]
    fn test_extra_trigger_stabilizer_is_no_op_for_auto_trigger() {
        let mut global = GlobalConfig::default();
        global.extra_trigger_stabilizer_on = true;
        let corrector = Corrector::new(&global);
        let mut samples = ramp_crossing_at(12.5, 32);
        let before = samples.clone();
        corrector.extra_trigger_stabilizer(&mut samples, 16, TriggerType::Auto);
        assert_eq!(samples, before);
    }

    #[test]
    fn test_extra_trigger_stabilizer_leaves_samples_when_no_crossing_in_window() {
        let mut global = GlobalConfig::default();
        global.extra_trigger_stabilizer_on = true;
        let corrector = Corrector::new(&global);
        let mut samples = vec![3.0f32; 32];
        let before = samples.clone();
        corrector.extra_trigger_stabilizer(&mut samples, 16, TriggerType::Rising);
        assert_eq!(samples, before);
    }
}
