//! Session controller: the only component that mutates the
//! [`StateStore`], and the cooperative single-threaded loop that drives
//! one acquisition cycle end to end — arm, wait, read, decode, correct,
//! resample, and publish.

use std::sync::Arc;

use crate::acquire::{Acquirer, CancelToken, CycleReport};
use crate::board::BoardDriver;
use crate::correct::{Corrector, CouplingState};
use crate::decode::Decoder;
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSender};
use crate::fft::{FftEngine, WindowKind};
use crate::lvds::{LvdsCalibrationSet, LvdsCalibrator};
use crate::math::MathEngine;
use crate::measure;
use crate::resample::Resampler;
use crate::sink::{FftSink, MeasurementSink, Waveform, WaveformSink};
use crate::state::{ChannelConfig, ChannelMode, StateSnapshot, StateStore};
use crate::Result;

/// No-op sink implementations for callers that only care about a subset
/// of a cycle's outputs.
pub struct NullSink;
impl WaveformSink for NullSink {
    fn on_waveform(&mut self, _waveform: &Waveform) {}
}
impl MeasurementSink for NullSink {
    fn on_measurement(&mut self, _channel: usize, _stats: measure::AmplitudeStats) {}
}
impl FftSink for NullSink {
    fn on_spectrum(&mut self, _channel: usize, _spectrum: &crate::fft::Spectrum) {}
}

pub struct Controller {
    state: Arc<StateStore>,
    boards: Vec<Box<dyn BoardDriver>>,
    acquirer: Acquirer,
    decoders: Vec<Decoder>,
    corrector: Corrector,
    math_engine: MathEngine,
    fft_engine: FftEngine,
    coupling_states: Vec<CouplingState>,
    cycle_index: u64,
    diagnostics: DiagnosticsSender,
}

impl Controller {
    pub fn new(state: StateStore, boards: Vec<Box<dyn BoardDriver>>, diagnostics: DiagnosticsSender) -> Controller {
        let decoders = state.boards.iter().map(|b| Decoder::new(b.channel_mode)).collect();
        let coupling_states = vec![CouplingState::default(); state.channels.len()];
        let corrector = Corrector::new(&state.global);
        Controller {
            state: Arc::new(state),
            boards,
            acquirer: Acquirer::new(),
            decoders,
            corrector,
            math_engine: MathEngine::new(),
            fft_engine: FftEngine::new(),
            coupling_states,
            cycle_index: 0,
            diagnostics,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        Arc::clone(&self.state)
    }

    /// Clone-check-commit mutation: `f` runs against a private clone of
    /// the current store; only on success is the live store replaced, so
    /// a rejected change never leaves partial state applied.
    pub fn mutate(&mut self, f: impl FnOnce(&mut StateStore) -> Result<()>) -> Result<()> {
        let mut candidate = (*self.state).clone();
        f(&mut candidate)?;
        self.corrector = Corrector::new(&candidate.global);
        self.state = Arc::new(candidate);
        Ok(())
    }

    pub fn connect_all(&mut self) -> Result<()> {
        for (i, board) in self.boards.iter_mut().enumerate() {
            board.connect()?;
            self.diagnostics.send(DiagnosticEvent::BoardConnected { board: i, firmware_major: 0, firmware_minor: 0 });
        }
        Ok(())
    }

    /// Runs the pairwise LVDS calibration sweep and installs the result
    /// into the live state.
    pub fn calibrate_lvds(&mut self) -> Result<LvdsCalibrationSet> {
        let calibrator = LvdsCalibrator::new(&self.state.global);
        let (set, errors) = calibrator.calibrate_chain(&mut self.boards);
        for (board, error) in errors.iter().enumerate() {
            log::warn!("LVDS calibration issue on pair ending at board {}: {}", board, error);
            self.diagnostics.send(DiagnosticEvent::CalibrationUnstable { board });
        }
        self.diagnostics.send(DiagnosticEvent::CalibrationSetUpdated(set.clone()));
        self.mutate(|store| {
            store.lvds = set.clone();
            Ok(())
        })?;
        Ok(set)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.acquirer.cancel_token()
    }

    pub fn cycle_index(&self) -> u64 {
        self.cycle_index
    }

    /// Runs one full acquisition cycle and publishes every channel's
    /// corrected, resampled waveform (plus measurements/spectra for
    /// channels that request them) to the given sinks.
    pub fn run_cycle(
        &mut self,
        waveform_sink: &mut dyn WaveformSink,
        measurement_sink: &mut dyn MeasurementSink,
        fft_sink: &mut dyn FftSink,
        drop_this_cycle: bool,
    ) -> Result<CycleReport> {
        self.cycle_index += 1;
        let snapshot = self.snapshot();

        let channels_per_board: Vec<Vec<ChannelConfig>> = (0..snapshot.boards.len())
            .map(|i| vec![snapshot.channels[i * 2].clone(), snapshot.channels[i * 2 + 1].clone()])
            .collect();

        let (acquisition, report) = self.acquirer.run_cycle(
            &mut self.boards,
            &channels_per_board,
            &snapshot.boards,
            snapshot.global.acquisition_timeout_ms,
            self.cycle_index,
            drop_this_cycle,
        )?;

        if report.dropped || acquisition.payloads.is_empty() {
            return Ok(report);
        }

        for (board_idx, payload) in acquisition.payloads.iter().enumerate() {
            self.publish_board(board_idx, payload, &snapshot, waveform_sink, measurement_sink, fft_sink);
        }

        Ok(report)
    }

    fn publish_board(
        &mut self,
        board_idx: usize,
        payload: &[u8],
        snapshot: &StateSnapshot,
        waveform_sink: &mut dyn WaveformSink,
        measurement_sink: &mut dyn MeasurementSink,
        fft_sink: &mut dyn FftSink,
    ) {
        let decoder = &self.decoders[board_idx];
        let board_cfg = &snapshot.boards[board_idx];
        let sample_rate_hz = snapshot.sample_rate_hz(board_idx);

        let raw = decoder.unpack_12bit(payload);
        let time_major = decoder.deinterleave_lanes(&raw, crate::decode::NUM_LANES.min(raw.len().max(1)));

        let lane_count = if board_cfg.channel_mode == ChannelMode::SingleInterleaved { 1 } else { 2 };
        for lane in 0..lane_count {
            let channel_idx = board_idx * 2 + lane;
            let channel_cfg = &snapshot.channels[channel_idx];

            let lane_samples: Vec<i16> = time_major.iter().skip(lane).step_by(lane_count).copied().collect();
            let mut volts: Vec<f32> = lane_samples.iter().map(|&code| crate::decode::code_to_volts(code, 1.0)).collect();

            self.corrector.apply_coupling(&mut volts, channel_cfg.coupling, &mut self.coupling_states[channel_idx]);
            self.corrector.apply_gain_offset(&mut volts, channel_cfg.gain_db, channel_cfg.offset_v);

            if board_idx > 0 {
                let residual_ns = snapshot.lvds.residual_delay_ns.get(board_idx).copied().unwrap_or(0.0);
                volts = self.corrector.compensate_lvds_residual(&volts, residual_ns, sample_rate_hz);
            }

            volts = snapshot.fir.apply_zero_phase(channel_idx, &volts);

            let resampler = Resampler::new(channel_cfg.resamp_factor);
            let resampled = resampler.upsample(&volts);
            let output_rate_hz = sample_rate_hz * resampler.factor() as f64;

            let waveform = Waveform {
                channel: channel_idx,
                samples: resampled,
                sample_rate_hz: output_rate_hz,
                trigger_offset_s: -(board_cfg.prelength as f64) / sample_rate_hz,
                full_scale_v: 1.0,
            };

            if channel_cfg.persist_on {
                if let Ok(stats) = measure::amplitude_stats(&waveform.samples) {
                    measurement_sink.on_measurement(channel_idx, stats);
                }
            }
            if channel_cfg.peak_detect_on {
                let spectrum = self.fft_engine.compute_spectrum(
                    &waveform.samples, waveform.sample_rate_hz, WindowKind::Hann, waveform.full_scale_v,
                );
                fft_sink.on_spectrum(channel_idx, &spectrum);
            }

            waveform_sink.on_waveform(&waveform);
        }
    }

    pub fn math_engine_mut(&mut self) -> &mut MathEngine {
        &mut self.math_engine
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::board::BoardCaps;
    use crate::diagnostics;
    use crate::state::BoardConfig;

    struct FakeBoard {
        ready: bool,
    }

    impl BoardDriver for FakeBoard {
        fn connect(&mut self) -> Result<()> { Ok(()) }
        fn apply(&mut self, _: &[ChannelConfig], _: &BoardConfig) -> Result<()> { Ok(()) }
        fn arm(&mut self, _: &BoardConfig) -> Result<()> { Ok(()) }
        fn poll_ready(&mut self) -> Result<bool> { Ok(self.ready) }
        fn read_payload(&mut self, byte_len: usize) -> Result<Vec<u8>> { Ok(vec![0u8; byte_len]) }
        fn set_phase(&mut self, _: u8, _: u8, _: i8) -> Result<()> { Ok(()) }
        fn caps(&self) -> BoardCaps { BoardCaps::default() }
        fn read_phase_counter(&mut self, _: u8) -> Result<u16> { Ok(0) }
    }

    #[test]
    fn test_run_cycle_publishes_one_waveform_per_channel() {
        let mut state = StateStore::new(1);
        state.boards[0].length = 64;
        let boards: Vec<Box<dyn BoardDriver>> = vec![Box::new(FakeBoard { ready: true })];
        let (tx, _rx) = diagnostics::channel();
        let mut controller = Controller::new(state, boards, tx);

        struct CountingSink { count: usize }
        impl WaveformSink for CountingSink {
            fn on_waveform(&mut self, _w: &Waveform) { self.count += 1; }
        }
        let mut waveform_sink = CountingSink { count: 0 };
        let mut measurement_sink = NullSink;
        let mut fft_sink = NullSink;

        let report = controller
            .run_cycle(&mut waveform_sink, &mut measurement_sink, &mut fft_sink, false)
            .unwrap();
        assert_eq!(report.outcome, crate::acquire::CycleOutcome::Completed);
        assert_eq!(waveform_sink.count, 2);
    }

    #[test]
    fn test_mutate_rejects_invalid_and_leaves_state_unchanged() {
        let state = StateStore::new(1);
        let boards: Vec<Box<dyn BoardDriver>> = vec![Box::new(FakeBoard { ready: true })];
        let (tx, _rx) = diagnostics::channel();
        let mut controller = Controller::new(state, boards, tx);
        let before = controller.snapshot().channels[0].gain_db;
        let result = controller.mutate(|store| store.set_channel_resamp_factor(0, 3));
        assert!(result.is_err());
        assert_eq!(controller.snapshot().channels[0].gain_db, before);
    }
}
