//! Output collaboration surface: the plain data type a completed
//! acquisition cycle publishes, and the trait seams external consumers
//! (a GUI, a SCPI server, a file logger) implement to receive it. Buffer
//! reuse and cycle sequencing live in [`crate::acquire`]; this module
//! only defines what gets handed off and the trait a receiver implements.

use crate::fft::Spectrum;
use crate::measure::AmplitudeStats;

/// One channel's corrected, resampled waveform plus the metadata needed
/// to place it on a time axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub channel: usize,
    pub samples: Vec<f32>,
    pub sample_rate_hz: f64,
    /// Offset from the cycle's trigger event to this waveform's first
    /// sample, in seconds (negative when the waveform starts before the
    /// trigger, i.e. pretrigger).
    pub trigger_offset_s: f64,
    pub full_scale_v: f32,
}

impl Waveform {
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate_hz
    }
}

/// Receives completed waveforms, one call per channel per cycle.
pub trait WaveformSink {
    fn on_waveform(&mut self, waveform: &Waveform);
}

/// Receives scalar measurements computed from a cycle's waveforms.
pub trait MeasurementSink {
    fn on_measurement(&mut self, channel: usize, stats: AmplitudeStats);
}

/// Receives frequency-domain spectra computed from a cycle's waveforms.
pub trait FftSink {
    fn on_spectrum(&mut self, channel: usize, spectrum: &Spectrum);
}

#[cfg(test)]
mod test {
    use super::*;

    struct RecordingSink {
        waveforms: Vec<Waveform>,
    }

    impl WaveformSink for RecordingSink {
        fn on_waveform(&mut self, waveform: &Waveform) {
            self.waveforms.push(waveform.clone());
        }
    }

    #[test]
    fn test_duration_matches_sample_count_and_rate() {
        let waveform = Waveform {
            channel: 0,
            samples: vec![0.0; 1000],
            sample_rate_hz: 1.0e9,
            trigger_offset_s: 0.0,
            full_scale_v: 1.0,
        };
        assert!((waveform.duration_s() - 1.0e-6).abs() < 1e-12);
    }

    #[test]
    fn test_waveform_sink_records_calls() {
        let mut sink = RecordingSink { waveforms: Vec::new() };
        let waveform = Waveform {
            channel: 1,
            samples: vec![1.0, 2.0],
            sample_rate_hz: 1.0e9,
            trigger_offset_s: -1e-7,
            full_scale_v: 1.0,
        };
        sink.on_waveform(&waveform);
        assert_eq!(sink.waveforms.len(), 1);
        assert_eq!(sink.waveforms[0].channel, 1);
    }
}
