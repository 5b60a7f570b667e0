//! Minimal one-board smoke test: connect, arm, read one cycle, print a
//! summary.

use haasoscope_core::board::{Board, BoardCaps, BoardDriver};
use haasoscope_core::controller::{Controller, NullSink};
use haasoscope_core::diagnostics;
use haasoscope_core::sink::WaveformSink;
use haasoscope_core::state::StateStore;
use haasoscope_core::transport;
use haasoscope_core::{Result, Waveform};

struct PrintingSink {
    count: usize,
}

impl WaveformSink for PrintingSink {
    fn on_waveform(&mut self, waveform: &Waveform) {
        self.count += 1;
        println!(
            "channel {}: {} samples at {:.3} MS/s, trigger offset {:.3} us",
            waveform.channel,
            waveform.samples.len(),
            waveform.sample_rate_hz / 1.0e6,
            waveform.trigger_offset_s * 1.0e6,
        );
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let ordered = transport::discover(&[], 1)?;
    let discovered = ordered.transports.into_iter().next().ok_or(haasoscope_core::Error::NotFound)?;
    let board: Box<dyn BoardDriver> = Box::new(Board::new(0, discovered.open()?, BoardCaps::default()));

    let state = StateStore::new(1);
    let (diagnostics_tx, _diagnostics_rx) = diagnostics::channel();
    let mut controller = Controller::new(state, vec![board], diagnostics_tx);

    controller.connect_all()?;
    let mut waveform_sink = PrintingSink { count: 0 };
    let mut measurement_sink = NullSink;
    let mut fft_sink = NullSink;
    let report = controller.run_cycle(&mut waveform_sink, &mut measurement_sink, &mut fft_sink, false)?;

    println!(
        "cycle {:?} in {} ms, {} bytes, {} waveforms published",
        report.outcome, report.elapsed_ms, report.bytes_read, waveform_sink.count
    );
    Ok(())
}
