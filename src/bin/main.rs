//! `haasoscope-core` — connects to every discovered board, calibrates the
//! LVDS inter-board skew, and runs the acquisition loop, logging a summary
//! of each cycle. A GUI, SCPI server, or other long-lived consumer is
//! expected to drive a [`Controller`] directly rather than shell out to
//! this binary; this is the minimal headless host loop.

use std::path::PathBuf;

use clap::Parser;

use haasoscope_core::board::{Board, BoardCaps, BoardDriver};
use haasoscope_core::controller::{Controller, NullSink};
use haasoscope_core::sink::WaveformSink;
use haasoscope_core::state::StateStore;
use haasoscope_core::transport::{self, StubTransport};
use haasoscope_core::{diagnostics, Error, Result, Waveform};

#[derive(Parser, Debug)]
#[command(name = "haasoscope-core", about = "Host-side acquisition core for a multi-board oscilloscope")]
struct Cli {
    /// Explicit `host:port` transport endpoints, in addition to any USB
    /// devices discovered automatically. Repeatable.
    #[arg(long = "socket", value_name = "HOST:PORT")]
    socket: Vec<String>,

    /// Maximum number of boards to open.
    #[arg(long = "max-devices", default_value_t = 4)]
    max_devices: usize,

    /// Runs a single synthetic cycle against an in-memory stub transport
    /// instead of discovering real hardware, then exits.
    #[arg(long = "testing")]
    testing: bool,

    /// Persisted `.hsp` state to load at startup and save on exit.
    #[arg(long = "state-file", value_name = "PATH")]
    state_file: Option<PathBuf>,

    /// Number of acquisition cycles to run before exiting (omit to run
    /// until the first unrecoverable error).
    #[arg(long = "cycles")]
    cycles: Option<u64>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        log::error!("fatal: {}", error);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let (boards, num_boards) = if cli.testing {
        build_testing_boards()
    } else {
        open_discovered_boards(&cli.socket, cli.max_devices)?
    };

    if num_boards == 0 {
        return Err(Error::NotFound);
    }

    let mut state = match &cli.state_file {
        Some(path) if path.exists() => StateStore::load(path)?,
        _ => StateStore::new(num_boards),
    };
    state.global.testing_mode = cli.testing;
    if cli.testing {
        // Keep the synthetic board's scripted reply short: the stub
        // transport has no firmware behind it to serve an arbitrary length.
        state.boards[0].length = 8;
    }

    let (diagnostics_tx, diagnostics_rx) = diagnostics::channel();
    std::thread::spawn(move || {
        while let Ok(event) = diagnostics_rx.recv() {
            log::info!("diagnostic: {:?}", event);
        }
    });

    let mut controller = Controller::new(state, boards, diagnostics_tx);
    controller.connect_all()?;
    if num_boards > 1 {
        if let Err(error) = controller.calibrate_lvds() {
            log::warn!("LVDS calibration did not fully converge: {}", error);
        }
    }

    let mut waveform_sink = LoggingWaveformSink;
    let mut measurement_sink = NullSink;
    let mut fft_sink = NullSink;

    let mut cycle = 0u64;
    loop {
        let report = controller.run_cycle(&mut waveform_sink, &mut measurement_sink, &mut fft_sink, false)?;
        log::info!(
            "cycle {}: {:?}, {} bytes across {} boards in {} ms",
            controller.cycle_index(), report.outcome, report.bytes_read, report.boards_read, report.elapsed_ms
        );
        cycle += 1;
        if cli.testing || cli.cycles.is_some_and(|limit| cycle >= limit) {
            break;
        }
    }

    if let Some(path) = &cli.state_file {
        controller.snapshot().save(path)?;
    }
    Ok(())
}

struct LoggingWaveformSink;
impl WaveformSink for LoggingWaveformSink {
    fn on_waveform(&mut self, waveform: &Waveform) {
        log::debug!(
            "channel {}: {} samples at {:.3} MS/s",
            waveform.channel, waveform.samples.len(), waveform.sample_rate_hz / 1.0e6
        );
    }
}

fn open_discovered_boards(sockets: &[String], max_devices: usize) -> Result<(Vec<Box<dyn BoardDriver>>, usize)> {
    let ordered = transport::discover(sockets, max_devices)?;
    if ordered.unstable_ordering {
        log::warn!("board ordering is unstable (no usable trailing index); falling back to lexicographic order");
    }
    let mut boards: Vec<Box<dyn BoardDriver>> = Vec::with_capacity(ordered.transports.len());
    for discovered in &ordered.transports {
        let transport = discovered.open()?;
        let index = boards.len();
        boards.push(Box::new(Board::new(index, transport, BoardCaps::default())));
    }
    let n = boards.len();
    Ok((boards, n))
}

/// Builds one board backed by an in-memory stub pre-scripted to succeed at
/// connect, arm, and one poll/read cycle, for `--testing` smoke runs
/// without real hardware.
fn build_testing_boards() -> (Vec<Box<dyn BoardDriver>>, usize) {
    let mut stub = StubTransport::new("testing_0");
    stub.push_reply(&[0, 0x00, 1, 0]); // GetId: op_echo=0 (GetId), seq=0
    stub.push_reply(&[1, 0x10, 0, 0]); // ArmTrigger status: op_echo=1, seq=1
    stub.push_reply(&[1, 0x20, 251, 0]); // poll_status: op_echo=1, seq=2, acqstate=ready
    stub.push_reply(&[0u8; 16]); // BulkRead payload: 8 samples, 2 bytes each
    let board: Box<dyn BoardDriver> = Box::new(Board::new(0, Box::new(stub), BoardCaps::default()));
    (vec![board], 1)
}
