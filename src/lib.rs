//! Host-side control, acquisition, and signal-processing core for a
//! multi-board 2 GHz / 3.2 GS/s / 12-bit USB oscilloscope.
//!
//! This crate implements the transport, protocol, acquisition scheduler,
//! LVDS inter-board calibration, sample decode/correction pipeline, and
//! derived-product engine (math channels, FFT, measurements). The GUI
//! shell, plot rendering, and remote SCPI surface are external
//! collaborators and are not part of this crate.

pub mod transport;
pub mod protocol;
pub mod board;
pub mod state;
pub mod acquire;
pub mod lvds;
pub mod decode;
pub mod correct;
pub mod fir;
pub mod resample;
pub mod math;
pub mod fft;
pub mod measure;
pub mod sink;
pub mod diagnostics;
pub mod controller;

use std::io;

/// Abstract fault taxonomy for the acquisition core. Variants carry enough
/// detail to let the controller decide whether to disable a board, retry,
/// or abort the whole session; the core never logs to stdout directly, it
/// emits [`diagnostics::DiagnosticEvent`]s and returns these errors.
#[derive(Debug)]
pub enum Error {
    /// The transport for a board was closed, read/write timed out, or
    /// surfaced a partial operation. Fatal for that board; the core does
    /// not attempt to reconnect on its own.
    Transport { board: Option<usize>, kind: TransportFault },
    /// A response failed length, opcode-echo, or sequence-nibble
    /// validation. Recoverable once via flush + `GetId` resync; a second
    /// consecutive desync escalates to a fatal session error.
    ProtocolDesync { board: usize, detail: String },
    /// The PLL lost lock while a board was arming. The current cycle is
    /// cancelled and the board is marked `pll_reset_pending`.
    PllLockLost { board: usize },
    /// No board reached `ready_to_read` before `acquisition_timeout_ms`
    /// elapsed. The whole cycle is aborted and the system returns to
    /// `Idle`.
    AcquisitionTimeout { elapsed_ms: u64 },
    /// LVDS delay calibration did not converge within 50 retries for a
    /// board. Delays are left at their last known value.
    CalibrationUnstable { board: usize },
    /// A `StateStore` mutator rejected a value that would violate an
    /// invariant. No partial application occurs.
    InvalidConfig { kind: ConfigKind, detail: String },
    /// A loaded `.fir` calibration's sample rate differs from the current
    /// base rate by more than 0.1%. Non-fatal; the caller may override.
    FirSampleRateMismatch { expected_hz: f64, found_hz: f64 },
    /// A measurement could not be computed because the analysis window
    /// contained fewer than two qualifying transitions.
    InsufficientData,
    /// Device discovery or session setup failed outright.
    NotFound,
    /// Wraps an I/O error not otherwise classified above.
    Io(io::Error),
    /// Wraps a JSON (de)serialization error from persistence.
    Json(serde_json::Error),
    Other(Box<dyn std::error::Error + Sync + Send + 'static>),
}

/// Coarse classification of a [`Error::Transport`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    Closed,
    Timeout,
    Partial { expected: usize, got: usize },
}

/// Which `StateStore` invariant or field category a validation error
/// concerns. Kept coarse-grained so callers can match on it without
/// depending on string contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    TriggerSource,
    FirstLastRole,
    OversamplePairing,
    SampleRate,
    ChannelIndex,
    BoardIndex,
    ResampleFactor,
    ReferenceSlot,
    SchemaVersion,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Transport { board, kind } =>
                write!(f, "transport error on board {:?}: {:?}", board, kind),
            Self::ProtocolDesync { board, detail } =>
                write!(f, "protocol desync on board {}: {}", board, detail),
            Self::PllLockLost { board } =>
                write!(f, "PLL lock lost on board {} while arming", board),
            Self::AcquisitionTimeout { elapsed_ms } =>
                write!(f, "acquisition timed out after {} ms", elapsed_ms),
            Self::CalibrationUnstable { board } =>
                write!(f, "LVDS calibration did not converge for board {}", board),
            Self::InvalidConfig { kind, detail } =>
                write!(f, "invalid config ({:?}): {}", kind, detail),
            Self::FirSampleRateMismatch { expected_hz, found_hz } =>
                write!(f, "FIR calibration sample rate mismatch: expected {} Hz, found {} Hz",
                    expected_hz, found_hz),
            Self::InsufficientData =>
                write!(f, "insufficient data for measurement"),
            Self::NotFound =>
                write!(f, "device not found"),
            Self::Io(io_error) =>
                write!(f, "I/O error: {}", io_error),
            Self::Json(json_error) =>
                write!(f, "JSON error: {}", json_error),
            Self::Other(error) =>
                write!(f, "{}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(io_error) => Some(io_error),
            Self::Json(json_error) => Some(json_error),
            Self::Other(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error)
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(io_error) => io_error,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

pub use state::{
    ChannelConfig, BoardConfig, GlobalConfig, StateStore, StateSnapshot,
    Coupling, Impedance, Bandwidth, TriggerType, ChannelMode, FirstLastRole,
};
pub use board::{Board, BoardCaps, BoardDriver};
pub use acquire::{Acquirer, Acquisition, AcquisitionMeta, CycleReport, CycleOutcome, CancelToken};
pub use sink::{Waveform, WaveformSink, MeasurementSink, FftSink};
pub use fir::{FirBank, FirCalibration, FirSource};
pub use lvds::{LvdsCalibrator, LvdsCalibrationSet};
