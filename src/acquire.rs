//! Acquisition scheduler: drives every board through
//! `Plan → Arm → Wait → Read → Publish`, tracking the cycle through the
//! `Idle → Arming → ArmedWaiting → {OneReady, AllReady} → Reading →
//! {Aborted}` states, and applies the back-pressure policy
//! (`drop_on_overrun`) when the previous cycle's consumers haven't
//! kept up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::board::BoardDriver;
use crate::state::{BoardConfig, ChannelConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Arming,
    ArmedWaiting,
    OneReady,
    AllReady,
    Reading,
    Aborted,
}

/// Cooperative cancellation flag shared between the controller thread
/// and whatever issues a cancel request (a UI stop button, a signal
/// handler). Polled at each wait-loop iteration, never forcibly
/// interrupting an in-flight transport call.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Aborted,
}

/// Per-cycle bookkeeping surfaced to the controller for logging and
/// diagnostics, independent of the waveform data itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub elapsed_ms: u64,
    pub boards_read: usize,
    pub bytes_read: usize,
    pub dropped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionMeta {
    pub cycle_index: u64,
    pub timestamp_unix_ns: u64,
}

/// Raw, undecoded per-board payloads for one completed cycle. Decoding,
/// correction, and publishing are the controller's job — the acquirer's
/// scope ends at "bytes are off the wire".
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub meta: AcquisitionMeta,
    pub payloads: Vec<Vec<u8>>,
}

/// Bytes expected back from `BulkRead` for one board, given its armed
/// configuration: total sample count times the 2 bytes each packed
/// 12-bit code occupies on the wire.
fn expected_payload_len(board_cfg: &BoardConfig) -> usize {
    let samples = board_cfg.length as usize;
    samples * 2
}

pub struct Acquirer {
    cancel: CancelToken,
    state: CycleState,
}

impl Default for Acquirer {
    fn default() -> Self {
        Acquirer { cancel: CancelToken::new(), state: CycleState::Idle }
    }
}

impl Acquirer {
    pub fn new() -> Acquirer {
        Acquirer::default()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Runs one full cycle across every board. `drop_this_cycle` implements
    /// the `drop_on_overrun` policy: when the caller determines the
    /// previous cycle's consumers haven't finished, the wire payload is
    /// still drained (so the board's sequencing stays consistent) but
    /// discarded rather than returned.
    pub fn run_cycle(
        &mut self,
        boards: &mut [Box<dyn BoardDriver>],
        channels_per_board: &[Vec<ChannelConfig>],
        board_cfgs: &[BoardConfig],
        timeout_ms: u64,
        cycle_index: u64,
        drop_this_cycle: bool,
    ) -> Result<(Acquisition, CycleReport)> {
        let start = Instant::now();
        self.cancel.reset();
        self.state = CycleState::Arming;

        for (i, board) in boards.iter_mut().enumerate() {
            board.apply(&channels_per_board[i], &board_cfgs[i])?;
            board.arm(&board_cfgs[i])?;
        }

        self.state = CycleState::ArmedWaiting;
        let mut ready = vec![false; boards.len()];
        loop {
            if self.cancel.is_cancelled() {
                self.state = CycleState::Aborted;
                return Ok((
                    Acquisition { meta: self.meta(cycle_index), payloads: Vec::new() },
                    CycleReport {
                        outcome: CycleOutcome::Aborted,
                        elapsed_ms: elapsed_ms(start),
                        boards_read: 0,
                        bytes_read: 0,
                        dropped: false,
                    },
                ));
            }
            if elapsed_ms(start) > timeout_ms {
                return Err(Error::AcquisitionTimeout { elapsed_ms: elapsed_ms(start) });
            }

            let mut any_newly_ready = false;
            for (i, board) in boards.iter_mut().enumerate() {
                if !ready[i] && board.poll_ready()? {
                    ready[i] = true;
                    any_newly_ready = true;
                }
            }
            let all_ready = ready.iter().all(|&r| r);
            if all_ready {
                self.state = CycleState::AllReady;
                break;
            } else if any_newly_ready {
                self.state = CycleState::OneReady;
            }
        }

        self.state = CycleState::Reading;
        let mut payloads = Vec::with_capacity(boards.len());
        let mut bytes_read = 0usize;
        for (i, board) in boards.iter_mut().enumerate() {
            let byte_len = expected_payload_len(&board_cfgs[i]);
            let payload = board.read_payload(byte_len)?;
            bytes_read += payload.len();
            if drop_this_cycle {
                continue;
            }
            payloads.push(payload);
        }

        self.state = CycleState::Idle;
        Ok((
            Acquisition { meta: self.meta(cycle_index), payloads },
            CycleReport {
                outcome: CycleOutcome::Completed,
                elapsed_ms: elapsed_ms(start),
                boards_read: boards.len(),
                bytes_read,
                dropped: drop_this_cycle,
            },
        ))
    }

    fn meta(&self, cycle_index: u64) -> AcquisitionMeta {
        let timestamp_unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        AcquisitionMeta { cycle_index, timestamp_unix_ns }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::board::BoardCaps;

    struct FakeBoard {
        ready_after_polls: u32,
        polls: u32,
        arm_called: bool,
    }

    impl BoardDriver for FakeBoard {
        fn connect(&mut self) -> Result<()> { Ok(()) }
        fn apply(&mut self, _: &[ChannelConfig], _: &BoardConfig) -> Result<()> { Ok(()) }
        fn arm(&mut self, _: &BoardConfig) -> Result<()> { self.arm_called = true; Ok(()) }
        fn poll_ready(&mut self) -> Result<bool> {
            self.polls += 1;
            Ok(self.polls >= self.ready_after_polls)
        }
        fn read_payload(&mut self, byte_len: usize) -> Result<Vec<u8>> { Ok(vec![0u8; byte_len]) }
        fn set_phase(&mut self, _: u8, _: u8, _: i8) -> Result<()> { Ok(()) }
        fn caps(&self) -> BoardCaps { BoardCaps::default() }
        fn read_phase_counter(&mut self, _: u8) -> Result<u16> { Ok(0) }
    }

    fn setup(n: usize) -> (Vec<Box<dyn BoardDriver>>, Vec<Vec<ChannelConfig>>, Vec<BoardConfig>) {
        let boards: Vec<Box<dyn BoardDriver>> = (0..n)
            .map(|_| Box::new(FakeBoard { ready_after_polls: 1, polls: 0, arm_called: false }) as Box<dyn BoardDriver>)
            .collect();
        let channels = vec![vec![ChannelConfig::default(); 2]; n];
        let mut cfg = BoardConfig::default();
        cfg.length = 100;
        let board_cfgs = vec![cfg; n];
        (boards, channels, board_cfgs)
    }

    #[test]
    fn test_run_cycle_completes_and_reads_expected_bytes() {
        let (mut boards, channels, board_cfgs) = setup(2);
        let mut acquirer = Acquirer::new();
        let (acquisition, report) = acquirer
            .run_cycle(&mut boards, &channels, &board_cfgs, 1000, 1, false)
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(acquisition.payloads.len(), 2);
        assert_eq!(acquirer.state(), CycleState::Idle);
    }

    #[test]
    fn test_drop_on_overrun_discards_payload_but_reports_bytes() {
        let (mut boards, channels, board_cfgs) = setup(1);
        let mut acquirer = Acquirer::new();
        let (acquisition, report) = acquirer
            .run_cycle(&mut boards, &channels, &board_cfgs, 1000, 1, true)
            .unwrap();
        assert!(acquisition.payloads.is_empty());
        assert!(report.dropped);
        assert!(report.bytes_read > 0);
    }

    #[test]
    fn test_cancel_aborts_before_all_ready() {
        let (mut boards, channels, board_cfgs) = setup(1);
        if let Some(board) = boards.get_mut(0) {
            let _ = board;
        }
        let mut acquirer = Acquirer::new();
        let token = acquirer.cancel_token();
        token.cancel();
        let (_, report) = acquirer
            .run_cycle(&mut boards, &channels, &board_cfgs, 1000, 1, false)
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::Aborted);
    }

    #[test]
    fn test_timeout_when_board_never_becomes_ready() {
        struct NeverReady;
        impl BoardDriver for NeverReady {
            fn connect(&mut self) -> Result<()> { Ok(()) }
            fn apply(&mut self, _: &[ChannelConfig], _: &BoardConfig) -> Result<()> { Ok(()) }
            fn arm(&mut self, _: &BoardConfig) -> Result<()> { Ok(()) }
            fn poll_ready(&mut self) -> Result<bool> { Ok(false) }
            fn read_payload(&mut self, _: usize) -> Result<Vec<u8>> { Ok(Vec::new()) }
            fn set_phase(&mut self, _: u8, _: u8, _: i8) -> Result<()> { Ok(()) }
            fn caps(&self) -> BoardCaps { BoardCaps::default() }
            fn read_phase_counter(&mut self, _: u8) -> Result<u16> { Ok(0) }
        }
        let mut boards: Vec<Box<dyn BoardDriver>> = vec![Box::new(NeverReady)];
        let channels = vec![vec![ChannelConfig::default(); 2]];
        let board_cfgs = vec![BoardConfig::default()];
        let mut acquirer = Acquirer::new();
        let result = acquirer.run_cycle(&mut boards, &channels, &board_cfgs, 1, 1, false);
        assert!(matches!(result, Err(Error::AcquisitionTimeout { .. })));
    }
}
