//! Diagnostic event stream. The core never writes to stdout/stderr
//! directly about acquisition-cycle events (ordinary operational detail
//! still goes through the `log` facade) — anything a UI or operator
//! might want to react to programmatically is emitted as a
//! [`DiagnosticEvent`] over a bounded channel instead.

use std::sync::mpsc;

use crate::lvds::LvdsCalibrationSet;

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    BoardConnected { board: usize, firmware_major: u8, firmware_minor: u8 },
    BoardDisconnected { board: usize, reason: String },
    CalibrationStarted { board: usize },
    CalibrationConverged { board: usize, residual_delay_ns: f32 },
    CalibrationUnstable { board: usize },
    CalibrationSetUpdated(LvdsCalibrationSet),
    CycleOverrun { board: usize, dropped: bool },
    ProtocolResynced { board: usize },
    FirCalibrationInstalled { channel: usize },
}

/// Capacity for the diagnostics channel. Deliberately small: this is a
/// status stream for a human or UI, not a data path, and a slow consumer
/// should lose old events rather than ever block the acquisition loop.
pub const DIAGNOSTICS_CHANNEL_CAPACITY: usize = 64;

pub struct DiagnosticsSender {
    inner: mpsc::SyncSender<DiagnosticEvent>,
}

impl DiagnosticsSender {
    /// Sends an event, dropping it silently if the channel is full rather
    /// than blocking the caller (the acquisition loop must never stall on
    /// diagnostics).
    pub fn send(&self, event: DiagnosticEvent) {
        let _ = self.inner.try_send(event);
    }
}

pub fn channel() -> (DiagnosticsSender, mpsc::Receiver<DiagnosticEvent>) {
    let (tx, rx) = mpsc::sync_channel(DIAGNOSTICS_CHANNEL_CAPACITY);
    (DiagnosticsSender { inner: tx }, rx)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_send_and_receive_event() {
        let (tx, rx) = channel();
        tx.send(DiagnosticEvent::BoardConnected { board: 0, firmware_major: 1, firmware_minor: 0 });
        let event = rx.recv().unwrap();
        assert_eq!(event, DiagnosticEvent::BoardConnected { board: 0, firmware_major: 1, firmware_minor: 0 });
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (tx, rx) = channel();
        for _ in 0..(DIAGNOSTICS_CHANNEL_CAPACITY + 10) {
            tx.send(DiagnosticEvent::ProtocolResynced { board: 0 });
        }
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert!(count <= DIAGNOSTICS_CHANNEL_CAPACITY);
    }
}
