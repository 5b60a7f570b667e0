//! In-memory `Transport` used by unit tests and the `--testing` mode: a
//! loopback-style fake the `CommandCodec`/`BoardDriver` tests can script.

use std::collections::VecDeque;

use crate::{Error, Result, TransportFault};

/// A scripted reply queue: `write_all` checks (optionally) that the bytes
/// written match an expectation, and `read_exact` serves bytes from a
/// pre-loaded response queue. Used both for protocol unit tests and for
/// a synthetic board in `--testing` mode.
#[derive(Debug, Default)]
pub struct StubTransport {
    description: String,
    written: Vec<u8>,
    pending_reads: VecDeque<u8>,
    closed: bool,
}

impl StubTransport {
    pub fn new(description: impl Into<String>) -> StubTransport {
        StubTransport {
            description: description.into(),
            written: Vec::new(),
            pending_reads: VecDeque::new(),
            closed: false,
        }
    }

    /// Queue bytes to be returned by future `read_exact` calls.
    pub fn push_reply(&mut self, bytes: &[u8]) {
        self.pending_reads.extend(bytes.iter().copied());
    }

    /// Bytes written so far, for asserting protocol framing in tests.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl super::Transport for StubTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Transport { board: None, kind: TransportFault::Closed });
        }
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Transport { board: None, kind: TransportFault::Closed });
        }
        if self.pending_reads.len() < buf.len() {
            return Err(Error::Transport {
                board: None,
                kind: TransportFault::Partial { expected: buf.len(), got: self.pending_reads.len() },
            });
        }
        for slot in buf.iter_mut() {
            *slot = self.pending_reads.pop_front().unwrap();
        }
        Ok(())
    }

    fn set_timeouts(&mut self, _read_ms: u64, _write_ms: u64) {}

    fn flush_input(&mut self) -> Result<()> {
        self.pending_reads.clear();
        Ok(())
    }

    fn description(&self) -> &str {
        &self.description
    }
}
