//! TCP `Transport`, for boards exposed over `host:port` instead of USB.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::{Error, Result, TransportFault};
use super::DEFAULT_TIMEOUT_MS;

#[derive(Debug)]
pub struct TcpTransport {
    description: String,
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<TcpTransport> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(TcpTransport {
            description: format!("{}:{}", host, port),
            stream,
        })
    }
}

impl super::Transport for TcpTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).map_err(|e| {
            if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) {
                Error::Transport { board: None, kind: TransportFault::Timeout }
            } else {
                Error::Transport { board: None, kind: TransportFault::Closed }
            }
        })
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(|e| {
            if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) {
                Error::Transport {
                    board: None,
                    kind: TransportFault::Partial { expected: buf.len(), got: 0 },
                }
            } else {
                Error::Transport { board: None, kind: TransportFault::Closed }
            }
        })
    }

    fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) {
        let _ = self.stream.set_read_timeout(Some(Duration::from_millis(read_ms)));
        let _ = self.stream.set_write_timeout(Some(Duration::from_millis(write_ms)));
    }

    fn flush_input(&mut self) -> Result<()> {
        let saved = self.stream.read_timeout()?;
        self.stream.set_read_timeout(Some(Duration::from_millis(10)))?;
        let mut scratch = [0u8; 4096];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        self.stream.set_read_timeout(saved)?;
        Ok(())
    }

    fn description(&self) -> &str {
        &self.description
    }
}
