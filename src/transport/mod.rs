//! Framed byte I/O to a single board, over USB or TCP.
//!
//! One narrow trait describes the operations `BoardDriver` needs, with a
//! concrete implementation selected per backend. A board is a
//! byte-stream endpoint (USB bulk pipe or TCP socket), so the trait is
//! built around `write_all`/`read_exact` rather than a register-level
//! interface.

mod usb;
mod tcp;
mod stub;

use std::time::Duration;

use crate::{Error, Result, TransportFault};

pub use usb::UsbTransport;
pub use tcp::TcpTransport;
pub use stub::StubTransport;

/// Default read/write timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// A framed byte-stream endpoint to one board.
///
/// Implementors must not perform partial writes: `write_all` either
/// transfers every byte or returns an error. `read_exact` blocks until
/// `buf.len()` bytes have arrived, a timeout elapses, or the transport is
/// closed.
pub trait Transport: std::fmt::Debug + Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn set_timeouts(&mut self, read_ms: u64, write_ms: u64);
    /// Discard any bytes already in flight. Used on protocol resync.
    fn flush_input(&mut self) -> Result<()>;
    /// A human-readable identifier for diagnostics (serial, socket addr).
    fn description(&self) -> &str;
}

/// One discovered, not-yet-opened transport endpoint, plus the raw
/// description used by the ordering rule below.
#[derive(Debug, Clone)]
pub struct DiscoveredTransport {
    pub description: String,
    pub kind: DiscoveredKind,
}

#[derive(Debug, Clone)]
pub enum DiscoveredKind {
    Usb { bus: u8, address: u8 },
    Tcp { host: String, port: u16 },
}

impl DiscoveredTransport {
    pub fn open(&self) -> Result<Box<dyn Transport>> {
        match &self.kind {
            DiscoveredKind::Usb { bus, address } =>
                Ok(Box::new(UsbTransport::open(*bus, *address)?)),
            DiscoveredKind::Tcp { host, port } =>
                Ok(Box::new(TcpTransport::connect(host, *port)?)),
        }
    }
}

/// Extract the trailing `_N` integer suffix from a device description, if
/// any.
fn trailing_suffix(description: &str) -> Option<u64> {
    let tail = description.rsplit('_').next()?;
    if tail.is_empty() || tail.len() == description.len() {
        return None;
    }
    tail.parse::<u64>().ok()
}

/// Result of ordering a list of discovered transports: the transports
/// themselves, in final order, and whether the ordering is "unstable"
/// (no usable suffix, or duplicate suffixes).
pub struct OrderedTransports {
    pub transports: Vec<DiscoveredTransport>,
    pub unstable_ordering: bool,
}

/// Order discovered transports by the trailing integer suffix of their
/// description, ascending. Falls back to lexicographic order (and flags
/// `unstable_ordering`) when suffixes are absent or duplicated.
pub fn order_transports(mut transports: Vec<DiscoveredTransport>) -> OrderedTransports {
    let suffixes: Vec<Option<u64>> =
        transports.iter().map(|t| trailing_suffix(&t.description)).collect();

    let all_present = suffixes.iter().all(Option::is_some);
    let mut seen = std::collections::HashSet::new();
    let all_unique = suffixes.iter().flatten().all(|&n| seen.insert(n));

    if all_present && all_unique {
        transports.sort_by_key(|t| trailing_suffix(&t.description).unwrap());
        OrderedTransports { transports, unstable_ordering: false }
    } else {
        transports.sort_by(|a, b| a.description.cmp(&b.description));
        OrderedTransports { transports, unstable_ordering: true }
    }
}

/// Discover all available transports: USB devices matching the board's
/// vendor/product id, plus any `--socket host:port` endpoints supplied by
/// the caller (repeatable), falling back to `HAASOSCOPE_DEFAULT_SOCKET`
/// (default `localhost:9998`) if neither USB devices nor explicit
/// sockets were found.
pub fn discover(explicit_sockets: &[String], max_devices: usize) -> Result<OrderedTransports> {
    let mut found = usb::enumerate(max_devices)?;
    for socket in explicit_sockets {
        let (host, port) = parse_host_port(socket)?;
        found.push(DiscoveredTransport {
            description: socket.clone(),
            kind: DiscoveredKind::Tcp { host, port },
        });
    }
    if found.is_empty() {
        let fallback = std::env::var("HAASOSCOPE_DEFAULT_SOCKET")
            .unwrap_or_else(|_| "localhost:9998".to_string());
        let (host, port) = parse_host_port(&fallback)?;
        found.push(DiscoveredTransport {
            description: fallback,
            kind: DiscoveredKind::Tcp { host, port },
        });
    }
    found.truncate(max_devices);
    Ok(order_transports(found))
}

fn parse_host_port(spec: &str) -> Result<(String, u16)> {
    let (host, port) = spec.rsplit_once(':').ok_or_else(|| Error::InvalidConfig {
        kind: crate::ConfigKind::BoardIndex,
        detail: format!("socket spec '{}' is not host:port", spec),
    })?;
    let port: u16 = port.parse().map_err(|_| Error::InvalidConfig {
        kind: crate::ConfigKind::BoardIndex,
        detail: format!("socket spec '{}' has an invalid port", spec),
    })?;
    Ok((host.to_string(), port))
}

pub(crate) fn classify_timeout(_elapsed: Duration) -> TransportFault {
    TransportFault::Timeout
}

#[cfg(test)]
mod test {
    use super::*;

    fn d(desc: &str) -> DiscoveredTransport {
        DiscoveredTransport {
            description: desc.to_string(),
            kind: DiscoveredKind::Tcp { host: "localhost".into(), port: 9998 },
        }
    }

    #[test]
    fn test_order_by_trailing_suffix() {
        let input = vec![d("haasoscope_10"), d("haasoscope_2"), d("haasoscope_1")];
        let result = order_transports(input);
        assert!(!result.unstable_ordering);
        let descs: Vec<_> = result.transports.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(descs, ["haasoscope_1", "haasoscope_2", "haasoscope_10"]);
    }

    #[test]
    fn test_order_falls_back_lexicographic_on_missing_suffix() {
        let input = vec![d("board-b"), d("board-a")];
        let result = order_transports(input);
        assert!(result.unstable_ordering);
        let descs: Vec<_> = result.transports.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(descs, ["board-a", "board-b"]);
    }

    #[test]
    fn test_order_falls_back_lexicographic_on_duplicate_suffix() {
        let input = vec![d("haasoscope_1"), d("other_1")];
        let result = order_transports(input);
        assert!(result.unstable_ordering);
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("localhost:9998").unwrap(),
            ("localhost".to_string(), 9998));
        assert!(parse_host_port("localhost").is_err());
    }
}
