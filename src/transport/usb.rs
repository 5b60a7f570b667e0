//! USB bulk-pipe `Transport`, backed by `nusb`.
//!
//! Claims the board's interface via `nusb` and drives it with
//! `futures_lite::future::block_on` over the crate's async transfer API,
//! narrowed to the two endpoints this board exposes.

use std::time::Duration;

use futures_lite::future::block_on;

use crate::{Error, Result, TransportFault};
use super::{DiscoveredTransport, DiscoveredKind, DEFAULT_TIMEOUT_MS};

/// Bulk IN endpoint.
const ENDPOINT_BULK_IN: u8 = 0x81;
/// Bulk OUT endpoint.
const ENDPOINT_BULK_OUT: u8 = 0x02;
/// Max packet size for both endpoints.
const MAX_PACKET_SIZE: usize = 512;

const VENDOR_ID: u16 = 0x0403; // FTDI-style vendor id, matches the board's FIFO bridge
const PRODUCT_ID: u16 = 0x6014;

pub fn enumerate(max_devices: usize) -> Result<Vec<DiscoveredTransport>> {
    let devices = block_on(async {
        nusb::list_devices()
    }).map_err(|e| Error::Other(Box::new(e)))?;

    let mut found = Vec::new();
    for info in devices.filter(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID) {
        let description = info.serial_number()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("usb-{}-{}", info.bus_number(), info.device_address()));
        found.push(DiscoveredTransport {
            description,
            kind: DiscoveredKind::Usb { bus: info.bus_number(), address: info.device_address() },
        });
        if found.len() >= max_devices {
            break;
        }
    }
    Ok(found)
}

#[derive(Debug)]
pub struct UsbTransport {
    description: String,
    interface: nusb::Interface,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl UsbTransport {
    pub fn open(bus: u8, address: u8) -> Result<UsbTransport> {
        let info = block_on(async { nusb::list_devices() })
            .map_err(|e| Error::Other(Box::new(e)))?
            .find(|d| d.bus_number() == bus && d.device_address() == address)
            .ok_or(Error::NotFound)?;
        let description = info.serial_number()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("usb-{}-{}", bus, address));
        let device = block_on(info.open()).map_err(|e| Error::Other(Box::new(e)))?;
        let interface = block_on(device.claim_interface(0))
            .map_err(|e| Error::Other(Box::new(e)))?;
        Ok(UsbTransport {
            description,
            interface,
            read_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            write_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        })
    }
}

/// Runs `fut` to completion on this thread (via `block_on`), but bounds the
/// wait to `timeout` by racing it against a background timer thread. Used
/// instead of a bare `block_on` because `nusb`'s transfer futures have no
/// built-in deadline; this bounds raw USB stalls independent of the
/// board's own firmware protocol round-trip timing.
fn block_on_with_timeout<T, F>(fut: F, timeout: Duration) -> Option<T>
        where F: std::future::Future<Output = T> + Send + 'static, T: Send + 'static {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(block_on(fut));
    });
    rx.recv_timeout(timeout).ok()
}

impl super::Transport for UsbTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        for chunk in bytes.chunks(MAX_PACKET_SIZE) {
            let fut = self.interface.bulk_out(ENDPOINT_BULK_OUT, chunk.to_vec());
            match block_on_with_timeout(fut, self.write_timeout) {
                Some(result) => {
                    result.status.map_err(|e| Error::Other(Box::new(e)))?;
                }
                None => return Err(Error::Transport {
                    board: None,
                    kind: TransportFault::Timeout,
                }),
            }
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let want = (buf.len() - filled).min(MAX_PACKET_SIZE);
            let fut = self.interface.bulk_in(ENDPOINT_BULK_IN, nusb::transfer::RequestBuffer::new(want));
            match block_on_with_timeout(fut, self.read_timeout) {
                Some(result) => {
                    let data = result.data;
                    if data.is_empty() {
                        return Err(Error::Transport { board: None, kind: TransportFault::Closed });
                    }
                    let n = data.len().min(buf.len() - filled);
                    buf[filled..filled + n].copy_from_slice(&data[..n]);
                    filled += n;
                }
                None => return Err(Error::Transport {
                    board: None,
                    kind: TransportFault::Partial { expected: buf.len(), got: filled },
                }),
            }
        }
        Ok(())
    }

    fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) {
        self.read_timeout = Duration::from_millis(read_ms);
        self.write_timeout = Duration::from_millis(write_ms);
    }

    fn flush_input(&mut self) -> Result<()> {
        // Drain whatever is already buffered in the bulk IN pipe without blocking for long;
        // a short timeout is used instead of zero because some hosts need one polling interval
        // to report "nothing pending".
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let saved = self.read_timeout;
        self.set_timeouts(10, self.write_timeout.as_millis() as u64);
        loop {
            match self.read_exact(&mut scratch[..1]) {
                Ok(()) => continue,
                Err(_) => break,
            }
        }
        self.read_timeout = saved;
        Ok(())
    }

    fn description(&self) -> &str {
        &self.description
    }
}
