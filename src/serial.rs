// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte transport used by the transfer engines.
///
/// Writes are raw: any escaping is applied by the caller. A read that sees
/// nothing within `timeout` reports `ErrorKind::TimedOut`.
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Read one byte, mapping a timeout to `None`.
    fn read_byte(&mut self, timeout: Duration) -> std::io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.read_timeout(&mut buf, timeout) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Serial, USB-CDC or RFCOMM device opened through the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
    pending: VecDeque<u8>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port, pending: VecDeque::new() })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        self.port.set_timeout(timeout)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        self.port.read(buf)
    }

    // Pull whatever the driver has buffered so byte-at-a-time parsing does not
    // cost a system call per byte.
    fn read_byte(&mut self, timeout: Duration) -> std::io::Result<Option<u8>> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }
        let mut chunk = [0u8; 256];
        self.port.set_timeout(timeout)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        match self.port.read(&mut chunk) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend(&chunk[1..n]);
                Ok(Some(chunk[0]))
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

/// Scripted port: replays `responses` (None = timeout) and checks the bytes
/// written against `expected_writes` when dropped.
#[cfg(test)]
pub struct MockSerialPort {
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    write_log: Vec<u8>,
    expected_writes: Option<Vec<u8>>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes: Some(expected_writes),
        }
    }

    /// Port that replays `responses` and checks nothing on drop.
    pub fn unchecked(responses: Vec<Option<u8>>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes: None,
        }
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        match self.read_buffer.get(self.read_pos) {
            None => Err(std::io::Error::new(ErrorKind::TimedOut, "Mock timeout")),
            Some(None) => {
                self.read_pos += 1;
                Err(std::io::Error::new(ErrorKind::TimedOut, "Mock timeout"))
            }
            Some(Some(_)) => {
                let mut bytes_read = 0;
                while bytes_read < buf.len() {
                    match self.read_buffer.get(self.read_pos) {
                        Some(Some(byte)) => {
                            buf[bytes_read] = *byte;
                            bytes_read += 1;
                            self.read_pos += 1;
                        }
                        _ => break,
                    }
                }
                Ok(bytes_read)
            }
        }
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() || self.expected_writes.is_none() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        let expected = self.expected_writes.as_deref().unwrap_or_default();
        assert_eq!(
            self.write_log.as_slice(),
            expected,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            expected.len(),
            expected,
            self.write_log.len(),
            self.write_log
        );
    }
}

/// Turn canned byte strings into mock responses.
#[cfg(test)]
pub fn script(parts: &[&[u8]]) -> Vec<Option<u8>> {
    parts.iter().flat_map(|p| p.iter().map(|&b| Some(b))).collect()
}

// ============================================================================
// Linked Port Pair for Testing
// ============================================================================

/// Lehmer generator; deterministic so lossy-link tests repeat exactly.
#[cfg(test)]
struct Lehmer(u64);

#[cfg(test)]
impl Lehmer {
    fn next(&mut self) -> u64 {
        self.0 = self.0 * 48271 % 0x7fff_ffff;
        self.0
    }
}

/// One end of an in-process full-duplex link.
#[cfg(test)]
pub struct LinkEnd {
    tx: std::sync::mpsc::Sender<u8>,
    rx: std::sync::mpsc::Receiver<u8>,
    noise: Option<(Lehmer, u64)>,
}

/// Two connected ends; bytes written to one are read from the other.
#[cfg(test)]
pub struct LinkPair;

#[cfg(test)]
impl LinkPair {
    pub fn clean() -> (LinkEnd, LinkEnd) {
        Self::build(None, None)
    }

    /// Link that flips one bit in roughly one byte out of `one_in`, both ways.
    pub fn lossy(one_in: u64, seed: u64) -> (LinkEnd, LinkEnd) {
        Self::build(
            Some((Lehmer(seed.max(1)), one_in)),
            Some((Lehmer((seed ^ 0x5bd1e995).max(1)), one_in)),
        )
    }

    fn build(a: Option<(Lehmer, u64)>, b: Option<(Lehmer, u64)>) -> (LinkEnd, LinkEnd) {
        let (a_tx, b_rx) = std::sync::mpsc::channel();
        let (b_tx, a_rx) = std::sync::mpsc::channel();
        (
            LinkEnd { tx: a_tx, rx: a_rx, noise: a },
            LinkEnd { tx: b_tx, rx: b_rx, noise: b },
        )
    }
}

#[cfg(test)]
impl SerialPort for LinkEnd {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for &byte in buf {
            let byte = match &mut self.noise {
                Some((rng, one_in)) => {
                    if rng.next() % *one_in == 0 { byte ^ (1 << (rng.next() % 8)) } else { byte }
                }
                None => byte,
            };
            // The far end may already have finished; its bytes go nowhere.
            let _ = self.tx.send(byte);
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        use std::sync::mpsc::RecvTimeoutError;

        if buf.is_empty() {
            return Ok(0);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(byte) => buf[0] = byte,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "link timeout"));
            }
        }
        let mut n = 1;
        while n < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_byte_maps_timeout_to_none() {
        let mut port = MockSerialPort::new(vec![None, Some(0x42)], vec![]);
        assert_eq!(port.read_byte(Duration::from_millis(1)).unwrap(), None);
        assert_eq!(port.read_byte(Duration::from_millis(1)).unwrap(), Some(0x42));
    }

    #[test]
    fn test_link_pair_is_full_duplex() {
        let (mut a, mut b) = LinkPair::clean();
        a.write_all(b"ping").unwrap();
        b.write_all(b"pong").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(b.read_timeout(&mut buf, Duration::from_millis(100)).unwrap(), 4);
        assert_eq!(&buf, b"ping");
        assert_eq!(a.read_timeout(&mut buf, Duration::from_millis(100)).unwrap(), 4);
        assert_eq!(&buf, b"pong");
        assert_eq!(a.read_byte(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn test_lossy_link_flips_some_bytes() {
        let (mut a, mut b) = LinkPair::lossy(10, 7);
        let sent = vec![0u8; 1000];
        a.write_all(&sent).unwrap();

        let mut received = Vec::new();
        while let Some(byte) = b.read_byte(Duration::from_millis(5)).unwrap() {
            received.push(byte);
        }

        assert_eq!(received.len(), sent.len());
        let flipped = received.iter().filter(|&&b| b != 0).count();
        assert!(flipped > 0 && flipped < 300, "flipped {} bytes", flipped);
        assert!(received.iter().all(|b| b.count_ones() <= 1));
    }
}
