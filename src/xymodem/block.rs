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

//! XMODEM/YMODEM block framing
//!
//! A block is `SOH|STX, n, !n, payload, trailer`. The payload is 128 bytes
//! after SOH and 1024 after STX. The trailer is the modulo-256 sum in
//! checksum mode, or the CRC-16 big-endian in CRC mode.

use std::time::Duration;

use crate::checksum::{crc16, xmodem_sum_update};
use crate::error::FrameError;
use crate::protocol::*;
use crate::serial::SerialPort;

/// Bytes discarded at most while waiting for the line to go quiet
const PURGE_LIMIT: usize = 4 * BLOCK_1K_LEN;

// ============================================================================
// Check Mode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Checksum,
    Crc16,
}

impl CheckMode {
    /// Byte a receiver sends to ask for this mode
    pub fn request_byte(self) -> u8 {
        match self {
            CheckMode::Checksum => NAK,
            CheckMode::Crc16 => CRC_REQUEST,
        }
    }

    pub fn from_request(byte: u8) -> Option<Self> {
        match byte {
            NAK => Some(CheckMode::Checksum),
            CRC_REQUEST => Some(CheckMode::Crc16),
            _ => None,
        }
    }

    pub fn trailer_len(self) -> usize {
        match self {
            CheckMode::Checksum => 1,
            CheckMode::Crc16 => 2,
        }
    }

    pub fn trailer(self, payload: &[u8]) -> Vec<u8> {
        match self {
            CheckMode::Checksum => vec![xmodem_sum_update(0, payload)],
            CheckMode::Crc16 => crc16(payload).to_be_bytes().to_vec(),
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Frame `payload` as block `number`, padded with `pad`.
///
/// Payloads longer than 128 bytes go out as a 1024-byte STX block; anything
/// past 1024 bytes is dropped.
pub fn encode_block(number: u8, payload: &[u8], pad: u8, mode: CheckMode) -> Vec<u8> {
    let size = if payload.len() > BLOCK_LEN { BLOCK_1K_LEN } else { BLOCK_LEN };
    let payload = &payload[..payload.len().min(size)];

    let mut out = Vec::with_capacity(3 + size + mode.trailer_len());
    out.push(if size == BLOCK_LEN { SOH } else { STX });
    out.push(number);
    out.push(!number);

    let start = out.len();
    out.extend_from_slice(payload);
    out.resize(start + size, pad);

    let trailer = mode.trailer(&out[start..]);
    out.extend(trailer);
    out
}

// ============================================================================
// Decoding
// ============================================================================

/// What arrived in place of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Block { number: u8, data: Vec<u8> },
    EndOfFile,
    /// SOH or STX arrived but the rest stalled or failed its check
    Damaged,
}

/// Read one block, or the EOT that ends a file.
///
/// `first_timeout` bounds the wait for the leading byte; the rest of the
/// block must follow within `byte_timeout` per byte. CAN CAN is reported as
/// `FrameError::Abort`; any other stray lead byte as `FrameError::Corrupt`.
pub fn read_block(
    port: &mut dyn SerialPort,
    mode: CheckMode,
    first_timeout: Duration,
    byte_timeout: Duration,
) -> Result<Incoming, FrameError> {
    let lead = port.read_byte(first_timeout)?.ok_or(FrameError::TimedOut)?;
    let size = match lead {
        SOH => BLOCK_LEN,
        STX => BLOCK_1K_LEN,
        EOT => return Ok(Incoming::EndOfFile),
        CAN => {
            return match port.read_byte(byte_timeout)? {
                Some(CAN) => Err(FrameError::Abort),
                _ => Err(FrameError::Corrupt),
            };
        }
        _ => return Err(FrameError::Corrupt),
    };

    let mut body = vec![0u8; 2 + size + mode.trailer_len()];
    for slot in body.iter_mut() {
        match port.read_byte(byte_timeout)? {
            Some(byte) => *slot = byte,
            None => return Ok(Incoming::Damaged),
        }
    }

    let (number, complement) = (body[0], body[1]);
    if number != !complement {
        return Ok(Incoming::Damaged);
    }
    let (data, trailer) = body[2..].split_at(size);
    if mode.trailer(data) != trailer {
        return Ok(Incoming::Damaged);
    }

    Ok(Incoming::Block { number, data: data.to_vec() })
}

/// Drain the line until it stays quiet for `quiet`.
pub fn purge(port: &mut dyn SerialPort, quiet: Duration) -> Result<usize, FrameError> {
    let mut dropped = 0;
    while dropped < PURGE_LIMIT && port.read_byte(quiet)?.is_some() {
        dropped += 1;
    }
    Ok(dropped)
}

// ============================================================================
// YMODEM Block 0
// ============================================================================

/// Name and length announced in a YMODEM block 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub length: Option<u64>,
}

/// `name NUL length`; the caller pads with NUL.
pub fn encode_file_header(name: &str, length: u64) -> Vec<u8> {
    let mut out = name.as_bytes().to_vec();
    out.push(0);
    out.extend_from_slice(length.to_string().as_bytes());
    out
}

/// Parse a block 0 payload. `None` means the empty name that ends a batch.
pub fn parse_file_header(data: &[u8]) -> Option<FileHeader> {
    let name_end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    if name_end == 0 {
        return None;
    }
    let name = String::from_utf8_lossy(&data[..name_end]).into_owned();

    let rest = data.get(name_end + 1..).unwrap_or(&[]);
    let digits: Vec<u8> = rest.iter().copied().take_while(u8::is_ascii_digit).collect();
    let length = std::str::from_utf8(&digits).ok().and_then(|s| s.parse().ok());

    Some(FileHeader { name, length })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{script, MockSerialPort};
    use proptest::prelude::*;

    const T: Duration = Duration::from_millis(10);

    fn read_from(wire: &[u8], mode: CheckMode) -> Result<Incoming, FrameError> {
        let mut port = MockSerialPort::unchecked(script(&[wire]));
        read_block(&mut port, mode, T, T)
    }

    #[test]
    fn test_checksum_block_layout() {
        let block = encode_block(1, b"abc", SUB, CheckMode::Checksum);
        assert_eq!(block.len(), 3 + 128 + 1);
        assert_eq!(&block[..6], &[SOH, 0x01, 0xFE, b'a', b'b', b'c']);
        assert!(block[6..131].iter().all(|&b| b == SUB));

        let expected = (b'a' as u32 + b'b' as u32 + b'c' as u32 + 125 * SUB as u32) as u8;
        assert_eq!(block[131], expected);
    }

    #[test]
    fn test_crc_block_trailer_is_big_endian() {
        let block = encode_block(0xFF, &[0u8; 128], SUB, CheckMode::Crc16);
        assert_eq!(&block[..3], &[SOH, 0xFF, 0x00]);
        let crc = crc16(&[0u8; 128]);
        assert_eq!(&block[131..], &[(crc >> 8) as u8, crc as u8]);
    }

    #[test]
    fn test_long_payload_uses_stx() {
        let block = encode_block(2, &[7u8; 129], SUB, CheckMode::Crc16);
        assert_eq!(block[0], STX);
        assert_eq!(block.len(), 3 + 1024 + 2);
        assert_eq!(block[3 + 129], SUB);
    }

    #[test]
    fn test_read_block_both_sizes() {
        for payload in [&b"short"[..], &[0x42u8; 1000][..]] {
            for mode in [CheckMode::Checksum, CheckMode::Crc16] {
                let wire = encode_block(9, payload, SUB, mode);
                match read_from(&wire, mode).unwrap() {
                    Incoming::Block { number, data } => {
                        assert_eq!(number, 9);
                        assert_eq!(&data[..payload.len()], payload);
                        assert_eq!(data.len(), wire.len() - 3 - mode.trailer_len());
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_read_block_rejects_bad_complement_and_check() {
        let mut wire = encode_block(3, b"data", SUB, CheckMode::Crc16);
        wire[2] = 0x00;
        assert_eq!(read_from(&wire, CheckMode::Crc16).unwrap(), Incoming::Damaged);

        let mut wire = encode_block(3, b"data", SUB, CheckMode::Checksum);
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(read_from(&wire, CheckMode::Checksum).unwrap(), Incoming::Damaged);
    }

    #[test]
    fn test_read_block_control_bytes() {
        assert_eq!(read_from(&[EOT], CheckMode::Crc16).unwrap(), Incoming::EndOfFile);
        assert!(matches!(read_from(&[CAN, CAN], CheckMode::Crc16), Err(FrameError::Abort)));
        assert!(matches!(read_from(&[CAN, b'x'], CheckMode::Crc16), Err(FrameError::Corrupt)));
        assert!(matches!(read_from(&[b'?'], CheckMode::Crc16), Err(FrameError::Corrupt)));
        assert!(matches!(read_from(&[], CheckMode::Crc16), Err(FrameError::TimedOut)));
    }

    #[test]
    fn test_short_block_is_damaged() {
        let wire = encode_block(1, b"data", SUB, CheckMode::Crc16);
        assert_eq!(read_from(&wire[..60], CheckMode::Crc16).unwrap(), Incoming::Damaged);
    }

    #[test]
    fn test_purge_stops_at_quiet_line() {
        let mut responses = script(&[b"noise"]);
        responses.push(None);
        responses.extend(script(&[&[SOH]]));
        let mut port = MockSerialPort::unchecked(responses);
        assert_eq!(purge(&mut port, T).unwrap(), 5);
        assert_eq!(port.read_byte(T).unwrap(), Some(SOH));
    }

    #[test]
    fn test_file_header() {
        let payload = encode_file_header("notes.txt", 1234);
        assert_eq!(payload, b"notes.txt\x001234");

        let mut block_data = payload.clone();
        block_data.resize(128, 0);
        assert_eq!(
            parse_file_header(&block_data),
            Some(FileHeader { name: "notes.txt".into(), length: Some(1234) })
        );

        let with_extras = b"a.bin\x0042 14247523115 100644\x00";
        assert_eq!(parse_file_header(with_extras).unwrap().length, Some(42));

        assert_eq!(parse_file_header(b"bare\x00\x00").unwrap().length, None);
        assert_eq!(parse_file_header(&[0u8; 128]), None);
    }

    proptest! {
        #[test]
        fn prop_single_bit_flip_detected(
            payload in proptest::collection::vec(any::<u8>(), 1..1024),
            number in any::<u8>(),
            crc in any::<bool>(),
            pos in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mode = if crc { CheckMode::Crc16 } else { CheckMode::Checksum };
            let mut wire = encode_block(number, &payload, SUB, mode);
            let i = pos.index(wire.len());
            wire[i] ^= 1 << bit;
            prop_assert!(!matches!(read_from(&wire, mode), Ok(Incoming::Block { .. })), "corrupted block was accepted");
        }
    }
}
