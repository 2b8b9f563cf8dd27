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

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::checksum::{crc16, crc32};
use crate::error::FrameError;
use crate::protocol::*;
use crate::serial::SerialPort;
use super::zdle::{DecodeEvent, Decoder, Encoder};

/// Junk bytes tolerated while hunting for a header before giving up.
const GARBAGE_LIMIT: usize = 16 * 1024;

// ============================================================================
// Frame Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    RqInit = 0,
    RInit = 1,
    SInit = 2,
    Ack = 3,
    File = 4,
    Skip = 5,
    Nak = 6,
    Abort = 7,
    Fin = 8,
    RPos = 9,
    Data = 10,
    Eof = 11,
    FErr = 12,
    Crc = 13,
    Challenge = 14,
    Compl = 15,
    Can = 16,
    FreeCnt = 17,
    Command = 18,
    Stderr = 19,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use FrameType::*;
        const TYPES: [FrameType; 20] = [
            RqInit, RInit, SInit, Ack, File, Skip, Nak, Abort, Fin, RPos,
            Data, Eof, FErr, Crc, Challenge, Compl, Can, FreeCnt, Command, Stderr,
        ];
        TYPES.get(value as usize).copied()
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::RqInit => "ZRQINIT",
            FrameType::RInit => "ZRINIT",
            FrameType::SInit => "ZSINIT",
            FrameType::Ack => "ZACK",
            FrameType::File => "ZFILE",
            FrameType::Skip => "ZSKIP",
            FrameType::Nak => "ZNAK",
            FrameType::Abort => "ZABORT",
            FrameType::Fin => "ZFIN",
            FrameType::RPos => "ZRPOS",
            FrameType::Data => "ZDATA",
            FrameType::Eof => "ZEOF",
            FrameType::FErr => "ZFERR",
            FrameType::Crc => "ZCRC",
            FrameType::Challenge => "ZCHALLENGE",
            FrameType::Compl => "ZCOMPL",
            FrameType::Can => "ZCAN",
            FrameType::FreeCnt => "ZFREECNT",
            FrameType::Command => "ZCOMMAND",
            FrameType::Stderr => "ZSTDERR",
        };
        f.write_str(name)
    }
}

/// Wire form of a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Hex,
    Bin16,
    Bin32,
}

impl Encoding {
    /// Whether data subpackets governed by this header carry a 32-bit CRC.
    pub fn wide(self) -> bool {
        self == Encoding::Bin32
    }

    fn marker(self) -> u8 {
        match self {
            Encoding::Hex => ZHEX,
            Encoding::Bin16 => ZBIN,
            Encoding::Bin32 => ZBIN32,
        }
    }
}

// ============================================================================
// Header
// ============================================================================

/// Frame type plus four data bytes.
///
/// The data bytes are `ZP0..ZP3` in wire order. Read as a position they form
/// a little-endian u32; read as flags `ZF0` is the last byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub frame_type: FrameType,
    pub data: [u8; 4],
}

impl Header {
    pub fn new(frame_type: FrameType, value: u32) -> Self {
        Header { frame_type, data: value.to_le_bytes() }
    }

    /// Header carrying flag bytes `ZF0..ZF3`.
    pub fn with_flags(frame_type: FrameType, flags: [u8; 4]) -> Self {
        Header { frame_type, data: [flags[3], flags[2], flags[1], flags[0]] }
    }

    pub fn value(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }

    pub fn zf0(&self) -> u8 {
        self.data[3]
    }

    pub fn zf1(&self) -> u8 {
        self.data[2]
    }

    fn body(&self) -> [u8; 5] {
        let [a, b, c, d] = self.data;
        [self.frame_type as u8, a, b, c, d]
    }

    fn from_body(body: &[u8]) -> Result<Self, FrameError> {
        let frame_type = FrameType::from_u8(body[0]).ok_or(FrameError::Corrupt)?;
        Ok(Header { frame_type, data: [body[1], body[2], body[3], body[4]] })
    }

    pub fn encode(&self, encoding: Encoding, encoder: &mut Encoder) -> Vec<u8> {
        let body = self.body();
        let mut out = Vec::with_capacity(24);

        match encoding {
            Encoding::Hex => {
                out.extend_from_slice(&[ZPAD, ZPAD, ZDLE, ZHEX]);
                let crc = crc16(&body);
                for byte in body.iter().chain(crc.to_be_bytes().iter()) {
                    push_hex(&mut out, *byte);
                }
                out.push(CR);
                out.push(LF);
                if !matches!(self.frame_type, FrameType::Ack | FrameType::Fin) {
                    out.push(XON);
                }
            }
            Encoding::Bin16 | Encoding::Bin32 => {
                out.extend_from_slice(&[ZPAD, ZDLE, encoding.marker()]);
                encoder.encode_into(&body, &mut out);
                if encoding == Encoding::Bin32 {
                    encoder.encode_into(&crc32(&body).to_le_bytes(), &mut out);
                } else {
                    encoder.encode_into(&crc16(&body).to_be_bytes(), &mut out);
                }
            }
        }
        out
    }

    /// Parse a hex header captured as text, e.g. by a front end that saw it
    /// arrive before the engine started. Leading pad, ZDLE and 'B' are
    /// optional.
    pub fn parse_hex(text: &[u8]) -> Result<Header, FrameError> {
        let start = text
            .iter()
            .position(|&b| !matches!(b, ZPAD | ZDLE | ZHEX))
            .ok_or(FrameError::Corrupt)?;
        let digits = text.get(start..start + 14).ok_or(FrameError::Corrupt)?;

        let mut raw = [0u8; 7];
        for (slot, pair) in raw.iter_mut().zip(digits.chunks(2)) {
            *slot = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
        }
        verify_crc16(&raw)?;
        Header::from_body(&raw[..5])
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:08X}", self.frame_type, self.value())
    }
}

fn push_hex(out: &mut Vec<u8>, byte: u8) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    out.push(DIGITS[(byte >> 4) as usize]);
    out.push(DIGITS[(byte & 0x0F) as usize]);
}

fn hex_value(digit: u8) -> Result<u8, FrameError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        _ => Err(FrameError::Corrupt),
    }
}

fn verify_crc16(raw: &[u8; 7]) -> Result<(), FrameError> {
    if crc16(&raw[..5]).to_be_bytes() == raw[5..7] {
        Ok(())
    } else {
        Err(FrameError::Corrupt)
    }
}

// ============================================================================
// Reading and writing
// ============================================================================

pub fn write_header(
    port: &mut dyn SerialPort,
    header: &Header,
    encoding: Encoding,
    encoder: &mut Encoder,
) -> std::io::Result<()> {
    debug!("send {} ({:?})", header, encoding);
    port.write_all(&header.encode(encoding, encoder))
}

fn next_byte(port: &mut dyn SerialPort, timeout: Duration) -> Result<u8, FrameError> {
    port.read_byte(timeout)?.ok_or(FrameError::TimedOut)
}

/// Scan for a header and read it.
///
/// `first_timeout` bounds the wait for each byte while hunting for the pad
/// sequence; `byte_timeout` bounds each byte of the header body.
pub fn read_header(
    port: &mut dyn SerialPort,
    decoder: &mut Decoder,
    first_timeout: Duration,
    byte_timeout: Duration,
) -> Result<(Header, Encoding), FrameError> {
    decoder.clear_escape();
    let encoding = scan_for_header(port, decoder, first_timeout)?;

    let header = match encoding {
        Encoding::Hex => read_hex_body(port, decoder, byte_timeout)?,
        Encoding::Bin16 => {
            let raw = read_binary(port, decoder, 7, byte_timeout)?;
            if crc16(&raw[..5]).to_be_bytes() != raw[5..7] {
                return Err(FrameError::Corrupt);
            }
            Header::from_body(&raw[..5])?
        }
        Encoding::Bin32 => {
            let raw = read_binary(port, decoder, 9, byte_timeout)?;
            if crc32(&raw[..5]).to_le_bytes() != raw[5..9] {
                return Err(FrameError::Corrupt);
            }
            Header::from_body(&raw[..5])?
        }
    };

    debug!("recv {} ({:?})", header, encoding);
    Ok((header, encoding))
}

enum Scan {
    Idle,
    Pad,
    Dle,
}

fn scan_for_header(
    port: &mut dyn SerialPort,
    decoder: &mut Decoder,
    timeout: Duration,
) -> Result<Encoding, FrameError> {
    let mut state = Scan::Idle;
    let mut garbage = 0usize;

    loop {
        let byte = next_byte(port, timeout)?;
        if decoder.observe_raw(byte) {
            return Err(FrameError::Abort);
        }
        if matches!(byte & 0x7F, XON | XOFF) {
            continue;
        }

        state = match (state, byte) {
            (Scan::Idle | Scan::Pad, ZPAD) => Scan::Pad,
            (Scan::Pad, ZDLE) => Scan::Dle,
            // A cancel run looks like repeated ZDLE.
            (Scan::Dle, ZDLE) => Scan::Dle,
            (Scan::Dle, ZHEX) => return Ok(Encoding::Hex),
            (Scan::Dle, ZBIN) => return Ok(Encoding::Bin16),
            (Scan::Dle, ZBIN32) => return Ok(Encoding::Bin32),
            _ => {
                garbage += 1;
                if garbage > GARBAGE_LIMIT {
                    return Err(FrameError::Corrupt);
                }
                Scan::Idle
            }
        };
    }
}

fn read_hex_body(
    port: &mut dyn SerialPort,
    decoder: &mut Decoder,
    timeout: Duration,
) -> Result<Header, FrameError> {
    let mut digits = [0u8; 14];
    for slot in digits.iter_mut() {
        let byte = next_byte(port, timeout)?;
        if decoder.observe_raw(byte) {
            return Err(FrameError::Abort);
        }
        *slot = byte;
    }
    let header = Header::parse_hex(&digits)?;

    // Optional CR LF trailer; an XON after it is dropped by the decoder later.
    if let Some(byte) = port.read_byte(timeout)? {
        if byte & 0x7F == CR {
            port.read_byte(timeout)?;
        }
    }
    Ok(header)
}

fn read_binary(
    port: &mut dyn SerialPort,
    decoder: &mut Decoder,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, FrameError> {
    let mut raw = Vec::with_capacity(len);
    while raw.len() < len {
        match decoder.decode_event(next_byte(port, timeout)?) {
            DecodeEvent::Data(byte) => raw.push(byte),
            DecodeEvent::EscapeStarted | DecodeEvent::Ignored => {}
            DecodeEvent::FrameEnd(_) | DecodeEvent::Invalid(_) => return Err(FrameError::Corrupt),
            DecodeEvent::Abort => return Err(FrameError::Abort),
        }
    }
    Ok(raw)
}
