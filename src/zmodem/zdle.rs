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

//! ZDLE control-quote escaping
//!
//! Flow-control bytes, the escape byte itself and a CR following '@' are
//! sent as ZDLE plus the byte with bit 6 toggled. In escape-all mode every
//! control character is quoted as well.

use std::fmt;

use crate::policy::CancelRun;
use crate::protocol::*;

// ============================================================================
// Frame-end markers
// ============================================================================

/// Marker closing a data subpacket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    /// Frame ends, a header follows
    CrcE,
    /// Frame continues, no acknowledgment wanted
    CrcG,
    /// Frame continues, acknowledgment wanted
    CrcQ,
    /// Frame ends, acknowledgment wanted
    CrcW,
}

impl FrameEnd {
    pub const ALL: [FrameEnd; 4] = [FrameEnd::CrcE, FrameEnd::CrcG, FrameEnd::CrcQ, FrameEnd::CrcW];

    pub fn code(self) -> u8 {
        match self {
            FrameEnd::CrcE => ZCRCE,
            FrameEnd::CrcG => ZCRCG,
            FrameEnd::CrcQ => ZCRCQ,
            FrameEnd::CrcW => ZCRCW,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            ZCRCE => Some(FrameEnd::CrcE),
            ZCRCG => Some(FrameEnd::CrcG),
            ZCRCQ => Some(FrameEnd::CrcQ),
            ZCRCW => Some(FrameEnd::CrcW),
            _ => None,
        }
    }

    /// True when the data frame is over and a header comes next.
    pub fn ends_frame(self) -> bool {
        matches!(self, FrameEnd::CrcE | FrameEnd::CrcW)
    }

    pub fn wants_ack(self) -> bool {
        matches!(self, FrameEnd::CrcQ | FrameEnd::CrcW)
    }
}

impl fmt::Display for FrameEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameEnd::CrcE => "ZCRCE",
            FrameEnd::CrcG => "ZCRCG",
            FrameEnd::CrcQ => "ZCRCQ",
            FrameEnd::CrcW => "ZCRCW",
        };
        f.write_str(name)
    }
}

fn is_flow_control(byte: u8) -> bool {
    matches!(byte & 0x7F, XON | XOFF)
}

// ============================================================================
// Encoder
// ============================================================================

/// Escapes outgoing bytes. Remembers the previous byte for the "@" CR rule.
#[derive(Debug, Clone)]
pub struct Encoder {
    escape_all: bool,
    last: u8,
}

impl Encoder {
    pub fn new(escape_all: bool) -> Self {
        Encoder { escape_all, last: 0 }
    }

    pub fn escape_all(&self) -> bool {
        self.escape_all
    }

    pub fn set_escape_all(&mut self, escape_all: bool) {
        self.escape_all = escape_all;
    }

    fn needs_escape(&self, raw: u8) -> bool {
        match raw & 0x7F {
            ZDLE | DLE | XON | XOFF => true,
            CR => self.escape_all || self.last & 0x7F == b'@',
            low => self.escape_all && low & 0x60 == 0,
        }
    }

    /// Encode one byte into one or two wire bytes.
    pub fn encode_byte(&mut self, raw: u8) -> Escaped {
        let escaped = if self.needs_escape(raw) {
            Escaped { bytes: [ZDLE, raw ^ 0x40], len: 2 }
        } else {
            Escaped { bytes: [raw, 0], len: 1 }
        };
        self.last = raw;
        escaped
    }

    pub fn encode_into(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for &raw in data {
            out.extend_from_slice(self.encode_byte(raw).as_slice());
        }
    }
}

/// Wire form of one encoded byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escaped {
    bytes: [u8; 2],
    len: usize,
}

impl Escaped {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// What one received wire byte turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeEvent {
    Data(u8),
    FrameEnd(FrameEnd),
    /// A ZDLE; the next byte completes the escape
    EscapeStarted,
    /// Unescaped flow control, dropped
    Ignored,
    /// ZDLE followed by a byte that is neither a valid escape nor a frame end
    Invalid(u8),
    /// Five CAN bytes in a row
    Abort,
}

/// Stateful ZDLE decoder. The cancel-run check runs on every byte.
#[derive(Debug, Clone)]
pub struct Decoder {
    escape_pending: bool,
    cancels: CancelRun,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder { escape_pending: false, cancels: CancelRun::new(Z_CANCEL_RUN) }
    }

    pub fn escape_pending(&self) -> bool {
        self.escape_pending
    }

    /// Drop a half-finished escape before scanning for a new frame.
    pub fn clear_escape(&mut self) {
        self.escape_pending = false;
    }

    /// Count a byte read outside the escape decoder (header scanning, hex
    /// digits). True when it completes a cancel run.
    pub fn observe_raw(&mut self, wire: u8) -> bool {
        if self.cancels.observe(wire) {
            self.escape_pending = false;
            true
        } else {
            false
        }
    }

    pub fn decode_event(&mut self, wire: u8) -> DecodeEvent {
        if self.observe_raw(wire) {
            return DecodeEvent::Abort;
        }

        if !self.escape_pending {
            return match wire {
                ZDLE => {
                    self.escape_pending = true;
                    DecodeEvent::EscapeStarted
                }
                b if is_flow_control(b) => DecodeEvent::Ignored,
                b => DecodeEvent::Data(b),
            };
        }

        match wire {
            // Part of a cancel run; stay in the escape.
            ZDLE => DecodeEvent::EscapeStarted,
            b if is_flow_control(b) => DecodeEvent::Ignored,
            b => {
                self.escape_pending = false;
                if let Some(end) = FrameEnd::from_code(b) {
                    DecodeEvent::FrameEnd(end)
                } else if b == ZRUB0 {
                    DecodeEvent::Data(0x7F)
                } else if b == ZRUB1 {
                    DecodeEvent::Data(0xFF)
                } else if b & 0x60 == 0x40 {
                    DecodeEvent::Data(b ^ 0x40)
                } else {
                    DecodeEvent::Invalid(b)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(decoder: &mut Decoder, wire: &[u8]) -> Vec<DecodeEvent> {
        wire.iter()
            .map(|&b| decoder.decode_event(b))
            .filter(|e| !matches!(e, DecodeEvent::EscapeStarted))
            .collect()
    }

    #[test]
    fn test_every_byte_round_trips() {
        for escape_all in [false, true] {
            for raw in 0..=255u8 {
                let mut encoder = Encoder::new(escape_all);
                let mut decoder = Decoder::new();
                let wire = encoder.encode_byte(raw);
                assert_eq!(
                    decode_all(&mut decoder, wire.as_slice()),
                    vec![DecodeEvent::Data(raw)],
                    "byte {:02X} escape_all={}",
                    raw,
                    escape_all
                );
                assert!(!decoder.escape_pending());
            }
        }
    }

    #[test]
    fn test_minimal_escape_set() {
        let mut encoder = Encoder::new(false);
        assert_eq!(encoder.encode_byte(ZDLE).as_slice(), &[ZDLE, ZDLEE]);
        assert_eq!(encoder.encode_byte(XON).as_slice(), &[ZDLE, 0x51]);
        assert_eq!(encoder.encode_byte(0x93).as_slice(), &[ZDLE, 0xD3]);
        assert_eq!(encoder.encode_byte(DLE).as_slice(), &[ZDLE, 0x50]);
        assert_eq!(encoder.encode_byte(b'A').as_slice(), b"A");
        assert_eq!(encoder.encode_byte(0x01).as_slice(), &[0x01]);
        assert_eq!(encoder.encode_byte(CR).as_slice(), &[CR]);
    }

    #[test]
    fn test_cr_after_at_sign_is_escaped() {
        let mut encoder = Encoder::new(false);
        let mut out = Vec::new();
        encoder.encode_into(b"@\r", &mut out);
        assert_eq!(out, vec![b'@', ZDLE, CR ^ 0x40]);

        out.clear();
        encoder.encode_into(b"x\r", &mut out);
        assert_eq!(out, vec![b'x', CR]);
    }

    #[test]
    fn test_escape_all_quotes_control_characters() {
        let mut encoder = Encoder::new(true);
        assert_eq!(encoder.encode_byte(0x01).as_slice(), &[ZDLE, 0x41]);
        assert_eq!(encoder.encode_byte(0x81).as_slice(), &[ZDLE, 0xC1]);
        assert_eq!(encoder.encode_byte(b' ').as_slice(), b" ");
    }

    #[test]
    fn test_decode_frame_ends_and_rubouts() {
        let mut decoder = Decoder::new();
        let events = decode_all(&mut decoder, &[ZDLE, ZCRCW, ZDLE, ZRUB0, ZDLE, ZRUB1]);
        assert_eq!(
            events,
            vec![
                DecodeEvent::FrameEnd(FrameEnd::CrcW),
                DecodeEvent::Data(0x7F),
                DecodeEvent::Data(0xFF),
            ]
        );
    }

    #[test]
    fn test_decode_skips_flow_control() {
        let mut decoder = Decoder::new();
        let events = decode_all(&mut decoder, &[b'a', XON, ZDLE, XOFF, 0x4D, 0x91]);
        assert_eq!(
            events,
            vec![DecodeEvent::Data(b'a'), DecodeEvent::Ignored, DecodeEvent::Ignored, DecodeEvent::Data(CR), DecodeEvent::Ignored]
        );
    }

    #[test]
    fn test_invalid_escape() {
        let mut decoder = Decoder::new();
        assert_eq!(decode_all(&mut decoder, &[ZDLE, b'!']), vec![DecodeEvent::Invalid(b'!')]);
        assert!(!decoder.escape_pending());
    }

    #[test]
    fn test_cancel_run_aborts_mid_escape() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode_event(b'x'), DecodeEvent::Data(b'x'));
        for _ in 0..4 {
            assert_eq!(decoder.decode_event(CAN), DecodeEvent::EscapeStarted);
        }
        assert_eq!(decoder.decode_event(CAN), DecodeEvent::Abort);
        assert!(!decoder.escape_pending());
    }

    #[test]
    fn test_escaped_can_does_not_count_toward_abort() {
        let mut encoder = Encoder::new(false);
        let mut decoder = Decoder::new();
        let mut wire = Vec::new();
        encoder.encode_into(&[CAN; 16], &mut wire);
        assert_eq!(decode_all(&mut decoder, &wire), vec![DecodeEvent::Data(CAN); 16]);
    }

    proptest! {
        #[test]
        fn prop_sequences_round_trip(data in proptest::collection::vec(any::<u8>(), 0..512), escape_all in any::<bool>()) {
            let mut encoder = Encoder::new(escape_all);
            let mut wire = Vec::new();
            encoder.encode_into(&data, &mut wire);

            let mut decoder = Decoder::new();
            let decoded: Vec<u8> = decode_all(&mut decoder, &wire)
                .into_iter()
                .map(|e| match e {
                    DecodeEvent::Data(b) => b,
                    other => panic!("unexpected event {:?}", other),
                })
                .collect();
            prop_assert_eq!(decoded, data);
        }
    }
}
