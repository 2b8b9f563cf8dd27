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

use std::time::Duration;

use crate::checksum::FrameCheck;
use crate::error::FrameError;
use crate::protocol::ZDLE;
use crate::serial::SerialPort;
use super::zdle::{DecodeEvent, Decoder, Encoder, FrameEnd};

/// A verified data subpacket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subpacket {
    pub data: Vec<u8>,
    pub end: FrameEnd,
}

/// Escaped payload, ZDLE and frame-end letter, then the escaped CRC.
///
/// The CRC covers the unescaped payload followed by the frame-end letter.
pub fn encode_subpacket(data: &[u8], end: FrameEnd, wide: bool, encoder: &mut Encoder) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 8);
    encoder.encode_into(data, &mut out);
    out.push(ZDLE);
    out.push(end.code());

    let mut check = FrameCheck::new(wide);
    check.update(data);
    check.update(&[end.code()]);
    encoder.encode_into(&check.trailer(), &mut out);
    out
}

pub fn write_subpacket(
    port: &mut dyn SerialPort,
    data: &[u8],
    end: FrameEnd,
    wide: bool,
    encoder: &mut Encoder,
) -> std::io::Result<()> {
    port.write_all(&encode_subpacket(data, end, wide, encoder))
}

/// Read one subpacket of at most `max_len` payload bytes.
pub fn read_subpacket(
    port: &mut dyn SerialPort,
    decoder: &mut Decoder,
    max_len: usize,
    wide: bool,
    timeout: Duration,
) -> Result<Subpacket, FrameError> {
    let mut data = Vec::with_capacity(max_len.min(8192));
    let mut check = FrameCheck::new(wide);

    let end = loop {
        let byte = port.read_byte(timeout)?.ok_or(FrameError::TimedOut)?;
        match decoder.decode_event(byte) {
            DecodeEvent::Data(b) => {
                if data.len() == max_len {
                    return Err(FrameError::Overrun(max_len));
                }
                data.push(b);
            }
            DecodeEvent::FrameEnd(end) => break end,
            DecodeEvent::EscapeStarted | DecodeEvent::Ignored => {}
            DecodeEvent::Invalid(_) => return Err(FrameError::Corrupt),
            DecodeEvent::Abort => return Err(FrameError::Abort),
        }
    };

    check.update(&data);
    check.update(&[end.code()]);

    let trailer_len = check.trailer_len();
    let mut received = Vec::with_capacity(trailer_len);
    while received.len() < trailer_len {
        let byte = port.read_byte(timeout)?.ok_or(FrameError::TimedOut)?;
        match decoder.decode_event(byte) {
            DecodeEvent::Data(b) => received.push(b),
            DecodeEvent::EscapeStarted | DecodeEvent::Ignored => {}
            DecodeEvent::FrameEnd(_) | DecodeEvent::Invalid(_) => return Err(FrameError::Corrupt),
            DecodeEvent::Abort => return Err(FrameError::Abort),
        }
    }

    if check.trailer() != received {
        return Err(FrameError::Corrupt);
    }
    Ok(Subpacket { data, end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CAN, XON, ZCRCE};
    use crate::serial::{script, MockSerialPort};
    use proptest::prelude::*;

    const T: Duration = Duration::from_millis(10);

    fn read_from(wire: &[u8], max_len: usize, wide: bool) -> Result<Subpacket, FrameError> {
        let mut port = MockSerialPort::unchecked(script(&[wire]));
        read_subpacket(&mut port, &mut Decoder::new(), max_len, wide, T)
    }

    #[test]
    fn test_crc32_subpacket_bytes() {
        let wire = encode_subpacket(b"a\n", FrameEnd::CrcE, true, &mut Encoder::new(false));
        assert_eq!(wire, vec![0x61, 0x0A, ZDLE, ZCRCE, 0xE5, 0x79, 0xD2, 0x0F]);
    }

    #[test]
    fn test_write_subpacket_escapes_payload() {
        let mut port = MockSerialPort::new(vec![], {
            let mut expected = vec![b'x', ZDLE, CAN ^ 0x40, ZDLE, b'i'];
            let mut check = FrameCheck::new(false);
            check.update(&[b'x', CAN, b'i']);
            expected.extend(check.trailer());
            expected
        });
        write_subpacket(&mut port, &[b'x', CAN], FrameEnd::CrcG, false, &mut Encoder::new(false)).unwrap();
    }

    #[test]
    fn test_empty_subpacket() {
        let wire = encode_subpacket(&[], FrameEnd::CrcW, false, &mut Encoder::new(false));
        let packet = read_from(&wire, 1024, false).unwrap();
        assert!(packet.data.is_empty());
        assert_eq!(packet.end, FrameEnd::CrcW);
    }

    #[test]
    fn test_overrun() {
        let wire = encode_subpacket(&[7u8; 65], FrameEnd::CrcG, false, &mut Encoder::new(false));
        assert!(matches!(read_from(&wire, 64, false), Err(FrameError::Overrun(64))));
        assert!(read_from(&wire, 65, false).is_ok());
    }

    #[test]
    fn test_wrong_width_is_corrupt_or_short() {
        let wire = encode_subpacket(b"hello", FrameEnd::CrcE, false, &mut Encoder::new(false));
        assert!(read_from(&wire, 1024, true).is_err());
    }

    #[test]
    fn test_flow_control_inside_frame_is_dropped() {
        let mut wire = vec![b'a', XON, b'b'];
        wire.extend(encode_subpacket(b"", FrameEnd::CrcE, false, &mut Encoder::new(false)));
        // CRC was computed over the empty payload, so "ab" must fail.
        assert!(matches!(read_from(&wire, 1024, false), Err(FrameError::Corrupt)));

        let mut wire = encode_subpacket(b"ab", FrameEnd::CrcE, false, &mut Encoder::new(false));
        wire.insert(1, XON);
        assert_eq!(read_from(&wire, 1024, false).unwrap().data, b"ab");
    }

    #[test]
    fn test_cancel_run_in_payload_and_trailer() {
        let mut wire = b"data".to_vec();
        wire.extend_from_slice(&[CAN; 5]);
        assert!(matches!(read_from(&wire, 1024, false), Err(FrameError::Abort)));

        let mut wire = encode_subpacket(b"data", FrameEnd::CrcW, true, &mut Encoder::new(false));
        wire.truncate(6);
        wire.extend_from_slice(&[CAN; 5]);
        assert!(matches!(read_from(&wire, 1024, true), Err(FrameError::Abort)));
    }

    fn frame_end() -> impl Strategy<Value = FrameEnd> {
        prop::sample::select(FrameEnd::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..1024),
            end in frame_end(),
            wide in any::<bool>(),
            escape_all in any::<bool>(),
        ) {
            let wire = encode_subpacket(&data, end, wide, &mut Encoder::new(escape_all));
            let mut port = MockSerialPort::new(script(&[&wire]), vec![]);
            let packet = read_subpacket(&mut port, &mut Decoder::new(), 1024, wide, T).unwrap();
            prop_assert_eq!(packet.data, data);
            prop_assert_eq!(packet.end, end);
        }

        #[test]
        fn prop_single_bit_flip_detected(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            end in frame_end(),
            wide in any::<bool>(),
            pos in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut wire = encode_subpacket(&data, end, wide, &mut Encoder::new(false));
            let i = pos.index(wire.len());
            wire[i] ^= 1 << bit;
            prop_assert!(read_from(&wire, 1024, wide).is_err());
        }
    }
}
