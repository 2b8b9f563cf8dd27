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

//! Checksums used on the wire
//!
//! CRC-16 is the CCITT polynomial 0x1021 seeded at zero (the XMODEM variant);
//! CRC-32 is the reflected 0x04C11DB7 polynomial seeded at all-ones and
//! inverted at the end.

use crc::{Crc, Digest, CRC_16_XMODEM, CRC_32_ISO_HDLC};

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Running 16-bit CRC
pub struct Crc16(Digest<'static, u16>);

impl Crc16 {
    pub fn init() -> Self {
        Crc16(CRC16.digest())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> u16 {
        self.0.finalize()
    }
}

/// Running 32-bit CRC
pub struct Crc32(Digest<'static, u32>);

impl Crc32 {
    pub fn init() -> Self {
        Crc32(CRC32.digest())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> u32 {
        self.0.finalize()
    }
}

pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Fold `bytes` into the XMODEM modulo-256 sum.
pub fn xmodem_sum_update(sum: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(sum, |acc, &b| acc.wrapping_add(b))
}

// ============================================================================
// Frame checks
// ============================================================================

/// Either CRC width, chosen by the governing header encoding.
pub enum FrameCheck {
    Crc16(Crc16),
    Crc32(Crc32),
}

impl FrameCheck {
    pub fn new(wide: bool) -> Self {
        if wide {
            FrameCheck::Crc32(Crc32::init())
        } else {
            FrameCheck::Crc16(Crc16::init())
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            FrameCheck::Crc16(c) => c.update(bytes),
            FrameCheck::Crc32(c) => c.update(bytes),
        }
    }

    /// Trailer bytes in wire order: CRC-16 big-endian, CRC-32 little-endian.
    pub fn trailer(self) -> Vec<u8> {
        match self {
            FrameCheck::Crc16(c) => c.finish().to_be_bytes().to_vec(),
            FrameCheck::Crc32(c) => c.finish().to_le_bytes().to_vec(),
        }
    }

    pub fn trailer_len(&self) -> usize {
        match self {
            FrameCheck::Crc16(_) => 2,
            FrameCheck::Crc32(_) => 4,
        }
    }
}
