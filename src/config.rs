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

/// Tunables for one transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Wait for the first byte of a ZMODEM header
    pub session_timeout: Duration,
    /// Wait between bytes inside a frame, and for short replies
    pub byte_timeout: Duration,
    /// Wait for the first byte of an XMODEM/YMODEM block
    pub start_timeout: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
    /// Largest ZMODEM data subpacket
    pub subpacket_size: usize,
    /// ZMODEM subpackets sent before an acknowledgment is requested
    pub window: usize,
    /// Escape every control character, not just the flow-control set
    pub escape_all: bool,
    /// Use 32-bit CRC frames when the receiver supports them
    pub use_crc32: bool,
    /// Continue partial destination files instead of overwriting them
    pub resume: bool,
    /// Request XMODEM CRC mode with 'C' rather than NAK
    pub crc: bool,
    /// Send 1024-byte XMODEM/YMODEM blocks
    pub block_1k: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            session_timeout: Duration::from_secs(60),
            byte_timeout: Duration::from_secs(1),
            start_timeout: Duration::from_secs(10),
            max_retries: 10,
            subpacket_size: 1024,
            window: 8,
            escape_all: false,
            use_crc32: true,
            resume: true,
            crc: true,
            block_1k: false,
        }
    }
}
