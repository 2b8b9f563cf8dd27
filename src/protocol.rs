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

//! Wire constants shared by the XMODEM, YMODEM and ZMODEM engines

// ============================================================================
// ASCII control bytes
// ============================================================================

/// Start of header - begins a 128-byte block
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte block
pub const STX: u8 = 0x02;

/// End of transmission - sender has no more blocks
pub const EOT: u8 = 0x04;

/// Acknowledge - block accepted
pub const ACK: u8 = 0x06;

/// Backspace - sent after a cancel run to clean up the remote terminal line
pub const BS: u8 = 0x08;

/// Line feed
pub const LF: u8 = 0x0A;

/// Carriage return
pub const CR: u8 = 0x0D;

/// Data link escape
pub const DLE: u8 = 0x10;

/// Transmit on
pub const XON: u8 = 0x11;

/// Transmit off
pub const XOFF: u8 = 0x13;

/// Negative acknowledge - block rejected, or checksum-mode start request
pub const NAK: u8 = 0x15;

/// Cancel - a run of these aborts the transfer
pub const CAN: u8 = 0x18;

/// Substitute - pads the final XMODEM block
pub const SUB: u8 = 0x1A;

/// CRC-mode start request
pub const CRC_REQUEST: u8 = b'C';

// ============================================================================
// XMODEM / YMODEM
// ============================================================================

/// Payload of an SOH block
pub const BLOCK_LEN: usize = 128;

/// Payload of an STX block
pub const BLOCK_1K_LEN: usize = 1024;

/// Consecutive CAN bytes that end an XMODEM/YMODEM session
pub const XY_CANCEL_RUN: usize = 2;

// ============================================================================
// ZMODEM framing
// ============================================================================

/// Pad character that begins every header
pub const ZPAD: u8 = b'*';

/// ZMODEM escape - the same byte value as CAN
pub const ZDLE: u8 = CAN;

/// Escaped ZDLE
pub const ZDLEE: u8 = ZDLE ^ 0x40;

/// Binary header with 16-bit CRC
pub const ZBIN: u8 = b'A';

/// Hex header
pub const ZHEX: u8 = b'B';

/// Binary header with 32-bit CRC
pub const ZBIN32: u8 = b'C';

/// Escaped 0x7F
pub const ZRUB0: u8 = b'l';

/// Escaped 0xFF
pub const ZRUB1: u8 = b'm';

/// Frame ends, header follows
pub const ZCRCE: u8 = b'h';

/// Frame continues nonstop
pub const ZCRCG: u8 = b'i';

/// Frame continues, ZACK expected
pub const ZCRCQ: u8 = b'j';

/// Frame ends, ZACK expected
pub const ZCRCW: u8 = b'k';

/// Consecutive CAN bytes that end a ZMODEM session
pub const Z_CANCEL_RUN: usize = 5;

/// Sent to abort a ZMODEM session: eight CAN followed by ten backspaces
pub const ZMODEM_ABORT: [u8; 18] = [
    CAN, CAN, CAN, CAN, CAN, CAN, CAN, CAN,
    BS, BS, BS, BS, BS, BS, BS, BS, BS, BS,
];

// ============================================================================
// ZRINIT capability flags (ZF0)
// ============================================================================

/// Receiver can send and receive true full duplex
pub const CANFDX: u8 = 0x01;

/// Receiver can receive data in parallel with disk I/O
pub const CANOVIO: u8 = 0x02;

/// Receiver can use 32-bit frame check
pub const CANFC32: u8 = 0x20;

/// Receiver expects control characters to be escaped
pub const ESCCTL: u8 = 0x40;

/// ZSINIT flag: sender expects control characters to be escaped
pub const TESCCTL: u8 = 0x40;

// ============================================================================
// Attention string specials
// ============================================================================

/// Send a break
pub const ATTN_BREAK: u8 = 0xDD;

/// Pause for one second
pub const ATTN_PAUSE: u8 = 0xDE;
