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

use std::io;

// ============================================================================
// Transfer Errors
// ============================================================================

/// Failure of a transfer step.
///
/// `Timeout`, `Corrupt`, `Overrun` and `ProtocolViolation` are absorbed by the
/// engines and drive a retry. The remaining kinds end the transfer and are the
/// only ones a caller of an entry point will see.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("timed out waiting for the remote")]
    Timeout,

    #[error("checksum mismatch")]
    Corrupt,

    #[error("subpacket exceeded {0} bytes")]
    Overrun(usize),

    #[error("unexpected {0}")]
    ProtocolViolation(String),

    #[error("transfer cancelled by the remote")]
    RemoteAbort,

    #[error("gave up after {0} retries")]
    RetriesExhausted(u32),

    #[error("storage error: {0}")]
    Storage(#[source] io::Error),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Timeout
                | TransferError::Corrupt
                | TransferError::Overrun(_)
                | TransferError::ProtocolViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

// ============================================================================
// Frame Errors
// ============================================================================

/// Outcome of a codec read that did not produce a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("timed out")]
    TimedOut,

    #[error("corrupt frame")]
    Corrupt,

    #[error("frame exceeded {0} bytes")]
    Overrun(usize),

    #[error("cancel run received")]
    Abort,

    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for TransferError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TimedOut => TransferError::Timeout,
            FrameError::Corrupt => TransferError::Corrupt,
            FrameError::Overrun(n) => TransferError::Overrun(n),
            FrameError::Abort => TransferError::RemoteAbort,
            FrameError::Io(e) => TransferError::Transport(e),
        }
    }
}
