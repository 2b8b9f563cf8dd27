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

//! ZMODEM session states and the pure transition functions
//!
//! A driver executes the I/O belonging to its current state and reports
//! what happened as a [`ProtocolEvent`]. The transition functions map that
//! event to the next state and an [`Action`] for the driver to carry out.
//! Nothing here touches the link or the file store.

use crate::error::{FrameError, TransferError};
use super::header::{FrameType, Header};
use super::zdle::FrameEnd;

// ============================================================================
// States, events and actions
// ============================================================================

/// Retryable failure recorded by the `Error` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    Corrupt,
    /// Subpacket ran past the given bound
    Overrun(usize),
    Violation,
}

impl Fault {
    /// Classify a codec failure. `Abort` and I/O errors are not faults.
    pub fn from_frame_error(err: &FrameError) -> Option<Fault> {
        match err {
            FrameError::TimedOut => Some(Fault::Timeout),
            FrameError::Corrupt => Some(Fault::Corrupt),
            FrameError::Overrun(limit) => Some(Fault::Overrun(*limit)),
            FrameError::Abort | FrameError::Io(_) => None,
        }
    }
}

impl From<Fault> for TransferError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Timeout => TransferError::Timeout,
            Fault::Corrupt => TransferError::Corrupt,
            Fault::Overrun(limit) => TransferError::Overrun(limit),
            Fault::Violation => TransferError::ProtocolViolation("header".into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    RequestInit,
    AwaitHeader,
    Init,
    FileInfo,
    Data,
    Eof,
    Resume,
    Ack,
    Skip,
    Fin,
    Can,
    Error(Fault),
    Quit,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Can | SessionState::Quit)
    }
}

/// What executing a state produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The state's outgoing frame went out
    Sent,
    Header(Header),
    /// ZSINIT parameters stored
    Stored,
    FileOpened,
    SkipFile,
    /// A data subpacket verified and was stored
    Frame(FrameEnd),
    /// Last subpacket of the file sent
    EndOfFile,
    /// The remote position matches ours
    Verified,
    /// The remote position is behind ours
    OutOfSync,
    /// Nothing to act on
    Stale,
    /// Ready for the next file, if there is one
    Ready { more_files: bool },
    Failed(Fault),
    Retry(SessionState),
    Cancelled,
}

/// Side effect the driver performs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// ZACK carrying the current offset
    Ack,
    /// ZACK carrying a free-space count of zero
    AckFreeCount,
    /// Write "OO" to close the session
    OverAndOut,
}

/// Receive-side snapshot the transition needs to place a ZDATA header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub file_open: bool,
    pub offset: u64,
}

// ============================================================================
// Receive role
// ============================================================================

pub fn receive_transition(
    state: SessionState,
    event: ProtocolEvent,
    cursor: Cursor,
) -> (SessionState, Action) {
    use ProtocolEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Can, _) => (S::Can, Action::None),
        (S::Quit, _) => (S::Quit, Action::None),
        (_, E::Cancelled) => (S::Can, Action::None),
        (S::Error(_), E::Retry(next)) => (next, Action::None),
        (_, E::Failed(fault)) => (S::Error(fault), Action::None),

        (S::RequestInit | S::Resume | S::Skip, E::Sent) => (S::AwaitHeader, Action::None),

        (S::AwaitHeader, E::Header(header)) => match header.frame_type {
            FrameType::RqInit => (S::RequestInit, Action::None),
            FrameType::SInit => (S::Init, Action::None),
            FrameType::File => (S::FileInfo, Action::None),
            FrameType::Data if cursor.file_open && u64::from(header.value()) <= cursor.offset => {
                (S::Data, Action::None)
            }
            FrameType::Data if cursor.file_open => (S::Resume, Action::None),
            FrameType::Data => (S::RequestInit, Action::None),
            FrameType::Eof => (S::Eof, Action::None),
            FrameType::Fin => (S::Fin, Action::None),
            FrameType::FreeCnt => (S::AwaitHeader, Action::AckFreeCount),
            FrameType::Can | FrameType::Abort => (S::Can, Action::None),
            _ => (S::Error(Fault::Violation), Action::None),
        },

        (S::Init, E::Stored) => (S::AwaitHeader, Action::Ack),

        (S::FileInfo, E::FileOpened) => (S::Resume, Action::None),
        (S::FileInfo, E::SkipFile) => (S::Skip, Action::None),

        (S::Data, E::Frame(end)) => match end {
            FrameEnd::CrcG => (S::Data, Action::None),
            FrameEnd::CrcQ => (S::Data, Action::Ack),
            FrameEnd::CrcW => (S::AwaitHeader, Action::Ack),
            FrameEnd::CrcE => (S::AwaitHeader, Action::None),
        },

        (S::Eof, E::Verified | E::Stale) => (S::RequestInit, Action::None),
        (S::Eof, E::OutOfSync) => (S::Resume, Action::None),

        (S::Fin, E::Sent) => (S::Quit, Action::None),

        _ => (S::Error(Fault::Violation), Action::None),
    }
}

// ============================================================================
// Send role
// ============================================================================

pub fn send_transition(state: SessionState, event: ProtocolEvent) -> (SessionState, Action) {
    use ProtocolEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Can, _) => (S::Can, Action::None),
        (S::Quit, _) => (S::Quit, Action::None),
        (_, E::Cancelled) => (S::Can, Action::None),
        (S::Error(_), E::Retry(next)) => (next, Action::None),

        // A silent receiver after ZFIN has already gone.
        (S::Fin, E::Failed(Fault::Timeout)) => (S::Quit, Action::None),
        (S::Fin, E::Header(header)) => match header.frame_type {
            FrameType::Fin => (S::Quit, Action::OverAndOut),
            FrameType::Can | FrameType::Abort => (S::Can, Action::None),
            _ => (S::Error(Fault::Violation), Action::None),
        },

        (_, E::Failed(fault)) => (S::Error(fault), Action::None),

        (S::RequestInit | S::FileInfo | S::Eof, E::Sent) => (S::AwaitHeader, Action::None),
        (S::Resume, E::Sent) => (S::Data, Action::None),

        (S::AwaitHeader, E::Header(header)) => match header.frame_type {
            FrameType::RInit => (S::Init, Action::None),
            FrameType::RPos => (S::Resume, Action::None),
            FrameType::Ack => (S::Ack, Action::None),
            FrameType::Skip => (S::Skip, Action::None),
            FrameType::Nak => (S::Error(Fault::Corrupt), Action::None),
            FrameType::Can | FrameType::Abort | FrameType::FErr => (S::Can, Action::None),
            _ => (S::Error(Fault::Violation), Action::None),
        },

        (S::Init, E::Stale) => (S::AwaitHeader, Action::None),
        (S::Init | S::Skip, E::Ready { more_files: true }) => (S::FileInfo, Action::None),
        (S::Init | S::Skip, E::Ready { more_files: false }) => (S::Fin, Action::None),

        (S::Data, E::Sent) => (S::AwaitHeader, Action::None),
        (S::Data, E::EndOfFile) => (S::Eof, Action::None),

        (S::Ack, E::Verified) => (S::Data, Action::None),
        (S::Ack, E::Stale) => (S::AwaitHeader, Action::None),

        _ => (S::Error(Fault::Violation), Action::None),
    }
}
