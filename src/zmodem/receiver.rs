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

use tracing::{debug, info, trace, warn};

use crate::config::TransferConfig;
use crate::error::{FrameError, Result, TransferError};
use crate::policy::RetryBudget;
use crate::protocol::*;
use crate::serial::SerialPort;
use crate::storage::{sanitize_name, FileHandle, Storage};
use crate::{FileSummary, TransferReport};
use super::header::{read_header, write_header, Encoding, FrameType, Header};
use super::session::{receive_transition, Action, Cursor, Fault, ProtocolEvent, SessionState};
use super::subpacket::read_subpacket;
use super::zdle::{Decoder, Encoder};

/// Largest data subpacket accepted from a sender
pub const MAX_SUBPACKET: usize = 8192;

/// Longest attention string a ZSINIT may carry
const MAX_ATTN: usize = 32;

/// ZFIN rounds before giving up on the sender's "OO"
const FIN_ATTEMPTS: usize = 3;

// ============================================================================
// Transfer state
// ============================================================================

struct IncomingFile {
    handle: Box<dyn FileHandle>,
    name: String,
    offset: u64,
    resumed_from: u64,
}

/// Everything one receive session owns besides the link and the file store.
struct Transfer {
    encoder: Encoder,
    decoder: Decoder,
    budget: RetryBudget,
    file: Option<IncomingFile>,
    /// Header that led to the current state
    header: Header,
    /// Whether subpackets under `header` carry a 32-bit CRC
    wide: bool,
    /// File position of the next byte in the current data frame
    frame_pos: u64,
    attn: Vec<u8>,
    /// Send the attention string before the next ZRPOS
    interrupt: bool,
    name_hint: Option<String>,
    report: TransferReport,
}

// ============================================================================
// Receiver
// ============================================================================

/// ZMODEM receive session
pub struct ZmodemReceiver {
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    pending: Option<Header>,
    t: Transfer,
}

impl ZmodemReceiver {
    pub fn new(
        port: Box<dyn SerialPort>,
        storage: Box<dyn Storage>,
        config: TransferConfig,
        name_hint: Option<String>,
    ) -> Self {
        let t = Transfer {
            encoder: Encoder::new(config.escape_all),
            decoder: Decoder::new(),
            budget: RetryBudget::new(config.max_retries),
            file: None,
            header: Header::new(FrameType::RqInit, 0),
            wide: false,
            frame_pos: 0,
            attn: Vec::new(),
            interrupt: false,
            name_hint,
            report: TransferReport::default(),
        };
        ZmodemReceiver { port, storage, config, pending: None, t }
    }

    /// Start from a hex header the caller already pulled off the link.
    pub fn with_pending_header(mut self, text: &[u8]) -> Result<Self> {
        self.pending = Some(Header::parse_hex(text)?);
        Ok(self)
    }

    pub fn run(mut self) -> Result<TransferReport> {
        let mut state = match self.pending.take() {
            Some(header) => {
                debug!("pending {}", header);
                self.t.header = header;
                receive_transition(SessionState::AwaitHeader, ProtocolEvent::Header(header), self.cursor()).0
            }
            None => SessionState::RequestInit,
        };

        loop {
            match state {
                SessionState::Quit => break,
                SessionState::Can => {
                    warn!("transfer cancelled by sender");
                    self.close_file();
                    return Err(TransferError::RemoteAbort);
                }
                _ => {}
            }

            let event = match self.execute(state) {
                Ok(event) => event,
                Err(e) => return Err(self.fail(e)),
            };
            let (next, action) = receive_transition(state, event, self.cursor());
            trace!("{:?} --{:?}--> {:?}", state, event, next);

            if let Err(e) = self.perform(action) {
                return Err(self.fail(e));
            }
            state = next;
        }

        self.close_file();
        Ok(self.t.report)
    }

    fn cursor(&self) -> Cursor {
        match &self.t.file {
            Some(file) => Cursor { file_open: true, offset: file.offset },
            None => Cursor { file_open: false, offset: 0 },
        }
    }

    /// Terminal failure: stop the sender where it makes sense, keep the
    /// partial file at its last verified offset.
    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!("receive failed: {}", err);
        if matches!(err, TransferError::RetriesExhausted(_) | TransferError::Storage(_)) {
            let _ = self.port.write_all(&ZMODEM_ABORT);
        }
        self.close_file();
        err
    }

    fn close_file(&mut self) {
        if let Some(file) = self.t.file.take() {
            debug!("closing {} at {}", file.name, file.offset);
            if let Err(e) = file.handle.close() {
                warn!("close {}: {}", file.name, e);
            }
        }
    }

    // ========================================================================
    // State execution
    // ========================================================================

    fn execute(&mut self, state: SessionState) -> Result<ProtocolEvent> {
        match state {
            SessionState::RequestInit => {
                let mut caps = CANFDX | CANOVIO | CANFC32;
                if self.config.escape_all {
                    caps |= ESCCTL;
                }
                self.send_hex(Header::with_flags(FrameType::RInit, [caps, 0, 0, 0]))?;
                Ok(ProtocolEvent::Sent)
            }
            SessionState::AwaitHeader => {
                let read = read_header(
                    self.port.as_mut(),
                    &mut self.t.decoder,
                    self.config.session_timeout,
                    self.config.byte_timeout,
                );
                match read {
                    Ok((header, encoding)) => {
                        self.t.header = header;
                        self.t.wide = encoding == Encoding::Bin32;
                        if header.frame_type == FrameType::Data {
                            self.t.frame_pos = u64::from(header.value());
                        }
                        Ok(ProtocolEvent::Header(header))
                    }
                    Err(e) => frame_failure(e),
                }
            }
            SessionState::Init => self.read_sinit(),
            SessionState::FileInfo => self.read_file_info(),
            SessionState::Resume => {
                if self.t.interrupt {
                    self.t.interrupt = false;
                    self.send_attention()?;
                }
                let offset = self.cursor().offset;
                self.send_hex(Header::new(FrameType::RPos, offset as u32))?;
                Ok(ProtocolEvent::Sent)
            }
            SessionState::Skip => {
                self.send_hex(Header::new(FrameType::Skip, 0))?;
                Ok(ProtocolEvent::Sent)
            }
            SessionState::Data => self.read_data(),
            SessionState::Eof => Ok(self.check_eof()),
            SessionState::Fin => {
                self.close_session()?;
                Ok(ProtocolEvent::Sent)
            }
            SessionState::Error(fault) => {
                self.t.budget.spend(&fault.into())?;
                let target = if self.t.file.is_some() {
                    self.t.interrupt = true;
                    SessionState::Resume
                } else {
                    SessionState::RequestInit
                };
                Ok(ProtocolEvent::Retry(target))
            }
            // Handled by the run loop; a receiver never waits on ZACK.
            SessionState::Ack | SessionState::Can | SessionState::Quit => {
                Ok(ProtocolEvent::Stale)
            }
        }
    }

    fn perform(&mut self, action: Action) -> Result<()> {
        match action {
            Action::None => Ok(()),
            Action::Ack => {
                let offset = self.cursor().offset;
                self.send_hex(Header::new(FrameType::Ack, offset as u32))
            }
            Action::AckFreeCount => self.send_hex(Header::new(FrameType::Ack, 0)),
            Action::OverAndOut => self.port.write_all(b"OO").map_err(TransferError::Transport),
        }
    }

    fn send_hex(&mut self, header: Header) -> Result<()> {
        write_header(self.port.as_mut(), &header, Encoding::Hex, &mut self.t.encoder)
            .map_err(TransferError::Transport)
    }

    fn read_sinit(&mut self) -> Result<ProtocolEvent> {
        let packet = match read_subpacket(
            self.port.as_mut(),
            &mut self.t.decoder,
            MAX_ATTN + 1,
            self.t.wide,
            self.config.byte_timeout,
        ) {
            Ok(packet) => packet,
            Err(e) => return frame_failure(e),
        };

        self.t.attn = packet.data.iter().copied().take_while(|&b| b != 0).collect();
        if self.t.header.zf0() & TESCCTL != 0 {
            self.t.encoder.set_escape_all(true);
        }
        debug!("ZSINIT attn {:02X?} escape_all {}", self.t.attn, self.t.encoder.escape_all());
        Ok(ProtocolEvent::Stored)
    }

    fn read_file_info(&mut self) -> Result<ProtocolEvent> {
        let packet = match read_subpacket(
            self.port.as_mut(),
            &mut self.t.decoder,
            MAX_SUBPACKET,
            self.t.wide,
            self.config.byte_timeout,
        ) {
            Ok(packet) => packet,
            Err(e) => return frame_failure(e),
        };

        // The sender may repeat ZFILE; start the file over.
        self.close_file();

        let Some((announced, length)) = parse_file_info(&packet.data) else {
            warn!("malformed ZFILE subpacket");
            return Ok(ProtocolEvent::Failed(Fault::Violation));
        };
        // The hint holds across repeated ZFILEs until the first file is done.
        let requested = self.t.name_hint.clone().unwrap_or(announced);
        let Some(name) = sanitize_name(&requested).map(str::to_string) else {
            warn!("refusing file name {:?}", requested);
            self.t.name_hint = None;
            return Ok(ProtocolEvent::SkipFile);
        };

        let mut handle = self.storage.open_write(&name, self.config.resume).map_err(TransferError::Storage)?;
        let mut have = handle.current_length().map_err(TransferError::Storage)?;

        if let Some(length) = length {
            if self.config.resume && have > 0 && have == length {
                info!("{} already complete ({} bytes), skipping", name, have);
                handle.close().map_err(TransferError::Storage)?;
                self.t.name_hint = None;
                self.t.report.files.push(FileSummary {
                    name,
                    bytes: have,
                    resumed_from: have,
                    skipped: true,
                });
                return Ok(ProtocolEvent::SkipFile);
            }
            if have > length {
                handle.close().map_err(TransferError::Storage)?;
                handle = self.storage.open_write(&name, false).map_err(TransferError::Storage)?;
                have = 0;
            }
        }

        info!("receiving {} ({:?} bytes) from offset {}", name, length, have);
        self.t.file = Some(IncomingFile { handle, name, offset: have, resumed_from: have });
        Ok(ProtocolEvent::FileOpened)
    }

    fn read_data(&mut self) -> Result<ProtocolEvent> {
        let packet = match read_subpacket(
            self.port.as_mut(),
            &mut self.t.decoder,
            MAX_SUBPACKET,
            self.t.wide,
            self.config.byte_timeout,
        ) {
            Ok(packet) => packet,
            Err(e) => return frame_failure(e),
        };

        let Some(file) = self.t.file.as_mut() else {
            return Ok(ProtocolEvent::Failed(Fault::Violation));
        };

        // Only bytes past the verified offset reach the file.
        let start = self.t.frame_pos;
        let end = start + packet.data.len() as u64;
        if end > file.offset {
            let skip = (file.offset - start) as usize;
            file.handle.write_chunk(&packet.data[skip..]).map_err(TransferError::Storage)?;
            file.offset = end;
        }
        self.t.frame_pos = end;
        self.t.budget.reset();

        trace!("{} bytes {} at {}", packet.data.len(), packet.end, end);
        Ok(ProtocolEvent::Frame(packet.end))
    }

    fn check_eof(&mut self) -> ProtocolEvent {
        let position = u64::from(self.t.header.value());
        match self.t.file.as_ref() {
            None => ProtocolEvent::Stale,
            Some(file) if file.offset == position => {
                info!("received {} ({} bytes)", file.name, file.offset);
                self.t.report.files.push(FileSummary {
                    name: file.name.clone(),
                    bytes: file.offset,
                    resumed_from: file.resumed_from,
                    skipped: false,
                });
                self.close_file();
                self.t.name_hint = None;
                self.t.budget.reset();
                ProtocolEvent::Verified
            }
            Some(file) => {
                debug!("ZEOF at {} but have {}", position, file.offset);
                ProtocolEvent::OutOfSync
            }
        }
    }

    fn send_attention(&mut self) -> Result<()> {
        let attn = self.t.attn.clone();
        for chunk in attn.split_inclusive(|&b| b == ATTN_BREAK || b == ATTN_PAUSE) {
            let (bytes, pause) = match chunk.split_last() {
                Some((&last, rest)) if last == ATTN_BREAK || last == ATTN_PAUSE => (rest, true),
                _ => (chunk, false),
            };
            self.port.write_all(bytes).map_err(TransferError::Transport)?;
            if pause {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        Ok(())
    }

    fn close_session(&mut self) -> Result<()> {
        for attempt in 1..=FIN_ATTEMPTS {
            self.send_hex(Header::new(FrameType::Fin, 0))?;
            loop {
                match self.port.read_byte(self.config.byte_timeout).map_err(TransferError::Transport)? {
                    Some(b'O') => {
                        self.port.read_byte(self.config.byte_timeout).map_err(TransferError::Transport)?;
                        return Ok(());
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
            debug!("no \"OO\" after ZFIN (attempt {})", attempt);
        }
        Ok(())
    }
}

/// Map a codec failure to the event the session reacts to.
fn frame_failure(err: FrameError) -> Result<ProtocolEvent> {
    match Fault::from_frame_error(&err) {
        Some(fault) => Ok(ProtocolEvent::Failed(fault)),
        None if matches!(err, FrameError::Abort) => Ok(ProtocolEvent::Cancelled),
        None => Err(err.into()),
    }
}

/// Split a ZFILE subpacket into the file name and the announced length.
fn parse_file_info(data: &[u8]) -> Option<(String, Option<u64>)> {
    let nul = data.iter().position(|&b| b == 0)?;
    let name = String::from_utf8_lossy(&data[..nul]).into_owned();
    if name.is_empty() {
        return None;
    }

    let rest = &data[nul + 1..];
    let info = &rest[..rest.iter().position(|&b| b == 0).unwrap_or(rest.len())];
    let length = std::str::from_utf8(info)
        .ok()
        .and_then(|s| s.split_whitespace().next())
        .and_then(|tok| tok.parse().ok());
    Some((name, length))
}
