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

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use crate::config::TransferConfig;
use crate::error::{FrameError, Result, TransferError};
use crate::policy::RetryBudget;
use crate::protocol::*;
use crate::serial::SerialPort;
use crate::storage::{sanitize_name, FileHandle, Storage};
use crate::{FileSummary, TransferReport};
use super::header::{read_header, write_header, Encoding, FrameType, Header};
use super::session::{send_transition, Action, Fault, ProtocolEvent, SessionState};
use super::subpacket::write_subpacket;
use super::zdle::{Decoder, Encoder, FrameEnd};

struct OutgoingFile {
    handle: Box<dyn FileHandle>,
    name: String,
    length: u64,
    /// Next byte to send
    offset: u64,
    /// Last position the receiver acknowledged
    acked: u64,
    resumed_from: Option<u64>,
    eof_sent: bool,
}

/// ZMODEM send session over one or more files
pub struct ZmodemSender {
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    queue: VecDeque<String>,
    file: Option<OutgoingFile>,
    encoder: Encoder,
    decoder: Decoder,
    budget: RetryBudget,
    /// Encoding for binary headers, chosen from the receiver's capabilities
    encoding: Encoding,
    /// Subpackets per acknowledged frame
    window: usize,
    /// ZRINIT flags last applied
    capabilities: Option<[u8; 4]>,
    header: Header,
    /// Step to repeat after a failure
    recovery: SessionState,
    report: TransferReport,
}

impl ZmodemSender {
    pub fn new(
        port: Box<dyn SerialPort>,
        storage: Box<dyn Storage>,
        config: TransferConfig,
        names: Vec<String>,
    ) -> Self {
        ZmodemSender {
            port,
            storage,
            encoder: Encoder::new(config.escape_all),
            decoder: Decoder::new(),
            budget: RetryBudget::new(config.max_retries),
            encoding: Encoding::Bin16,
            window: config.window.max(1),
            capabilities: None,
            config,
            queue: names.into(),
            file: None,
            header: Header::new(FrameType::RqInit, 0),
            recovery: SessionState::RequestInit,
            report: TransferReport::default(),
        }
    }

    pub fn run(mut self) -> Result<TransferReport> {
        let mut state = SessionState::RequestInit;

        loop {
            match state {
                SessionState::Quit => break,
                SessionState::Can => {
                    warn!("transfer cancelled by receiver");
                    self.close_file();
                    return Err(TransferError::RemoteAbort);
                }
                _ => {}
            }

            let event = match self.execute(state) {
                Ok(event) => event,
                Err(e) => return Err(self.fail(e)),
            };
            let (next, action) = send_transition(state, event);
            trace!("{:?} --{:?}--> {:?}", state, event, next);

            if action == Action::OverAndOut {
                self.port.write_all(b"OO").map_err(TransferError::Transport)?;
            }
            state = next;
        }

        self.close_file();
        Ok(self.report)
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!("send failed: {}", err);
        if matches!(err, TransferError::RetriesExhausted(_) | TransferError::Storage(_)) {
            let _ = self.port.write_all(&ZMODEM_ABORT);
        }
        self.close_file();
        err
    }

    fn close_file(&mut self) {
        if let Some(file) = self.file.take() {
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
                self.recovery = SessionState::RequestInit;
                self.send_header(Header::new(FrameType::RqInit, 0), Encoding::Hex)?;
                Ok(ProtocolEvent::Sent)
            }
            SessionState::AwaitHeader => self.await_header(),
            SessionState::Init => {
                // ZRQINIT and the first ZRINIT cross; the echo must not repeat ZFILE.
                if self.recovery == SessionState::FileInfo && self.capabilities == Some(self.header.data) {
                    debug!("repeated ZRINIT while ZFILE is outstanding");
                    return Ok(ProtocolEvent::Stale);
                }
                self.apply_capabilities();
                self.advance()
            }
            SessionState::FileInfo => {
                self.recovery = SessionState::FileInfo;
                self.send_file_info()?;
                Ok(ProtocolEvent::Sent)
            }
            SessionState::Resume => self.seek_to_request(),
            SessionState::Data => {
                self.recovery = SessionState::Data;
                self.stream_frame()
            }
            SessionState::Eof => {
                self.recovery = SessionState::Eof;
                let Some(file) = self.file.as_mut() else {
                    return Ok(ProtocolEvent::Failed(Fault::Violation));
                };
                file.eof_sent = true;
                let header = Header::new(FrameType::Eof, file.offset as u32);
                self.send_header(header, self.encoding)?;
                Ok(ProtocolEvent::Sent)
            }
            SessionState::Ack => Ok(self.check_ack()),
            SessionState::Skip => {
                if let Some(file) = self.file.take() {
                    info!("receiver skipped {}", file.name);
                    file.handle.close().map_err(TransferError::Storage)?;
                    self.report.files.push(FileSummary {
                        name: file.name,
                        bytes: 0,
                        resumed_from: 0,
                        skipped: true,
                    });
                }
                self.advance()
            }
            SessionState::Fin => {
                self.recovery = SessionState::Fin;
                self.send_header(Header::new(FrameType::Fin, 0), Encoding::Hex)?;
                self.await_header()
            }
            SessionState::Error(fault) => {
                self.budget.spend(&fault.into())?;
                if self.recovery == SessionState::Data {
                    if let Some(file) = self.file.as_mut() {
                        file.offset = file.acked;
                        file.handle.seek_to(file.acked).map_err(TransferError::Storage)?;
                    }
                }
                Ok(ProtocolEvent::Retry(self.recovery))
            }
            SessionState::Can | SessionState::Quit => Ok(ProtocolEvent::Stale),
        }
    }

    fn send_header(&mut self, header: Header, encoding: Encoding) -> Result<()> {
        write_header(self.port.as_mut(), &header, encoding, &mut self.encoder)
            .map_err(TransferError::Transport)
    }

    fn await_header(&mut self) -> Result<ProtocolEvent> {
        match read_header(
            self.port.as_mut(),
            &mut self.decoder,
            self.config.session_timeout,
            self.config.byte_timeout,
        ) {
            Ok((header, _)) => {
                self.header = header;
                Ok(ProtocolEvent::Header(header))
            }
            Err(FrameError::Abort) => Ok(ProtocolEvent::Cancelled),
            Err(FrameError::Io(e)) => Err(TransferError::Transport(e)),
            Err(e) => Ok(ProtocolEvent::Failed(Fault::from_frame_error(&e).unwrap_or(Fault::Corrupt))),
        }
    }

    /// Read the receiver's ZRINIT flags and buffer size.
    fn apply_capabilities(&mut self) {
        let flags = self.header.zf0();
        self.capabilities = Some(self.header.data);
        self.encoding = if flags & CANFC32 != 0 && self.config.use_crc32 {
            Encoding::Bin32
        } else {
            Encoding::Bin16
        };
        if flags & ESCCTL != 0 {
            self.encoder.set_escape_all(true);
        }

        let buffer = u16::from_le_bytes([self.header.data[0], self.header.data[1]]) as usize;
        self.window = if buffer > 0 {
            (buffer / self.config.subpacket_size.max(1)).clamp(1, self.config.window.max(1))
        } else {
            self.config.window.max(1)
        };
        debug!("receiver flags {:02X}, buffer {}, {:?}, window {}", flags, buffer, self.encoding, self.window);
    }

    /// Retire a finished file and open the next one if none is in flight.
    fn advance(&mut self) -> Result<ProtocolEvent> {
        if self.file.as_ref().is_some_and(|f| f.eof_sent) {
            if let Some(file) = self.file.take() {
                info!("sent {} ({} bytes)", file.name, file.length);
                file.handle.close().map_err(TransferError::Storage)?;
                self.report.files.push(FileSummary {
                    name: file.name,
                    bytes: file.length,
                    resumed_from: file.resumed_from.unwrap_or(0),
                    skipped: false,
                });
                self.budget.reset();
            }
        }

        if self.file.is_none() {
            if let Some(name) = self.queue.pop_front() {
                let handle = self.storage.open_read(&name).map_err(TransferError::Storage)?;
                let length = handle.current_length().map_err(TransferError::Storage)?;
                info!("sending {} ({} bytes)", name, length);
                self.file = Some(OutgoingFile {
                    handle,
                    name,
                    length,
                    offset: 0,
                    acked: 0,
                    resumed_from: None,
                    eof_sent: false,
                });
            }
        }

        Ok(ProtocolEvent::Ready { more_files: self.file.is_some() })
    }

    fn send_file_info(&mut self) -> Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };
        let base = sanitize_name(&file.name).unwrap_or(&file.name);
        let mut info = Vec::with_capacity(base.len() + 32);
        info.extend_from_slice(base.as_bytes());
        info.push(0);
        info.extend_from_slice(format!("{} 0 100644", file.length).as_bytes());
        info.push(0);

        self.send_header(Header::new(FrameType::File, 0), self.encoding)?;
        write_subpacket(self.port.as_mut(), &info, FrameEnd::CrcW, self.encoding.wide(), &mut self.encoder)
            .map_err(TransferError::Transport)
    }

    fn seek_to_request(&mut self) -> Result<ProtocolEvent> {
        let requested = u64::from(self.header.value());
        let Some(file) = self.file.as_mut() else {
            return Ok(ProtocolEvent::Failed(Fault::Violation));
        };
        let position = requested.min(file.length);
        debug!("ZRPOS {} for {}", position, file.name);
        file.handle.seek_to(position).map_err(TransferError::Storage)?;
        file.offset = position;
        file.acked = position;
        file.eof_sent = false;
        file.resumed_from.get_or_insert(position);
        Ok(ProtocolEvent::Sent)
    }

    /// Send a ZDATA header and up to one window of subpackets. The last
    /// subpacket asks for an acknowledgment, or ends the frame at end of file.
    fn stream_frame(&mut self) -> Result<ProtocolEvent> {
        let wide = self.encoding.wide();
        let Some(file) = self.file.as_mut() else {
            return Ok(ProtocolEvent::Failed(Fault::Violation));
        };

        let header = Header::new(FrameType::Data, file.offset as u32);
        write_header(self.port.as_mut(), &header, self.encoding, &mut self.encoder)
            .map_err(TransferError::Transport)?;

        let mut buf = vec![0u8; self.config.subpacket_size.max(1)];
        for n in 1..=self.window {
            let len = file.handle.read_chunk(&mut buf).map_err(TransferError::Storage)?;
            let at_end = len < buf.len() || file.offset + len as u64 >= file.length;
            let end = if at_end {
                FrameEnd::CrcE
            } else if n == self.window {
                FrameEnd::CrcW
            } else {
                FrameEnd::CrcG
            };

            write_subpacket(self.port.as_mut(), &buf[..len], end, wide, &mut self.encoder)
                .map_err(TransferError::Transport)?;
            file.offset += len as u64;

            if at_end {
                return Ok(ProtocolEvent::EndOfFile);
            }
        }
        Ok(ProtocolEvent::Sent)
    }

    fn check_ack(&mut self) -> ProtocolEvent {
        let position = u64::from(self.header.value());
        match self.file.as_mut() {
            Some(file) if position == file.offset => {
                file.acked = position;
                self.budget.reset();
                ProtocolEvent::Verified
            }
            _ => ProtocolEvent::Stale,
        }
    }
}
