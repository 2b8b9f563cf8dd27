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
use std::marker::PhantomData;

use tracing::{debug, info, trace, warn};

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::policy::{CancelRun, RetryBudget};
use crate::protocol::*;
use crate::serial::SerialPort;
use crate::storage::{sanitize_name, FileHandle, Storage};
use crate::{FileSummary, TransferReport};
use super::block::{encode_block, encode_file_header, CheckMode};
use super::{Flavor, Step};

// ============================================================================
// States
// ============================================================================

pub struct AwaitStart;
pub struct NextFile;
pub struct LoadBlock;
pub struct SendBlock;
pub struct AwaitAck;
pub struct SendEot;
pub struct AwaitEotAck;

// ============================================================================
// FSM Structure
// ============================================================================

/// What the block in flight carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Header,
    Data(usize),
    BatchEnd,
}

struct OutgoingFile {
    handle: Box<dyn FileHandle>,
    name: String,
    sent: u64,
}

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    flavor: Flavor,
    names: VecDeque<String>,
    mode: CheckMode,
    budget: RetryBudget,
    cancel: CancelRun,
    number: u8,
    frame: Vec<u8>,
    kind: Frame,
    file: Option<OutgoingFile>,
    report: TransferReport,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>>;
}

// ============================================================================
// Helpers shared by every state
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            storage: self.storage,
            config: self.config,
            flavor: self.flavor,
            names: self.names,
            mode: self.mode,
            budget: self.budget,
            cancel: self.cancel,
            number: self.number,
            frame: self.frame,
            kind: self.kind,
            file: self.file,
            report: self.report,
        })
    }

    fn goto<T: 'static>(self) -> Result<Step<dyn SenderState>>
    where
        SenderFsm<T>: SenderState,
    {
        let next: Box<dyn SenderState> = self.transition::<T>();
        Ok(Step::Next(next))
    }

    fn link_error(&mut self, e: std::io::Error) -> TransferError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        self.fail(TransferError::Transport(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name),
        )))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match self.serial.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.link_error(e)),
        }
    }

    /// Next byte from the receiver. A completed CAN run ends the transfer.
    fn reply(&mut self) -> Result<Option<u8>> {
        let timeout = self.config.start_timeout;
        let byte = match self.serial.read_byte(timeout) {
            Ok(byte) => byte,
            Err(e) => return Err(self.link_error(e)),
        };
        if let Some(b) = byte {
            trace!("reply {:#04x}", b);
            if self.cancel.observe(b) {
                warn!("transfer cancelled by receiver");
                self.close_file();
                return Err(TransferError::RemoteAbort);
            }
        }
        Ok(byte)
    }

    fn spend(&mut self, cause: TransferError) -> Result<()> {
        self.budget.spend(&cause).map_err(|e| self.fail(e))
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!("send failed: {}", err);
        if matches!(err, TransferError::RetriesExhausted(_) | TransferError::Storage(_)) {
            let _ = self.serial.write_all(&[CAN, CAN]);
        }
        self.close_file();
        err
    }

    fn close_file(&mut self) -> Option<FileSummary> {
        let file = self.file.take()?;
        if let Err(e) = file.handle.close() {
            warn!("close {}: {}", file.name, e);
        }
        Some(FileSummary {
            name: file.name,
            bytes: file.sent,
            resumed_from: 0,
            skipped: false,
        })
    }

    fn block_size(&self) -> usize {
        if self.config.block_1k { BLOCK_1K_LEN } else { BLOCK_LEN }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<AwaitStart> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;

        match fsm.reply()? {
            Some(byte) => match CheckMode::from_request(byte) {
                Some(mode) => {
                    debug!("receiver asked for {:?}", mode);
                    fsm.mode = mode;
                    fsm.cancel.reset();
                    if fsm.file.is_some() {
                        fsm.goto::<LoadBlock>()
                    } else {
                        fsm.goto::<NextFile>()
                    }
                }
                None => fsm.goto::<AwaitStart>(),
            },
            None => {
                fsm.spend(TransferError::Timeout)?;
                fsm.goto::<AwaitStart>()
            }
        }
    }
}

impl SenderState for SenderFsm<NextFile> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;

        let Some(path) = fsm.names.pop_front() else {
            fsm.frame = encode_block(0, &[], 0, fsm.mode);
            fsm.kind = Frame::BatchEnd;
            return fsm.goto::<SendBlock>();
        };

        let handle = match fsm.storage.open_read(&path) {
            Ok(handle) => handle,
            Err(e) => return Err(fsm.fail(TransferError::Storage(e))),
        };
        let length = match handle.current_length() {
            Ok(length) => length,
            Err(e) => return Err(fsm.fail(TransferError::Storage(e))),
        };
        let name = sanitize_name(&path).unwrap_or(&path).to_string();
        info!("sending {} ({} bytes)", name, length);

        let header = match fsm.flavor {
            Flavor::Xmodem { .. } => None,
            Flavor::Ymodem { .. } => Some(encode_file_header(&name, length)),
        };
        fsm.file = Some(OutgoingFile { handle, name, sent: 0 });
        fsm.number = 1;

        match header {
            Some(payload) => {
                fsm.frame = encode_block(0, &payload, 0, fsm.mode);
                fsm.kind = Frame::Header;
                fsm.goto::<SendBlock>()
            }
            None => fsm.goto::<LoadBlock>(),
        }
    }
}

impl SenderState for SenderFsm<LoadBlock> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;

        let mut buf = vec![0u8; fsm.block_size()];
        let Some(file) = fsm.file.as_mut() else {
            return fsm.goto::<SendEot>();
        };
        let n = match file.handle.read_chunk(&mut buf) {
            Ok(n) => n,
            Err(e) => return Err(fsm.fail(TransferError::Storage(e))),
        };
        if n == 0 {
            return fsm.goto::<SendEot>();
        }

        fsm.frame = encode_block(fsm.number, &buf[..n], SUB, fsm.mode);
        fsm.kind = Frame::Data(n);
        fsm.goto::<SendBlock>()
    }
}

impl SenderState for SenderFsm<SendBlock> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;

        let frame = std::mem::take(&mut fsm.frame);
        let sent = fsm.send(&frame);
        fsm.frame = frame;
        sent?;
        debug!("sent block {} ({:?})", fsm.frame[1], fsm.kind);

        fsm.goto::<AwaitAck>()
    }
}

impl SenderState for SenderFsm<AwaitAck> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;

        match fsm.reply()? {
            Some(ACK) => {
                fsm.cancel.reset();
                fsm.budget.reset();
                match fsm.kind {
                    Frame::Header => fsm.goto::<AwaitStart>(),
                    Frame::Data(n) => {
                        if let Some(file) = fsm.file.as_mut() {
                            file.sent += n as u64;
                        }
                        fsm.number = fsm.number.wrapping_add(1);
                        fsm.goto::<LoadBlock>()
                    }
                    Frame::BatchEnd => {
                        info!("batch complete, {} file(s)", fsm.report.files.len());
                        Ok(Step::Done(fsm.report))
                    }
                }
            }
            Some(NAK) => {
                fsm.spend(TransferError::Corrupt)?;
                fsm.goto::<SendBlock>()
            }
            None => {
                fsm.spend(TransferError::Timeout)?;
                fsm.goto::<SendBlock>()
            }
            Some(_) => fsm.goto::<AwaitAck>(),
        }
    }
}

impl SenderState for SenderFsm<SendEot> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;
        fsm.send(&[EOT])?;
        debug!("sent EOT");
        fsm.goto::<AwaitEotAck>()
    }
}

impl SenderState for SenderFsm<AwaitEotAck> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;

        match fsm.reply()? {
            Some(ACK) => {
                fsm.cancel.reset();
                fsm.budget.reset();
                if let Some(summary) = fsm.close_file() {
                    info!("sent {} ({} bytes)", summary.name, summary.bytes);
                    fsm.report.files.push(summary);
                }
                match fsm.flavor {
                    Flavor::Xmodem { .. } => Ok(Step::Done(fsm.report)),
                    Flavor::Ymodem { .. } => fsm.goto::<AwaitStart>(),
                }
            }
            Some(NAK) => {
                fsm.spend(TransferError::ProtocolViolation("NAK of EOT".into()))?;
                fsm.goto::<SendEot>()
            }
            None => {
                fsm.spend(TransferError::Timeout)?;
                fsm.goto::<SendEot>()
            }
            Some(_) => fsm.goto::<AwaitEotAck>(),
        }
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl SenderFsm<AwaitStart> {
    /// XMODEM sends the file its flavor names and ignores `names`; YMODEM
    /// sends every name, then the empty block 0.
    pub fn new(
        serial: Box<dyn SerialPort>,
        storage: Box<dyn Storage>,
        config: TransferConfig,
        flavor: Flavor,
        names: Vec<String>,
    ) -> Box<dyn SenderState> {
        let names: VecDeque<String> = match &flavor {
            Flavor::Xmodem { name } => VecDeque::from([name.clone()]),
            Flavor::Ymodem { .. } => names.into(),
        };
        Box::new(SenderFsm {
            state: PhantomData::<AwaitStart>,
            serial,
            storage,
            budget: RetryBudget::new(config.max_retries),
            config,
            flavor,
            names,
            mode: CheckMode::Crc16,
            cancel: CancelRun::new(XY_CANCEL_RUN),
            number: 1,
            frame: Vec::new(),
            kind: Frame::Data(0),
            file: None,
            report: TransferReport::default(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
