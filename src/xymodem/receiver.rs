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

use std::marker::PhantomData;

use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{FrameError, Result, TransferError};
use crate::policy::RetryBudget;
use crate::protocol::*;
use crate::serial::SerialPort;
use crate::storage::{sanitize_name, FileHandle, Storage};
use crate::{FileSummary, TransferReport};
use super::block::{parse_file_header, purge, read_block, CheckMode, Incoming};
use super::{Flavor, Step};

/// 'C' requests sent before an XMODEM receiver falls back to checksums
const CRC_ATTEMPTS: u32 = 3;

// ============================================================================
// States
// ============================================================================

pub struct AwaitStart;
pub struct ReadBlock;
pub struct Accept;
pub struct Repeat;
pub struct Reject;
pub struct OpenFile;
pub struct EndOfFile;

// ============================================================================
// FSM Structure
// ============================================================================

struct IncomingFile {
    handle: Box<dyn FileHandle>,
    name: String,
    written: u64,
    /// Bytes still expected, when block 0 announced a length
    remaining: Option<u64>,
}

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    flavor: Flavor,
    mode: CheckMode,
    budget: RetryBudget,
    /// Start requests sent without any answer
    start_attempts: u32,
    /// Something other than silence arrived since the last start request
    started: bool,
    expected: u8,
    last_accepted: Option<u8>,
    block: Option<(u8, Vec<u8>)>,
    file: Option<IncomingFile>,
    report: TransferReport,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>>;
}

// ============================================================================
// Helpers shared by every state
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            storage: self.storage,
            config: self.config,
            flavor: self.flavor,
            mode: self.mode,
            budget: self.budget,
            start_attempts: self.start_attempts,
            started: self.started,
            expected: self.expected,
            last_accepted: self.last_accepted,
            block: self.block,
            file: self.file,
            report: self.report,
        })
    }

    fn goto<T: 'static>(self) -> Result<Step<dyn ReceiverState>>
    where
        ReceiverFsm<T>: ReceiverState,
    {
        let next: Box<dyn ReceiverState> = self.transition::<T>();
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

    fn spend(&mut self, cause: TransferError) -> Result<()> {
        self.budget.spend(&cause).map_err(|e| self.fail(e))
    }

    /// Terminal failure. Local faults cancel the sender; the partial file
    /// stays on storage.
    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!("receive failed: {}", err);
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
            bytes: file.written,
            resumed_from: 0,
            skipped: false,
        })
    }

    /// XMODEM has no block 0, so its file opens on first use.
    fn ensure_file(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let name = match &self.flavor {
            Flavor::Xmodem { name } => name.clone(),
            Flavor::Ymodem { .. } => {
                return Err(self.fail(TransferError::ProtocolViolation("data before block 0".into())));
            }
        };
        match self.storage.open_write(&name, false) {
            Ok(handle) => {
                info!("receiving {}", name);
                self.file = Some(IncomingFile { handle, name, written: 0, remaining: None });
                Ok(())
            }
            Err(e) => Err(self.fail(TransferError::Storage(e))),
        }
    }

    fn is_ymodem(&self) -> bool {
        matches!(self.flavor, Flavor::Ymodem { .. })
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<AwaitStart> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;

        let request = fsm.mode.request_byte();
        fsm.send(&[request])?;
        debug!("sent start request {:#04x}", request);

        fsm.started = false;
        fsm.goto::<ReadBlock>()
    }
}

impl ReceiverState for ReceiverFsm<ReadBlock> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;

        let read = read_block(
            fsm.serial.as_mut(),
            fsm.mode,
            fsm.config.start_timeout,
            fsm.config.byte_timeout,
        );

        match read {
            Ok(Incoming::Block { number, data }) => {
                fsm.started = true;
                fsm.start_attempts = 0;
                debug!("block {} ({} bytes)", number, data.len());

                let awaiting_header = fsm.is_ymodem() && fsm.file.is_none();
                fsm.block = Some((number, data));
                if awaiting_header && number == 0 {
                    fsm.goto::<OpenFile>()
                } else if !awaiting_header && number == fsm.expected {
                    fsm.goto::<Accept>()
                } else if fsm.last_accepted == Some(number) {
                    fsm.goto::<Repeat>()
                } else {
                    let expected = fsm.expected;
                    fsm.spend(TransferError::ProtocolViolation(format!(
                        "block {} while expecting {}",
                        number, expected
                    )))?;
                    fsm.goto::<Reject>()
                }
            }
            Ok(Incoming::Damaged) => {
                fsm.started = true;
                fsm.start_attempts = 0;
                fsm.spend(TransferError::Corrupt)?;
                fsm.goto::<Reject>()
            }
            Ok(Incoming::EndOfFile) => {
                fsm.started = true;
                if fsm.file.is_some() || !fsm.is_ymodem() {
                    fsm.goto::<EndOfFile>()
                } else if !fsm.report.files.is_empty() {
                    // Our ACK of the last EOT was lost.
                    debug!("repeated EOT");
                    fsm.send(&[ACK])?;
                    fsm.goto::<AwaitStart>()
                } else {
                    fsm.spend(TransferError::ProtocolViolation("EOT before block 0".into()))?;
                    fsm.goto::<Reject>()
                }
            }
            Err(FrameError::Abort) => {
                warn!("transfer cancelled by sender");
                fsm.close_file();
                Err(TransferError::RemoteAbort)
            }
            Err(FrameError::Io(e)) => Err(fsm.link_error(e)),
            Err(FrameError::TimedOut) if !fsm.started => {
                fsm.start_attempts += 1;
                if fsm.mode == CheckMode::Crc16
                    && !fsm.is_ymodem()
                    && fsm.start_attempts >= CRC_ATTEMPTS
                {
                    warn!("no answer to CRC requests, falling back to checksum");
                    fsm.mode = CheckMode::Checksum;
                }
                fsm.spend(TransferError::Timeout)?;
                fsm.goto::<AwaitStart>()
            }
            Err(e) => {
                fsm.spend(e.into())?;
                fsm.goto::<Reject>()
            }
        }
    }
}

impl ReceiverState for ReceiverFsm<Accept> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;
        fsm.ensure_file()?;

        let Some((number, data)) = fsm.block.take() else {
            return fsm.goto::<ReadBlock>();
        };
        let Some(file) = fsm.file.as_mut() else {
            return fsm.goto::<ReadBlock>();
        };

        let keep = match file.remaining {
            Some(remaining) => data.len().min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            None => data.len(),
        };
        if keep > 0 {
            if let Err(e) = file.handle.write_chunk(&data[..keep]) {
                return Err(fsm.fail(TransferError::Storage(e)));
            }
        }
        file.written += keep as u64;
        if let Some(remaining) = file.remaining.as_mut() {
            *remaining -= keep as u64;
        }

        fsm.send(&[ACK])?;
        debug!("accepted block {}, stored {} bytes", number, keep);

        fsm.last_accepted = Some(number);
        fsm.expected = number.wrapping_add(1);
        fsm.budget.reset();
        fsm.goto::<ReadBlock>()
    }
}

impl ReceiverState for ReceiverFsm<Repeat> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;

        let number = fsm.block.take().map_or(0, |(n, _)| n);
        debug!("repeated block {}", number);
        if number == 0 && fsm.is_ymodem() {
            // The sender missed our ACK of block 0 and will wait for 'C' again.
            let request = fsm.mode.request_byte();
            fsm.send(&[ACK, request])?;
        } else {
            fsm.send(&[ACK])?;
        }
        fsm.goto::<ReadBlock>()
    }
}

impl ReceiverState for ReceiverFsm<Reject> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;

        fsm.block = None;
        let quiet = fsm.config.byte_timeout;
        match purge(fsm.serial.as_mut(), quiet) {
            Ok(0) => {}
            Ok(n) => debug!("purged {} bytes", n),
            Err(FrameError::Io(e)) => return Err(fsm.link_error(e)),
            Err(_) => {}
        }
        fsm.send(&[NAK])?;
        fsm.goto::<ReadBlock>()
    }
}

impl ReceiverState for ReceiverFsm<OpenFile> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;

        let data = fsm.block.take().map(|(_, data)| data).unwrap_or_default();
        let Some(header) = parse_file_header(&data) else {
            fsm.send(&[ACK])?;
            info!("batch complete, {} file(s)", fsm.report.files.len());
            return Ok(Step::Done(fsm.report));
        };

        if fsm.flavor == (Flavor::Ymodem { batch: false }) && !fsm.report.files.is_empty() {
            info!("single-file receive, refusing {}", header.name);
            fsm.send(&[CAN, CAN])?;
            return Ok(Step::Done(fsm.report));
        }

        let Some(name) = sanitize_name(&header.name).map(str::to_string) else {
            fsm.spend(TransferError::ProtocolViolation(format!("file name {:?}", header.name)))?;
            return fsm.goto::<Reject>();
        };

        let handle = match fsm.storage.open_write(&name, false) {
            Ok(handle) => handle,
            Err(e) => return Err(fsm.fail(TransferError::Storage(e))),
        };
        match header.length {
            Some(length) => info!("receiving {} ({} bytes)", name, length),
            None => info!("receiving {}", name),
        }
        fsm.file = Some(IncomingFile { handle, name, written: 0, remaining: header.length });

        fsm.send(&[ACK])?;
        fsm.expected = 1;
        fsm.last_accepted = Some(0);
        fsm.budget.reset();
        fsm.goto::<AwaitStart>()
    }
}

impl ReceiverState for ReceiverFsm<EndOfFile> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;
        fsm.ensure_file()?;

        fsm.send(&[ACK])?;
        if let Some(summary) = fsm.close_file() {
            info!("received {} ({} bytes)", summary.name, summary.bytes);
            fsm.report.files.push(summary);
        }
        fsm.budget.reset();

        match fsm.flavor {
            Flavor::Xmodem { .. } => Ok(Step::Done(fsm.report)),
            Flavor::Ymodem { .. } => {
                fsm.expected = 0;
                fsm.last_accepted = None;
                fsm.goto::<AwaitStart>()
            }
        }
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl ReceiverFsm<AwaitStart> {
    pub fn new(
        serial: Box<dyn SerialPort>,
        storage: Box<dyn Storage>,
        config: TransferConfig,
        flavor: Flavor,
    ) -> Box<dyn ReceiverState> {
        // YMODEM always negotiates CRC-16.
        let mode = if config.crc || matches!(flavor, Flavor::Ymodem { .. }) {
            CheckMode::Crc16
        } else {
            CheckMode::Checksum
        };
        Box::new(ReceiverFsm {
            state: PhantomData::<AwaitStart>,
            serial,
            storage,
            budget: RetryBudget::new(config.max_retries),
            config,
            flavor,
            mode,
            start_attempts: 0,
            started: false,
            expected: 1,
            last_accepted: None,
            block: None,
            file: None,
            report: TransferReport::default(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
