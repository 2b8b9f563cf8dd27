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

//! XMODEM, YMODEM and ZMODEM file transfer engines
//!
//! Each entry point runs one transfer to completion on the calling thread,
//! reading and writing the link through [`serial::SerialPort`] and the files
//! through [`storage::Storage`]. Only terminal failures are returned; link
//! noise is retried inside the engines.

pub mod checksum;
pub mod config;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod serial;
pub mod storage;
pub mod xymodem;
pub mod zmodem;

pub use config::TransferConfig;
pub use error::{Result, TransferError};

use serial::SerialPort;
use storage::Storage;
use xymodem::{Flavor, ReceiverFsm, SenderFsm};
use zmodem::{ZmodemReceiver, ZmodemSender};

/// Outcome of one file in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub name: String,
    /// Bytes stored or sent, including any resumed prefix
    pub bytes: u64,
    /// Offset the transfer continued from; 0 for a fresh file
    pub resumed_from: u64,
    /// The receiver already had the file and declined it
    pub skipped: bool,
}

/// Files handled by one session, in transfer order
#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    pub files: Vec<FileSummary>,
}

// ============================================================================
// Entry points
// ============================================================================

/// Receive a ZMODEM batch. `name_hint` renames the first incoming file.
pub fn zmodem_receive(
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    name_hint: Option<String>,
) -> Result<TransferReport> {
    ZmodemReceiver::new(port, storage, config, name_hint).run()
}

/// Like [`zmodem_receive`], for a session whose opening hex header the caller
/// already read off the link as text (for example "**\x18B00000000000000").
pub fn zmodem_receive_after(
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    name_hint: Option<String>,
    header_text: &[u8],
) -> Result<TransferReport> {
    ZmodemReceiver::new(port, storage, config, name_hint)
        .with_pending_header(header_text)?
        .run()
}

pub fn zmodem_send(
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    names: Vec<String>,
) -> Result<TransferReport> {
    ZmodemSender::new(port, storage, config, names).run()
}

/// Receive YMODEM files until the empty block 0, or only the first file
/// when `batch` is false.
pub fn ymodem_receive(
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    batch: bool,
) -> Result<TransferReport> {
    xymodem::run_receiver(ReceiverFsm::new(port, storage, config, Flavor::Ymodem { batch }))
}

pub fn ymodem_send(
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    names: Vec<String>,
) -> Result<TransferReport> {
    let fsm = SenderFsm::new(port, storage, config, Flavor::Ymodem { batch: true }, names);
    xymodem::run_sender(fsm)
}

/// Receive one XMODEM file into `path`. Block padding is kept.
pub fn xmodem_receive(
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    path: &str,
) -> Result<TransferReport> {
    let flavor = Flavor::Xmodem { name: path.to_string() };
    xymodem::run_receiver(ReceiverFsm::new(port, storage, config, flavor))
}

pub fn xmodem_send(
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    config: TransferConfig,
    path: &str,
) -> Result<TransferReport> {
    let flavor = Flavor::Xmodem { name: path.to_string() };
    xymodem::run_sender(SenderFsm::new(port, storage, config, flavor, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::LinkPair;
    use crate::storage::MemoryStorage;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_entry_points_pair_up() {
        let config = TransferConfig {
            session_timeout: Duration::from_millis(500),
            byte_timeout: Duration::from_millis(200),
            start_timeout: Duration::from_millis(500),
            ..TransferConfig::default()
        };
        let source = MemoryStorage::new();
        source.insert("note.txt", b"over the wire");

        type SendFn = fn(Box<dyn SerialPort>, Box<dyn Storage>, TransferConfig) -> Result<TransferReport>;
        type ReceiveFn = SendFn;
        let pairs: [(SendFn, ReceiveFn); 3] = [
            (
                |p, s, c| zmodem_send(p, s, c, vec!["note.txt".into()]),
                |p, s, c| zmodem_receive(p, s, c, Some("z.txt".into())),
            ),
            (
                |p, s, c| ymodem_send(p, s, c, vec!["note.txt".into()]),
                |p, s, c| ymodem_receive(p, s, c, true),
            ),
            (
                |p, s, c| xmodem_send(p, s, c, "note.txt"),
                |p, s, c| xmodem_receive(p, s, c, "x.txt"),
            ),
        ];

        let dest = MemoryStorage::new();
        for (send, receive) in pairs {
            let (a, b) = LinkPair::clean();
            let (source, send_config) = (source.clone(), config.clone());
            let sender = thread::spawn(move || send(Box::new(a), Box::new(source), send_config));
            receive(Box::new(b), Box::new(dest.clone()), config.clone()).unwrap();
            sender.join().unwrap().unwrap();
        }

        assert_eq!(dest.get("z.txt").unwrap(), b"over the wire");
        assert_eq!(dest.get("note.txt").unwrap(), b"over the wire");
        assert_eq!(&dest.get("x.txt").unwrap()[..13], b"over the wire");
    }

    #[test]
    fn test_zmodem_receive_after_captured_header() {
        let config = TransferConfig {
            session_timeout: Duration::from_millis(500),
            byte_timeout: Duration::from_millis(200),
            ..TransferConfig::default()
        };
        let source = MemoryStorage::new();
        source.insert("note.txt", b"over the wire");
        let dest = MemoryStorage::new();

        let (a, mut b) = LinkPair::clean();
        let send_config = config.clone();
        let sender = thread::spawn(move || {
            zmodem_send(Box::new(a), Box::new(source), send_config, vec!["note.txt".into()])
        });

        // A front end spots the sender's ZRQINIT before handing over the link.
        let mut captured = Vec::new();
        while let Some(byte) = b.read_byte(Duration::from_secs(1)).unwrap() {
            captured.push(byte);
            if byte == b'\n' {
                break;
            }
        }
        assert!(captured.starts_with(b"**\x18B00"));

        let report = zmodem_receive_after(Box::new(b), Box::new(dest.clone()), config, Some("z.txt".into()), &captured)
            .unwrap();
        sender.join().unwrap().unwrap();

        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].name, "z.txt");
        assert_eq!(dest.names(), vec!["z.txt".to_string()]);
        assert_eq!(dest.get("z.txt").unwrap(), b"over the wire");
    }

    #[test]
    fn test_zmodem_receive_after_rejects_bad_header() {
        let port = Box::new(crate::serial::MockSerialPort::new(vec![], vec![]));
        let result = zmodem_receive_after(port, Box::new(MemoryStorage::new()), TransferConfig::default(), None, b"B0000000000000f");
        assert!(result.is_err());
    }
}
