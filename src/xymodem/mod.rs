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

//! XMODEM and YMODEM: fixed-size blocks with a per-block acknowledgment

pub mod block;
pub mod receiver;
pub mod sender;

pub use block::CheckMode;
pub use receiver::{ReceiverFsm, ReceiverState};
pub use sender::{SenderFsm, SenderState};

use crate::error::Result;
use crate::TransferReport;

/// Which of the two block protocols a state machine speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flavor {
    /// One file, stored under or read from `name`
    Xmodem { name: String },
    /// Block 0 carries the name and length. Without `batch` the receiver
    /// takes the first file only.
    Ymodem { batch: bool },
}

/// Result of one state step
pub enum Step<T: ?Sized> {
    Next(Box<T>),
    Done(TransferReport),
}

pub fn run_receiver(mut fsm: Box<dyn ReceiverState>) -> Result<TransferReport> {
    loop {
        match fsm.step()? {
            Step::Next(next) => fsm = next,
            Step::Done(report) => return Ok(report),
        }
    }
}

pub fn run_sender(mut fsm: Box<dyn SenderState>) -> Result<TransferReport> {
    loop {
        match fsm.step()? {
            Step::Next(next) => fsm = next,
            Step::Done(report) => return Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::error::TransferError;
    use crate::protocol::SUB;
    use crate::serial::{LinkEnd, LinkPair};
    use crate::storage::MemoryStorage;
    use std::thread;
    use std::time::Duration;

    fn quick_config() -> TransferConfig {
        TransferConfig {
            start_timeout: Duration::from_millis(500),
            byte_timeout: Duration::from_millis(200),
            ..TransferConfig::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn run_pair(
        (tx_end, rx_end): (LinkEnd, LinkEnd),
        source: MemoryStorage,
        dest: MemoryStorage,
        send: Flavor,
        receive: Flavor,
        names: Vec<String>,
        config: TransferConfig,
    ) -> (Result<TransferReport>, Result<TransferReport>) {
        let send_config = config.clone();
        let sender = thread::spawn(move || {
            run_sender(SenderFsm::new(Box::new(tx_end), Box::new(source), send_config, send, names))
        });
        let received = run_receiver(ReceiverFsm::new(Box::new(rx_end), Box::new(dest), config, receive));
        let sent = sender.join().expect("sender thread panicked");
        (sent, received)
    }

    fn xmodem_round_trip(crc: bool) {
        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();
        let data = pattern(300);
        source.insert("in.bin", &data);

        let config = TransferConfig { crc, ..quick_config() };
        let (sent, received) = run_pair(
            LinkPair::clean(),
            source,
            dest.clone(),
            Flavor::Xmodem { name: "in.bin".into() },
            Flavor::Xmodem { name: "out.bin".into() },
            vec!["in.bin".into()],
            config,
        );
        sent.unwrap();
        let report = received.unwrap();
        assert_eq!(report.files[0].bytes, 384);

        // Three 128-byte blocks, the last one padded.
        let stored = dest.get("out.bin").unwrap();
        assert_eq!(stored.len(), 384);
        assert!(stored[300..].iter().all(|&b| b == SUB));
        assert_eq!(stored[..300], data[..]);
    }

    #[test]
    fn test_xmodem_checksum_mode() {
        xmodem_round_trip(false);
    }

    #[test]
    fn test_xmodem_crc_mode() {
        xmodem_round_trip(true);
    }

    #[test]
    fn test_ymodem_batch_of_two() {
        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();
        let first = pattern(1000);
        let second = b"tiny".to_vec();
        source.insert("first.bin", &first);
        source.insert("second.txt", &second);

        let (sent, received) = run_pair(
            LinkPair::clean(),
            source,
            dest.clone(),
            Flavor::Ymodem { batch: true },
            Flavor::Ymodem { batch: true },
            vec!["first.bin".into(), "second.txt".into()],
            quick_config(),
        );

        let sent = sent.unwrap();
        let report = received.unwrap();
        assert_eq!(sent.files.len(), 2);
        let names: Vec<&str> = report.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["first.bin", "second.txt"]);
        assert_eq!(dest.get("first.bin").unwrap(), first);
        assert_eq!(dest.get("second.txt").unwrap(), second);
    }

    #[test]
    fn test_ymodem_1k_blocks() {
        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();
        let data = pattern(5000);
        source.insert("big.bin", &data);

        let config = TransferConfig { block_1k: true, ..quick_config() };
        let (sent, received) = run_pair(
            LinkPair::clean(),
            source,
            dest.clone(),
            Flavor::Ymodem { batch: true },
            Flavor::Ymodem { batch: true },
            vec!["big.bin".into()],
            config,
        );
        sent.unwrap();
        received.unwrap();
        assert_eq!(dest.get("big.bin").unwrap(), data);
    }

    #[test]
    fn test_sender_cancel_reaches_receiver() {
        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();

        // The sender cannot open its file and cancels the session.
        let (sent, received) = run_pair(
            LinkPair::clean(),
            source,
            dest,
            Flavor::Ymodem { batch: true },
            Flavor::Ymodem { batch: true },
            vec!["missing.bin".into()],
            quick_config(),
        );
        assert!(matches!(sent, Err(TransferError::Storage(_))));
        assert!(matches!(received, Err(TransferError::RemoteAbort)));
    }
}
