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

//! ZMODEM: escaped headers and subpackets, streaming with resume

pub mod header;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod subpacket;
pub mod zdle;

pub use header::{Encoding, FrameType, Header};
pub use receiver::ZmodemReceiver;
pub use sender::ZmodemSender;
pub use zdle::FrameEnd;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::error::TransferError;
    use crate::serial::{LinkEnd, LinkPair};
    use crate::storage::MemoryStorage;
    use crate::TransferReport;
    use std::thread;
    use std::time::Duration;

    fn source_data(len: usize) -> Vec<u8> {
        let mut seed = 12345u32;
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (seed >> 16) as u8
            })
            .collect()
    }

    fn run_pair(
        (tx_end, rx_end): (LinkEnd, LinkEnd),
        source: MemoryStorage,
        dest: MemoryStorage,
        names: Vec<String>,
        config: TransferConfig,
    ) -> (Result<TransferReport, TransferError>, Result<TransferReport, TransferError>) {
        let send_config = config.clone();
        let sender = thread::spawn(move || {
            ZmodemSender::new(Box::new(tx_end), Box::new(source), send_config, names).run()
        });
        let received = ZmodemReceiver::new(Box::new(rx_end), Box::new(dest), config, None).run();
        let sent = sender.join().expect("sender thread panicked");
        (sent, received)
    }

    #[test]
    fn test_clean_link_two_files() {
        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();
        let first = source_data(5000);
        let second = b"second file\n".to_vec();
        source.insert("first.bin", &first);
        source.insert("second.txt", &second);

        let config = TransferConfig {
            session_timeout: Duration::from_millis(500),
            byte_timeout: Duration::from_millis(200),
            ..TransferConfig::default()
        };
        let (sent, received) = run_pair(
            LinkPair::clean(),
            source,
            dest.clone(),
            vec!["first.bin".into(), "second.txt".into()],
            config,
        );

        sent.unwrap();
        let report = received.unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(dest.get("first.bin").unwrap(), first);
        assert_eq!(dest.get("second.txt").unwrap(), second);
    }

    #[test]
    fn test_lossy_link_recovers() {
        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();
        let data = source_data(10_000);
        source.insert("noisy.bin", &data);

        // Roughly one byte in a hundred is corrupted in each direction.
        let config = TransferConfig {
            session_timeout: Duration::from_millis(300),
            byte_timeout: Duration::from_millis(100),
            max_retries: 200,
            subpacket_size: 32,
            window: 4,
            ..TransferConfig::default()
        };
        let (sent, received) = run_pair(
            LinkPair::lossy(100, 2024),
            source,
            dest.clone(),
            vec!["noisy.bin".into()],
            config,
        );

        let report = received.expect("receiver failed");
        sent.expect("sender failed");
        assert_eq!(report.files.len(), 1);
        assert_eq!(dest.get("noisy.bin").unwrap(), data);
    }

    #[test]
    fn test_interrupted_transfer_resumes() {
        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();
        let data = source_data(3000);
        source.insert("big.bin", &data);

        let config = TransferConfig {
            session_timeout: Duration::from_millis(300),
            byte_timeout: Duration::from_millis(100),
            max_retries: 3,
            subpacket_size: 256,
            ..TransferConfig::default()
        };

        // First session dies when the destination fills up.
        dest.fail_writes_after(1000);
        let (_, received) = run_pair(
            LinkPair::clean(),
            source.clone(),
            dest.clone(),
            vec!["big.bin".into()],
            config.clone(),
        );
        assert!(matches!(received, Err(TransferError::Storage(_))));
        let kept = dest.get("big.bin").unwrap();
        assert!(!kept.is_empty() && kept.len() <= 1000);
        assert_eq!(kept[..], data[..kept.len()]);

        // Second session continues from the verified bytes.
        dest.fail_writes_after(usize::MAX);
        let (sent, received) = run_pair(
            LinkPair::clean(),
            source,
            dest.clone(),
            vec!["big.bin".into()],
            config,
        );
        sent.unwrap();
        let report = received.unwrap();
        assert_eq!(report.files[0].resumed_from, kept.len() as u64);
        assert_eq!(dest.get("big.bin").unwrap(), data);
    }
}
