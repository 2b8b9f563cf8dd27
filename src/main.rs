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

use clap::{Parser, Subcommand, ValueEnum};
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

use xyzmodem::serial::{RealSerialPort, SerialPort};
use xyzmodem::storage::{DiskStorage, Storage};
use xyzmodem::{TransferConfig, TransferError, TransferReport};

/// File name used when an XMODEM receive is not given one
const DEFAULT_XMODEM_NAME: &str = "xmodem.tmp";

#[derive(Parser)]
#[command(name = "xyzmodem")]
#[command(about = "XMODEM, YMODEM and ZMODEM file transfer over a serial link", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0, /dev/ttyACM0, /dev/rfcomm0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Transfer protocol
    #[arg(long, global = true, value_enum, default_value_t = Protocol::Zmodem)]
    protocol: Protocol,

    /// Log level written to stderr
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,

    /// Consecutive failures tolerated before giving up
    #[arg(long, default_value = "10")]
    retries: u32,

    /// Seconds to wait for the remote to start or answer
    #[arg(long, default_value = "60", value_name = "SECS")]
    timeout: u64,

    /// ZMODEM: largest data subpacket
    #[arg(long, default_value = "1024", value_name = "BYTES")]
    subpacket_size: usize,

    /// ZMODEM: escape every control character
    #[arg(long)]
    escape_all: bool,

    /// ZMODEM: never use 32-bit CRC frames
    #[arg(long)]
    crc16: bool,

    /// ZMODEM: overwrite partial files instead of resuming them
    #[arg(long)]
    no_resume: bool,

    /// XMODEM: request the 8-bit checksum instead of CRC-16
    #[arg(long)]
    checksum: bool,

    /// XMODEM/YMODEM: send 1024-byte blocks
    #[arg(long)]
    one_k: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files to the remote
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Receive files from the remote
    Receive {
        /// Directory to save received files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Store the (first) incoming file under this name
        #[arg(long)]
        name: Option<String>,

        /// ZMODEM: hex header already read from the line (e.g. B00000000000000)
        #[arg(long, value_name = "TEXT")]
        zmodem_header: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Xmodem,
    Ymodem,
    Zmodem,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug { LogLevel::Debug } else { cli.log_level };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level.as_filter())
        .with_target(false)
        .try_init();
}

fn transfer_config(cli: &Cli) -> TransferConfig {
    let defaults = TransferConfig::default();
    TransferConfig {
        session_timeout: Duration::from_secs(cli.timeout),
        start_timeout: Duration::from_secs(cli.timeout.min(defaults.start_timeout.as_secs())),
        max_retries: cli.retries,
        subpacket_size: cli.subpacket_size.clamp(32, 8192),
        escape_all: cli.escape_all,
        use_crc32: !cli.crc16,
        resume: !cli.no_resume,
        crc: !cli.checksum,
        block_1k: cli.one_k,
        ..defaults
    }
}

fn exit_with(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let data_bits = parse_data_bits(cli.data_bits).unwrap_or_else(|e| exit_with(&e));
    let parity = parse_parity(&cli.parity).unwrap_or_else(|e| exit_with(&e));
    let stop_bits = parse_stop_bits(cli.stop_bits).unwrap_or_else(|e| exit_with(&e));

    info!("opening {} at {} baud, {:?}, {:?}, {:?}", cli.port, cli.baud, data_bits, parity, stop_bits);
    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => exit_with(&format!("Failed to open serial port: {}", e)),
    };
    let config = transfer_config(&cli);

    let result = match &cli.command {
        Commands::Send { files } => send_files(&cli, Box::new(serial_port), files, config),
        Commands::Receive { output_dir, name, zmodem_header } => {
            if !output_dir.is_dir() {
                exit_with(&format!("Output directory not found: {}", output_dir.display()));
            }
            let storage = Box::new(DiskStorage::new(output_dir));
            receive_files(&cli, Box::new(serial_port), storage, name.clone(), zmodem_header.as_deref(), config)
        }
    };

    match result {
        Ok(report) => {
            for file in &report.files {
                let note = if file.skipped {
                    " (skipped)".to_string()
                } else if file.resumed_from > 0 {
                    format!(" (resumed at {})", file.resumed_from)
                } else {
                    String::new()
                };
                println!("{}: {} bytes{}", file.name, file.bytes, note);
            }
            println!("Transfer complete, {} file(s)", report.files.len());
        }
        Err(e) => {
            error!("{}", e);
            exit_with(&format!("Transfer failed: {}", e));
        }
    }
}

fn send_files(
    cli: &Cli,
    port: Box<dyn SerialPort>,
    files: &[PathBuf],
    config: TransferConfig,
) -> Result<TransferReport, TransferError> {
    for file in files {
        if !file.is_file() {
            exit_with(&format!("File not found: {}", file.display()));
        }
    }
    let names: Vec<String> = files.iter().map(|f| f.to_string_lossy().into_owned()).collect();
    let storage = Box::new(DiskStorage::new("."));

    match cli.protocol {
        Protocol::Zmodem => xyzmodem::zmodem_send(port, storage, config, names),
        Protocol::Ymodem => xyzmodem::ymodem_send(port, storage, config, names),
        Protocol::Xmodem => {
            if names.len() > 1 {
                exit_with("XMODEM sends a single file");
            }
            xyzmodem::xmodem_send(port, storage, config, &names[0])
        }
    }
}

fn receive_files(
    cli: &Cli,
    port: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    name: Option<String>,
    zmodem_header: Option<&str>,
    config: TransferConfig,
) -> Result<TransferReport, TransferError> {
    match cli.protocol {
        Protocol::Zmodem => match zmodem_header {
            Some(text) => xyzmodem::zmodem_receive_after(port, storage, config, name, text.as_bytes()),
            None => xyzmodem::zmodem_receive(port, storage, config, name),
        },
        Protocol::Ymodem => xyzmodem::ymodem_receive(port, storage, config, true),
        Protocol::Xmodem => {
            let name = name.unwrap_or_else(|| DEFAULT_XMODEM_NAME.to_string());
            xyzmodem::xmodem_receive(port, storage, config, &name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_accepts_zmodem_header() {
        let cli = Cli::try_parse_from([
            "xyzmodem", "--port", "/dev/ttyUSB0", "receive", "--name", "fw.bin", "--zmodem-header", "B00000000000000",
        ])
        .unwrap();
        match cli.command {
            Commands::Receive { name, zmodem_header, .. } => {
                assert_eq!(name.as_deref(), Some("fw.bin"));
                assert_eq!(zmodem_header.as_deref(), Some("B00000000000000"));
            }
            _ => panic!("expected receive"),
        }
        assert_eq!(cli.protocol, Protocol::Zmodem);
    }
}
