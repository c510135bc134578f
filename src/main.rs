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

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use xmodem::{Channel, Config, Mode, SerialChannel, TransferError};

#[derive(Parser)]
#[command(name = "xmodem")]
#[command(about = "XMODEM file transfer over a serial line or TCP socket", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long, required_unless_present_any = ["tcp", "listen"], conflicts_with_all = ["tcp", "listen"])]
    port: Option<String>,

    /// Connect to a TCP peer instead of a serial port
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "listen")]
    tcp: Option<String>,

    /// Wait for one TCP connection on this address instead of using a serial port
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Seconds to wait for a single byte
    #[arg(long, default_value = "5", value_name = "SECS", value_parser = parse_timeout)]
    timeout: Duration,

    /// Bad blocks tolerated in a row before the receiver gives up
    #[arg(long, default_value = "10", value_name = "N")]
    max_errors: u32,

    /// Timeout periods the sender waits for a response before giving up
    #[arg(long, default_value = "5", value_name = "N")]
    max_timeouts: u32,

    /// CRC requests the receiver sends before falling back to checksum mode
    #[arg(long, default_value = "3", value_name = "N")]
    crc_attempts: u32,

    /// Delay in milliseconds between sending each byte of a data block
    #[arg(long, default_value = "0", value_name = "MS")]
    byte_delay: u64,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file using XMODEM
    Send {
        /// File to send
        file: PathBuf,
    },
    /// Receive a file using XMODEM
    Receive {
        /// Where to write the received data
        file: PathBuf,

        /// Request CRC-16 blocks instead of 8-bit checksums
        #[arg(long)]
        crc: bool,
    },
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("Invalid timeout: {}", s))?;
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(format!("Invalid timeout: {}. Must be a positive number of seconds", s)),
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

fn open_channel(cli: &Cli) -> Result<Box<dyn Channel>, String> {
    if let Some(addr) = &cli.tcp {
        println!("Connecting to {}", addr);
        let stream = TcpStream::connect(addr)
            .map_err(|e| format!("Failed to connect to {}: {}", addr, e))?;
        return Ok(Box::new(stream));
    }

    if let Some(addr) = &cli.listen {
        let listener = TcpListener::bind(addr)
            .map_err(|e| format!("Failed to listen on {}: {}", addr, e))?;
        println!("Waiting for connection on {}", addr);
        let (stream, peer) = listener.accept()
            .map_err(|e| format!("Failed to accept connection: {}", e))?;
        println!("Connected: {}", peer);
        return Ok(Box::new(stream));
    }

    let port = cli.port.as_deref().ok_or("No serial port or TCP address given")?;
    let data_bits = parse_data_bits(cli.data_bits)?;
    let parity = parse_parity(&cli.parity)?;
    let stop_bits = parse_stop_bits(cli.stop_bits)?;

    println!("Opening serial port: {}", port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let channel = SerialChannel::open(port, cli.baud, data_bits, parity, stop_bits)
        .map_err(|e| format!("Failed to open serial port: {}", e))?;
    Ok(Box::new(channel))
}

fn main() {
    let cli = Cli::parse();
    xmodem::logging::init(cli.debug);

    let mut config = Config {
        timeout: cli.timeout,
        max_timeouts: cli.max_timeouts,
        max_errors: cli.max_errors,
        crc_attempts: cli.crc_attempts,
        byte_delay: Duration::from_millis(cli.byte_delay),
        ..Config::default()
    };

    let mut channel = match open_channel(&cli) {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Send { file } => {
            println!("\nSending file: {}", file.display());
            if let Err(e) = send_file(channel.as_mut(), &file, &config) {
                eprintln!("Send failed: {}", e);
                std::process::exit(1);
            }
            println!("\nFile sent successfully!");
        }
        Commands::Receive { file, crc } => {
            if crc {
                config.mode = Mode::Crc;
            }
            println!("\nReceiving file: {}", file.display());
            if let Err(e) = receive_file(channel.as_mut(), &file, &config) {
                eprintln!("Receive failed: {}", e);
                std::process::exit(1);
            }
            println!("\nFile received successfully!");
        }
    }
}

fn send_file(channel: &mut dyn Channel, file: &Path, config: &Config) -> Result<(), TransferError> {
    if !file.exists() {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("File not found: {}", file.display()),
        )));
    }

    let mut source = BufReader::new(File::open(file)?);
    xmodem::send(channel, &mut source, config)
}

fn receive_file(channel: &mut dyn Channel, file: &Path, config: &Config) -> Result<(), TransferError> {
    let mut sink = BufWriter::new(File::create(file)?);
    xmodem::receive(channel, &mut sink, config)
}
