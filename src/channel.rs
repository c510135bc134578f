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

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};
use crate::error::TransferError;

/// How long the line must stay quiet before a drain stops.
const DRAIN_QUIET: Duration = Duration::from_millis(10);

// ============================================================================
// Channel Trait
// ============================================================================

/// Duplex byte stream an XMODEM engine talks over.
///
/// `read_timeout` reports "no data yet" as an error of kind `TimedOut` or
/// `WouldBlock`, and end of stream as `Ok(0)`.
pub trait Channel: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Read one byte, waiting at most `timeout`. `None` means the wait expired.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransferError> {
        let mut buf = [0u8; 1];
        match self.read_timeout(&mut buf, timeout) {
            Ok(0) => Err(TransferError::UnexpectedEndOfChannel),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) if is_closed(&e) => Err(TransferError::UnexpectedEndOfChannel),
            Err(e) => Err(e.into()),
        }
    }

    /// Discard whatever is already buffered on the line.
    fn drain(&mut self) -> Result<usize, TransferError> {
        let mut discarded = 0;
        while self.read_byte(DRAIN_QUIET)?.is_some() {
            discarded += 1;
        }
        Ok(discarded)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// The peer went away. Reported as `UnexpectedEndOfChannel`, not as I/O.
pub(crate) fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

// ============================================================================
// Serial Port
// ============================================================================

/// Serial line backed by the serialport crate
pub struct SerialChannel {
    port: Box<dyn SerialPortTrait>,
}

impl SerialChannel {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(SerialChannel { port })
    }
}

impl Channel for SerialChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(io::Error::other)?;
        self.port.read(buf)
    }
}

// ============================================================================
// TCP
// ============================================================================

impl Channel for TcpStream {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        // A zero timeout means "block forever" to set_read_timeout
        self.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        Read::read(self, buf)
    }
}

// ============================================================================
// Mock Channel for Testing
// ============================================================================

#[cfg(test)]
pub struct MockChannel {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Report end of stream instead of timing out once responses run out
    eof_when_exhausted: bool,
    // Fail every write as if the peer hung up
    broken_writes: bool,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockChannel {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockChannel {
            read_buffer: responses,
            read_pos: 0,
            eof_when_exhausted: false,
            broken_writes: false,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    pub fn closing(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        let mut mock = MockChannel::new(responses, expected_writes);
        mock.eof_when_exhausted = true;
        mock
    }

    pub fn hung_up(responses: Vec<Option<u8>>) -> Self {
        let mut mock = MockChannel::new(responses, Vec::new());
        mock.broken_writes = true;
        mock
    }
}

#[cfg(test)]
impl Channel for MockChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.broken_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Mock hang-up"));
        }
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        if self.read_pos >= self.read_buffer.len() {
            if self.eof_when_exhausted {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Mock timeout"));
        }

        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Mock timeout"));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }
}

#[cfg(test)]
impl Drop for MockChannel {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockChannel dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockChannel write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

// ============================================================================
// In-memory Loopback for Testing
// ============================================================================

#[cfg(test)]
pub struct PipeChannel {
    // Each write travels as one chunk, so a frame lands on the line whole
    tx: std::sync::mpsc::Sender<Vec<u8>>,
    rx: std::sync::mpsc::Receiver<Vec<u8>>,
    buffered: std::collections::VecDeque<u8>,
}

/// Two connected endpoints. Dropping one reads as end of stream on the other.
#[cfg(test)]
pub fn pipe() -> (PipeChannel, PipeChannel) {
    let (a_tx, b_rx) = std::sync::mpsc::channel();
    let (b_tx, a_rx) = std::sync::mpsc::channel();
    (
        PipeChannel { tx: a_tx, rx: a_rx, buffered: Default::default() },
        PipeChannel { tx: b_tx, rx: b_rx, buffered: Default::default() },
    )
}

#[cfg(test)]
impl Channel for PipeChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.tx.send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use std::sync::mpsc::RecvTimeoutError;

        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffered.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(chunk) => self.buffered.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe timeout"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        while let Ok(chunk) = self.rx.try_recv() {
            self.buffered.extend(chunk);
        }

        let mut n = 0;
        while n < buf.len() {
            match self.buffered.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

/// Line fault applied by [`Faulty`]. Read positions count from 1.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Replace every Nth byte read with its complement.
    CorruptIn(usize),
    /// Flip the low bit of every Nth byte read.
    FlipIn(usize),
    /// Flip the low bit of the Nth byte read, once.
    FlipAt(usize),
    /// Overwrite the Nth byte read, once.
    ReplaceAt(usize, u8),
    /// Silently swallow every Nth byte written.
    DropOut(usize),
    /// Swallow every written byte equal to this value.
    FilterOut(u8),
}

#[cfg(test)]
impl Fault {
    fn on_read(self, position: usize, byte: u8) -> u8 {
        match self {
            Fault::CorruptIn(every) if position % every == 0 => 0xFF - byte,
            Fault::FlipIn(every) if position % every == 0 => byte ^ 0x01,
            Fault::FlipAt(at) if position == at => byte ^ 0x01,
            Fault::ReplaceAt(at, value) if position == at => value,
            _ => byte,
        }
    }

    fn drops_write(self, position: usize, byte: u8) -> bool {
        match self {
            Fault::DropOut(every) => position % every == 0,
            Fault::FilterOut(value) => byte == value,
            _ => false,
        }
    }
}

#[cfg(test)]
pub struct Faulty<C> {
    inner: C,
    faults: Vec<Fault>,
    read_count: usize,
    write_count: usize,
}

#[cfg(test)]
impl<C: Channel> Faulty<C> {
    pub fn new(inner: C, fault: Fault) -> Self {
        Faulty::with_faults(inner, vec![fault])
    }

    pub fn with_faults(inner: C, faults: Vec<Fault>) -> Self {
        Faulty { inner, faults, read_count: 0, write_count: 0 }
    }
}

#[cfg(test)]
impl<C: Channel> Channel for Faulty<C> {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut kept = Vec::with_capacity(buf.len());
        for &b in buf {
            self.write_count += 1;
            let position = self.write_count;
            if !self.faults.iter().any(|f| f.drops_write(position, b)) {
                kept.push(b);
            }
        }
        self.inner.write_all(&kept)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let n = self.inner.read_timeout(buf, timeout)?;
        for b in &mut buf[..n] {
            self.read_count += 1;
            for fault in &self.faults {
                *b = fault.on_read(self.read_count, *b);
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_byte_maps_timeout_and_eof() {
        let mut mock = MockChannel::closing(vec![Some(0x42), None], vec![]);
        assert_eq!(mock.read_byte(Duration::from_millis(1)).unwrap(), Some(0x42));
        assert_eq!(mock.read_byte(Duration::from_millis(1)).unwrap(), None);
        assert!(matches!(
            mock.read_byte(Duration::from_millis(1)),
            Err(TransferError::UnexpectedEndOfChannel)
        ));
    }

    #[test]
    fn test_drain_stops_at_quiet_line() {
        let mut mock = MockChannel::new(vec![Some(1), Some(2), Some(3), None, Some(4)], vec![]);
        assert_eq!(mock.drain().unwrap(), 3);
        assert_eq!(mock.read_byte(Duration::from_millis(1)).unwrap(), Some(4));
    }

    #[test]
    fn test_pipe_delivers_in_order_and_reports_close() {
        let (mut a, mut b) = pipe();
        a.write_all(&[1, 2, 3]).unwrap();
        let timeout = Duration::from_millis(50);
        assert_eq!(b.read_byte(timeout).unwrap(), Some(1));
        assert_eq!(b.read_byte(timeout).unwrap(), Some(2));
        assert_eq!(b.read_byte(timeout).unwrap(), Some(3));
        assert_eq!(b.read_byte(timeout).unwrap(), None);

        drop(a);
        assert!(matches!(b.read_byte(timeout), Err(TransferError::UnexpectedEndOfChannel)));
    }

    #[test]
    fn test_faulty_corrupts_and_drops() {
        let (a, mut b) = pipe();
        let mut a = Faulty::new(a, Fault::DropOut(2));
        a.write_all(&[1, 2, 3, 4]).unwrap();
        let timeout = Duration::from_millis(50);
        assert_eq!(b.read_byte(timeout).unwrap(), Some(1));
        assert_eq!(b.read_byte(timeout).unwrap(), Some(3));
        assert_eq!(b.read_byte(timeout).unwrap(), None);

        let (mut c, d) = pipe();
        let mut d = Faulty::new(d, Fault::CorruptIn(2));
        c.write_all(&[0x10, 0x10]).unwrap();
        assert_eq!(d.read_byte(timeout).unwrap(), Some(0x10));
        assert_eq!(d.read_byte(timeout).unwrap(), Some(0xEF));
    }

    #[test]
    fn test_faulty_flips_single_bits() {
        let timeout = Duration::from_millis(50);
        let (mut a, b) = pipe();
        let mut b = Faulty::with_faults(b, vec![Fault::FlipIn(3), Fault::FlipAt(2)]);
        a.write_all(&[0x01, 0x01, 0x04, 0x10, 0x10, 0x10]).unwrap();

        let mut got = Vec::new();
        while let Some(byte) = b.read_byte(timeout).unwrap() {
            got.push(byte);
        }
        assert_eq!(got, vec![0x01, 0x00, 0x05, 0x10, 0x10, 0x11]);
    }

    #[test]
    fn test_faulty_replaces_once() {
        let timeout = Duration::from_millis(50);
        let (mut a, b) = pipe();
        let mut b = Faulty::new(b, Fault::ReplaceAt(2, 0x99));
        a.write_all(&[1, 2, 3]).unwrap();
        a.write_all(&[4, 5]).unwrap();

        let mut got = Vec::new();
        while let Some(byte) = b.read_byte(timeout).unwrap() {
            got.push(byte);
        }
        assert_eq!(got, vec![1, 0x99, 3, 4, 5]);
    }

    #[test]
    fn test_hang_up_reads_as_end_of_channel() {
        let hang_up = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(is_closed(&hang_up));
        assert!(!is_closed(&io::Error::new(io::ErrorKind::TimedOut, "slow")));

        let (mut a, b) = pipe();
        drop(b);
        let err = a.write_all(&[crate::protocol::ACK]).unwrap_err();
        assert!(is_closed(&err));
    }
}
