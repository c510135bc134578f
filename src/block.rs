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

//! Block framing and validation.
//!
//! A block on the wire is `SOH, seq, 0xFF - seq, payload[128], validator`,
//! where the validator is a one byte additive checksum or a big-endian
//! CRC-16/XMODEM depending on the negotiated [`Mode`].

use std::fmt;
use std::io::{self, Read};
use crate::error::TransferError;
use crate::protocol::{BLOCK_SIZE, FILLER, SOH};

// ============================================================================
// Checksum & CRC
// ============================================================================

const CRC_POLY: u16 = 0x1021;

/// CCITT-16 lookup table, indexed by `(crc >> 8) ^ byte`.
const CCITT_16: [u16; 256] = build_ccitt_table();

const fn build_ccitt_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ CRC_POLY } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn crc16_update(crc: u16, bytes: &[u8]) -> u16 {
    bytes.iter().fold(crc, |crc, &b| {
        (crc << 8) ^ CCITT_16[((crc >> 8) as u8 ^ b) as usize]
    })
}

fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn require_block(payload: &[u8]) -> Result<(), TransferError> {
    if payload.len() != BLOCK_SIZE {
        return Err(TransferError::InvalidBlockSize { len: payload.len() });
    }
    Ok(())
}

/// 8-bit additive checksum of a 128-byte payload.
pub fn checksum(payload: &[u8]) -> Result<u8, TransferError> {
    require_block(payload)?;
    Ok(sum(payload))
}

/// CRC-16/XMODEM (poly 0x1021, init 0) of a 128-byte payload.
pub fn crc16(payload: &[u8]) -> Result<u16, TransferError> {
    require_block(payload)?;
    Ok(crc16_update(0, payload))
}

// ============================================================================
// Mode & Validator
// ============================================================================

/// Block validation mode, fixed once negotiation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Checksum,
    Crc,
}

impl Mode {
    /// Number of validator bytes trailing the payload.
    pub fn validator_len(self) -> usize {
        match self {
            Mode::Checksum => 1,
            Mode::Crc => 2,
        }
    }

    pub fn validator(self, payload: &[u8; BLOCK_SIZE]) -> Validator {
        match self {
            Mode::Checksum => Validator::Checksum(sum(payload)),
            Mode::Crc => Validator::Crc(crc16_update(0, payload)),
        }
    }

    /// Decode validator bytes as read off the wire.
    ///
    /// `bytes` must hold at least [`Mode::validator_len`] bytes.
    pub fn decode_validator(self, bytes: &[u8]) -> Validator {
        match self {
            Mode::Checksum => Validator::Checksum(bytes[0]),
            Mode::Crc => Validator::Crc(u16::from_be_bytes([bytes[0], bytes[1]])),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Checksum => write!(f, "checksum"),
            Mode::Crc => write!(f, "crc-16"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator {
    Checksum(u8),
    Crc(u16),
}

impl Validator {
    fn extend_into(self, out: &mut Vec<u8>) {
        match self {
            Validator::Checksum(c) => out.push(c),
            Validator::Crc(c) => out.extend_from_slice(&c.to_be_bytes()),
        }
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Checksum(c) => write!(f, "0x{:02X}", c),
            Validator::Crc(c) => write!(f, "0x{:04X}", c),
        }
    }
}

// ============================================================================
// Block
// ============================================================================

/// One sequenced 128-byte payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub sequence: u8,
    pub payload: [u8; BLOCK_SIZE],
}

impl Block {
    pub fn new(sequence: u8, payload: [u8; BLOCK_SIZE]) -> Self {
        Block { sequence, payload }
    }

    /// Read up to 128 bytes from `source`, padding a short read with filler.
    ///
    /// Returns the block and the number of real bytes it carries.
    pub fn read_from<R: Read + ?Sized>(sequence: u8, source: &mut R) -> io::Result<(Self, usize)> {
        let mut payload = [FILLER; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match source.read(&mut payload[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        // A reader may have scribbled past `filled` before returning short.
        payload[filled..].fill(FILLER);
        Ok((Block { sequence, payload }, filled))
    }

    /// Frame the block for transmission in the given mode.
    pub fn encode(&self, mode: Mode) -> Vec<u8> {
        let mut frame = Vec::with_capacity(3 + BLOCK_SIZE + mode.validator_len());
        frame.push(SOH);
        frame.push(self.sequence);
        frame.push(sequence_check(self.sequence));
        frame.extend_from_slice(&self.payload);
        mode.validator(&self.payload).extend_into(&mut frame);
        frame
    }
}

/// One's complement of the sequence number, sent after it.
pub fn sequence_check(sequence: u8) -> u8 {
    0xFF - sequence
}

pub fn header_valid(sequence: u8, check: u8) -> bool {
    sequence.wrapping_add(check) == 0xFF
}

/// Trim trailing filler bytes.
pub fn strip_filler(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != FILLER).map_or(0, |i| i + 1);
    &data[..end]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_checksum_known_values() {
        assert_eq!(checksum(&[0x00; 128]).unwrap(), 0);
        assert_eq!(checksum(&[0x01; 128]).unwrap(), 128);
        assert_eq!(checksum(&[0x02; 128]).unwrap(), 0);
        assert_eq!(checksum(&[0x03; 128]).unwrap(), 128);
    }

    #[test]
    fn test_invalid_block_size() {
        match checksum(&[0u8; 127]) {
            Err(TransferError::InvalidBlockSize { len }) => assert_eq!(len, 127),
            other => panic!("Expected InvalidBlockSize, got {:?}", other),
        }
        match crc16(&[0u8; 129]) {
            Err(TransferError::InvalidBlockSize { len }) => assert_eq!(len, 129),
            other => panic!("Expected InvalidBlockSize, got {:?}", other),
        }
    }

    #[test]
    fn test_ccitt_table_matches_published_values() {
        assert_eq!(CCITT_16[0], 0x0000);
        assert_eq!(CCITT_16[1], 0x1021);
        assert_eq!(CCITT_16[2], 0x2042);
        assert_eq!(CCITT_16[16], 0x1231);
        assert_eq!(CCITT_16[128], 0x9188);
        assert_eq!(CCITT_16[200], 0x5844);
        assert_eq!(CCITT_16[232], 0x7C26);
        assert_eq!(CCITT_16[255], 0x1EF0);
    }

    #[test]
    fn test_crc16_check_value() {
        // Standard CRC-16/XMODEM check value
        assert_eq!(crc16_update(0, b"123456789"), 0x31C3);
        assert_eq!(crc16(&[0u8; 128]).unwrap(), 0);
    }

    #[test]
    fn test_encode_checksum_block() {
        let mut payload = [FILLER; 128];
        payload[..5].copy_from_slice(b"hello");
        let frame = Block::new(1, payload).encode(Mode::Checksum);

        assert_eq!(frame.len(), 132);
        assert_eq!(&frame[..3], &[SOH, 0x01, 0xFE]);
        assert_eq!(&frame[3..131], &payload[..]);
        assert_eq!(frame[131], checksum(&payload).unwrap());
    }

    #[test]
    fn test_encode_crc_block() {
        let payload = [0x55; 128];
        let frame = Block::new(0xFF, payload).encode(Mode::Crc);
        let crc = crc16(&payload).unwrap();

        assert_eq!(frame.len(), 133);
        assert_eq!(&frame[..3], &[SOH, 0xFF, 0x00]);
        assert_eq!(frame[131], (crc >> 8) as u8);
        assert_eq!(frame[132], (crc & 0xFF) as u8);
    }

    #[test]
    fn test_read_from_pads_short_source() {
        let mut source: &[u8] = b"short";
        let (block, n) = Block::read_from(3, &mut source).unwrap();
        assert_eq!(n, 5);
        assert_eq!(block.sequence, 3);
        assert_eq!(&block.payload[..5], b"short");
        assert!(block.payload[5..].iter().all(|&b| b == FILLER));

        let (_, n) = Block::read_from(4, &mut source).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_header_valid() {
        assert!(header_valid(1, 0xFE));
        assert!(header_valid(0, 0xFF));
        assert!(!header_valid(1, 0xFF));
    }

    #[test]
    fn test_strip_filler() {
        assert_eq!(strip_filler(b"abc\x1A\x1A\x1A"), b"abc");
        assert_eq!(strip_filler(b"a\x1Ab"), b"a\x1Ab");
        assert_eq!(strip_filler(&[FILLER; 128]), b"");
        assert_eq!(strip_filler(b""), b"");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn checksum_is_sum_mod_256(payload in prop::collection::vec(any::<u8>(), 128)) {
            let expected = payload.iter().map(|&b| b as u32).sum::<u32>() % 256;
            prop_assert_eq!(checksum(&payload).unwrap() as u32, expected);
        }

        #[test]
        fn crc_validator_survives_framing(payload in prop::collection::vec(any::<u8>(), 128)) {
            let mut bytes = [0u8; 128];
            bytes.copy_from_slice(&payload);
            let frame = Block::new(7, bytes).encode(Mode::Crc);

            let received = Mode::Crc.decode_validator(&frame[131..]);
            let mut rx_payload = [0u8; 128];
            rx_payload.copy_from_slice(&frame[3..131]);
            prop_assert_eq!(Mode::Crc.validator(&rx_payload), received);
            prop_assert_eq!(received, Validator::Crc(crc16(&payload).unwrap()));
        }

        #[test]
        fn crc_detects_single_bit_flip(
            payload in prop::collection::vec(any::<u8>(), 128),
            index in 0usize..128,
            bit in 0u8..8,
        ) {
            let mut flipped = payload.clone();
            flipped[index] ^= 1 << bit;
            prop_assert_ne!(crc16(&payload).unwrap(), crc16(&flipped).unwrap());
        }
    }
}
