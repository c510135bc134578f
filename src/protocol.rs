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

//! XMODEM protocol constants

/// Start of header - begins a 128-byte data block
pub const SOH: u8 = 0x01;

/// End of transmission - sender has no more blocks
pub const EOT: u8 = 0x04;

/// Acknowledge - block (or EOT) received intact
pub const ACK: u8 = 0x06;

/// Negative acknowledge - retransmit, or request checksum mode at start
pub const NAK: u8 = 0x15;

/// Cancel - two in a row abort the transfer
pub const CAN: u8 = 0x18;

/// Receiver requests CRC-16 mode at start
pub const CRC_REQUEST: u8 = b'C';

/// Pads a short final block
pub const FILLER: u8 = 0x1A;

/// Payload bytes per block
pub const BLOCK_SIZE: usize = 128;
