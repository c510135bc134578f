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

//! Transfer error types.
//!
//! Transient faults (a single bad block, a single timeout) are retried inside
//! the engines and never surface here. Everything in this enum ends the
//! transfer.

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid block size: expected 128 bytes, got {len}")]
    InvalidBlockSize { len: usize },

    #[error("block sequence out of sync: expected {expected}, got {received}")]
    SyncError { expected: u8, received: u8 },

    #[error("too many errors on block {block} ({errors})")]
    ChecksumExceeded { block: u8, errors: u32 },

    #[error("too many timeouts waiting for the remote side")]
    TimeoutExceeded,

    #[error("channel closed unexpectedly")]
    UnexpectedEndOfChannel,

    #[error("transfer cancelled by remote")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
