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
use std::io::Write;
use tracing::{debug, info, warn};
use crate::block::{self, Mode};
use crate::channel::{self, Channel};
use crate::config::Config;
use crate::error::TransferError;
use crate::protocol::*;

// ============================================================================
// States
// ============================================================================

pub struct Negotiate;
pub struct AwaitCommand;
pub struct ReceiveBlock;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<'a, State> {
    state: PhantomData<State>,
    channel: &'a mut dyn Channel,
    sink: &'a mut dyn Write,
    config: &'a Config,
    mode: Mode,
    expected: u8,
    error_count: u32,
    // Last accepted payload, written once its successor (or EOT) arrives
    pending: Vec<u8>,
    // Byte read while negotiating that belongs to the main loop
    lookahead: Option<u8>,
    cancel_seen: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub enum Step<'a> {
    Next(Box<dyn ReceiverState<'a> + 'a>),
    Done,
}

pub trait ReceiverState<'a> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError>;
}

#[derive(Debug, Clone, Copy)]
enum BlockFault {
    Timeout,
    Corrupt,
}

// ============================================================================
// Helpers
// ============================================================================

impl<'a, S> ReceiverFsm<'a, S> {
    fn transition<T>(self) -> Box<ReceiverFsm<'a, T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            channel: self.channel,
            sink: self.sink,
            config: self.config,
            mode: self.mode,
            expected: self.expected,
            error_count: self.error_count,
            pending: self.pending,
            lookahead: self.lookahead,
            cancel_seen: self.cancel_seen,
        })
    }

    fn next<T: 'a>(self) -> Step<'a>
    where
        ReceiverFsm<'a, T>: ReceiverState<'a>,
    {
        Step::Next(self.transition::<T>())
    }

    fn io_error(e: std::io::Error) -> TransferError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        TransferError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    fn send(&mut self, byte: u8) -> Result<(), TransferError> {
        self.channel.write_all(&[byte]).map_err(|e| {
            if channel::is_closed(&e) {
                TransferError::UnexpectedEndOfChannel
            } else {
                Self::io_error(e)
            }
        })
    }

    /// Throw away the rest of a broken frame so none of it reads as a command.
    fn purge(&mut self) -> Result<(), TransferError> {
        let discarded = self.channel.drain()?;
        if discarded > 0 {
            debug!("Purged {} bytes from the line", discarded);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes, each bounded by the timeout. `false` on timeout.
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<bool, TransferError> {
        for slot in buf.iter_mut() {
            match self.channel.read_byte(self.config.timeout)? {
                Some(byte) => *slot = byte,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn commit_pending(&mut self, strip: bool) -> Result<(), TransferError> {
        let data = if strip { block::strip_filler(&self.pending) } else { &self.pending[..] };
        self.sink.write_all(data).map_err(Self::io_error)?;
        self.pending.clear();
        Ok(())
    }

    /// NAK the current block and charge it against the error budget.
    fn block_error(&mut self, fault: BlockFault, block: u8) -> Result<(), TransferError> {
        self.purge()?;
        self.send(NAK)?;
        self.error_count += 1;
        warn!(
            "{:?} error #{} on block {} (max {})",
            fault, self.error_count, block, self.config.max_errors
        );

        if self.error_count > self.config.max_errors {
            return Err(match fault {
                BlockFault::Timeout => TransferError::TimeoutExceeded,
                BlockFault::Corrupt => TransferError::ChecksumExceeded {
                    block,
                    errors: self.error_count,
                },
            });
        }
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, Negotiate> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError> {
        let mut fsm = *self;

        let stray = fsm.channel.drain()?;
        if stray > 0 {
            debug!("Discarded {} stray bytes before start", stray);
        }
        info!("Receiver: requesting {} mode", fsm.mode);

        if fsm.mode == Mode::Crc {
            for attempt in 1..=fsm.config.crc_attempts {
                fsm.send(CRC_REQUEST)?;
                debug!("Sent: 'C' (attempt {})", attempt);

                if let Some(byte) = fsm.channel.read_byte(fsm.config.timeout)? {
                    fsm.lookahead = Some(byte);
                    return Ok(fsm.next::<AwaitCommand>());
                }
            }
            warn!("CRC-16 request unanswered, falling back to checksum mode");
            fsm.mode = Mode::Checksum;
        }

        fsm.send(NAK)?;
        debug!("Sent: NAK");
        Ok(fsm.next::<AwaitCommand>())
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, AwaitCommand> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError> {
        let mut fsm = *self;

        let byte = match fsm.lookahead.take() {
            Some(byte) => Some(byte),
            None => fsm.channel.read_byte(fsm.config.timeout)?,
        };

        let Some(byte) = byte else {
            let block = fsm.expected;
            fsm.block_error(BlockFault::Timeout, block)?;
            return Ok(fsm.next::<AwaitCommand>());
        };

        let cancel_seen = std::mem::replace(&mut fsm.cancel_seen, false);
        match byte {
            SOH => {
                debug!("Received: SOH");
                Ok(fsm.next::<ReceiveBlock>())
            }
            EOT => {
                debug!("Received: EOT");
                fsm.send(ACK)?;
                debug!("Sent: ACK");
                fsm.commit_pending(true)?;
                fsm.sink.flush().map_err(Self::io_error)?;
                info!("Receive complete");
                Ok(Step::Done)
            }
            CAN if cancel_seen => {
                warn!("Received: CAN CAN, transfer cancelled by sender");
                Err(TransferError::Cancelled)
            }
            CAN => {
                debug!("Received: CAN");
                fsm.cancel_seen = true;
                Ok(fsm.next::<AwaitCommand>())
            }
            other => {
                warn!("Expected SOH or EOT, got 0x{:02X}", other);
                fsm.purge()?;
                Ok(fsm.next::<AwaitCommand>())
            }
        }
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, ReceiveBlock> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError> {
        let mut fsm = *self;
        let expected = fsm.expected;

        let mut header = [0u8; 2];
        if !fsm.read_bytes(&mut header)? {
            fsm.block_error(BlockFault::Timeout, expected)?;
            return Ok(fsm.next::<AwaitCommand>());
        }
        let [sequence, check] = header;
        debug!(
            "Block number 0x{:02X} / check 0x{:02X} (expected 0x{:02X})",
            sequence, check, expected
        );

        // A header that fails its own check says nothing about the sequence
        if !block::header_valid(sequence, check) {
            warn!("Invalid block number check 0x{:02X} for block 0x{:02X}", check, sequence);
            fsm.block_error(BlockFault::Corrupt, expected)?;
            return Ok(fsm.next::<AwaitCommand>());
        }

        let duplicate = expected.wrapping_sub(1);
        if sequence != expected && sequence != duplicate {
            return Err(TransferError::SyncError { expected, received: sequence });
        }

        let is_new = sequence == expected;
        if is_new {
            // The previous block is confirmed now that its successor arrived
            fsm.commit_pending(false)?;
        }

        let body_len = BLOCK_SIZE + fsm.mode.validator_len();
        let mut body = [0u8; BLOCK_SIZE + 2];
        if !fsm.read_bytes(&mut body[..body_len])? {
            fsm.block_error(BlockFault::Timeout, sequence)?;
            return Ok(fsm.next::<AwaitCommand>());
        }

        let mut payload = [0u8; BLOCK_SIZE];
        payload.copy_from_slice(&body[..BLOCK_SIZE]);
        let received = fsm.mode.decode_validator(&body[BLOCK_SIZE..body_len]);
        let computed = fsm.mode.validator(&payload);

        if computed != received {
            warn!(
                "Invalid {} for block {}: calculated {}, got {}",
                fsm.mode, sequence, computed, received
            );
            fsm.block_error(BlockFault::Corrupt, sequence)?;
            return Ok(fsm.next::<AwaitCommand>());
        }

        fsm.send(ACK)?;
        debug!("Sent: ACK (block {})", sequence);

        if is_new {
            fsm.pending.clear();
            fsm.pending.extend_from_slice(&payload);
            fsm.expected = expected.wrapping_add(1);
            fsm.error_count = 0;
        } else {
            debug!("Duplicate block {}, acknowledged again", sequence);
        }

        Ok(fsm.next::<AwaitCommand>())
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl<'a> ReceiverFsm<'a, Negotiate> {
    pub fn new(
        channel: &'a mut dyn Channel,
        sink: &'a mut dyn Write,
        config: &'a Config,
    ) -> Box<dyn ReceiverState<'a> + 'a> {
        Box::new(ReceiverFsm {
            state: PhantomData::<Negotiate>,
            channel,
            sink,
            config,
            mode: config.mode,
            expected: 1,
            error_count: 0,
            pending: Vec::with_capacity(BLOCK_SIZE),
            lookahead: None,
            cancel_seen: false,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
