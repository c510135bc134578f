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
use std::io::BufRead;
use tracing::{debug, info, warn};
use crate::block::{Block, Mode};
use crate::channel::{self, Channel};
use crate::config::Config;
use crate::error::TransferError;
use crate::protocol::*;

// ============================================================================
// States
// ============================================================================

pub struct LoadFirstBlock;
pub struct AwaitResponse;
pub struct TransmitBlock;
pub struct AwaitEotAck;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<'a, State> {
    state: PhantomData<State>,
    channel: &'a mut dyn Channel,
    source: &'a mut dyn BufRead,
    config: &'a Config,
    mode: Mode,
    block: Block,
    // Set once the current block has gone out at least once
    transmitted: bool,
    // Sequence numbers wrap, so "block 1" alone does not identify the first block
    first_block: bool,
    cancel_seen: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub enum Step<'a> {
    Next(Box<dyn SenderState<'a> + 'a>),
    Done,
}

pub trait SenderState<'a> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<'a, S> SenderFsm<'a, S> {
    fn transition<T>(self) -> Box<SenderFsm<'a, T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            channel: self.channel,
            source: self.source,
            config: self.config,
            mode: self.mode,
            block: self.block,
            transmitted: self.transmitted,
            first_block: self.first_block,
            cancel_seen: self.cancel_seen,
        })
    }

    fn next<T: 'a>(self) -> Step<'a>
    where
        SenderFsm<'a, T>: SenderState<'a>,
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

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.channel.write_all(bytes).map_err(|e| {
            if channel::is_closed(&e) {
                TransferError::UnexpectedEndOfChannel
            } else {
                Self::io_error(e)
            }
        })
    }

    fn load_block(&mut self, sequence: u8) -> Result<(), TransferError> {
        let (block, len) = Block::read_from(sequence, &mut *self.source).map_err(Self::io_error)?;
        debug!("Prepared block {} ({} bytes)", sequence, len);
        self.block = block;
        self.transmitted = false;
        Ok(())
    }

    fn source_exhausted(&mut self) -> Result<bool, TransferError> {
        Ok(self.source.fill_buf().map_err(Self::io_error)?.is_empty())
    }

    /// Wait for the receiver. `None` when it stayed silent for the whole bound.
    fn await_byte(&mut self) -> Result<Option<u8>, TransferError> {
        self.channel.read_byte(self.config.response_timeout())
    }

    /// Track CAN bytes; true on the second one in a row.
    fn cancelled(&mut self, byte: u8) -> bool {
        let previous = std::mem::replace(&mut self.cancel_seen, byte == CAN);
        previous && byte == CAN
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> SenderState<'a> for SenderFsm<'a, LoadFirstBlock> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError> {
        let mut fsm = *self;
        fsm.load_block(1)?;
        info!("Sender: waiting for receiver");
        Ok(fsm.next::<AwaitResponse>())
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, AwaitResponse> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError> {
        let mut fsm = *self;

        let Some(byte) = fsm.await_byte()? else {
            warn!(
                "No response within {:?}",
                fsm.config.response_timeout()
            );
            return Err(TransferError::TimeoutExceeded);
        };

        if fsm.cancelled(byte) {
            warn!("Received: CAN CAN, transfer cancelled by receiver");
            return Err(TransferError::Cancelled);
        }

        match byte {
            ACK if !fsm.transmitted => {
                debug!("Received: ACK before block {} was sent, ignoring", fsm.block.sequence);
                Ok(fsm.next::<AwaitResponse>())
            }
            ACK => {
                debug!("Received: ACK (block {})", fsm.block.sequence);
                if fsm.source_exhausted()? {
                    fsm.send(&[EOT])?;
                    debug!("Sent: EOT");
                    return Ok(fsm.next::<AwaitEotAck>());
                }
                let sequence = fsm.block.sequence.wrapping_add(1);
                fsm.load_block(sequence)?;
                fsm.first_block = false;
                Ok(fsm.next::<TransmitBlock>())
            }
            CRC_REQUEST => {
                if fsm.first_block {
                    fsm.mode = Mode::Crc;
                    debug!("Received: 'C', using crc-16 mode");
                } else {
                    debug!("Received: 'C'");
                }
                Ok(fsm.next::<TransmitBlock>())
            }
            NAK => {
                debug!("Received: NAK (block {})", fsm.block.sequence);
                Ok(fsm.next::<TransmitBlock>())
            }
            CAN => {
                debug!("Received: CAN");
                Ok(fsm.next::<AwaitResponse>())
            }
            other => {
                debug!("Ignoring 0x{:02X} while waiting for ACK/NAK", other);
                Ok(fsm.next::<AwaitResponse>())
            }
        }
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, TransmitBlock> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError> {
        let mut fsm = *self;
        let frame = fsm.block.encode(fsm.mode);

        if fsm.config.byte_delay.is_zero() {
            fsm.send(&frame)?;
        } else {
            // Pace the line for receivers that cannot keep up
            for &byte in &frame {
                fsm.send(&[byte])?;
                std::thread::sleep(fsm.config.byte_delay);
            }
        }
        fsm.transmitted = true;
        debug!("Sent: block {} ({})", fsm.block.sequence, fsm.mode);

        Ok(fsm.next::<AwaitResponse>())
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, AwaitEotAck> {
    fn step(self: Box<Self>) -> Result<Step<'a>, TransferError> {
        let mut fsm = *self;

        let byte = match fsm.await_byte() {
            Ok(Some(byte)) => byte,
            Ok(None) => {
                info!("Timed out waiting for ACK of EOT, assuming delivered");
                return Ok(Step::Done);
            }
            Err(TransferError::UnexpectedEndOfChannel) => {
                info!("Channel closed after EOT, assuming delivered");
                return Ok(Step::Done);
            }
            Err(e) => return Err(e),
        };

        if fsm.cancelled(byte) {
            warn!("Received: CAN CAN after EOT");
            return Err(TransferError::Cancelled);
        }

        match byte {
            ACK => {
                debug!("Received: ACK of EOT");
                info!("Send complete");
                Ok(Step::Done)
            }
            NAK => match fsm.send(&[EOT]) {
                Ok(()) => {
                    debug!("Received: NAK, resent EOT");
                    Ok(fsm.next::<AwaitEotAck>())
                }
                Err(TransferError::UnexpectedEndOfChannel) => {
                    info!("Channel closed after EOT, assuming delivered");
                    Ok(Step::Done)
                }
                Err(e) => Err(e),
            },
            other => {
                debug!("Ignoring 0x{:02X} while waiting for ACK of EOT", other);
                Ok(fsm.next::<AwaitEotAck>())
            }
        }
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl<'a> SenderFsm<'a, LoadFirstBlock> {
    pub fn new(
        channel: &'a mut dyn Channel,
        source: &'a mut dyn BufRead,
        config: &'a Config,
    ) -> Box<dyn SenderState<'a> + 'a> {
        Box::new(SenderFsm {
            state: PhantomData::<LoadFirstBlock>,
            channel,
            source,
            config,
            // Switched to CRC only if the receiver asks for it
            mode: Mode::Checksum,
            block: Block::new(1, [FILLER; BLOCK_SIZE]),
            transmitted: false,
            first_block: true,
            cancel_seen: false,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
