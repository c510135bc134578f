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

use std::time::Duration;
use crate::block::Mode;

/// Per-transfer tuning, handed to each engine at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bounded wait for a single byte.
    pub timeout: Duration,
    /// The sender waits `timeout * max_timeouts` for a response before giving up.
    pub max_timeouts: u32,
    /// Errors tolerated on one block before the receiver aborts.
    pub max_errors: u32,
    /// CRC requests sent before the receiver falls back to checksum mode.
    pub crc_attempts: u32,
    /// Receiver's preferred validation mode.
    pub mode: Mode,
    /// Delay between payload bytes when sending.
    pub byte_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: Duration::from_secs(5),
            max_timeouts: 5,
            max_errors: 10,
            crc_attempts: 3,
            mode: Mode::Checksum,
            byte_delay: Duration::ZERO,
        }
    }
}

impl Config {
    pub(crate) fn response_timeout(&self) -> Duration {
        self.timeout * self.max_timeouts
    }
}
