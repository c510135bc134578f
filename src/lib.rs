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

//! XMODEM file transfer over a byte channel.
//!
//! [`send`] and [`receive`] run the two halves of the protocol to completion
//! over any [`Channel`]. The receiver picks the validation mode (8-bit
//! checksum or CRC-16) and the sender follows.

pub mod block;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod sender;

use std::io::{BufRead, Write};

pub use block::Mode;
pub use channel::{Channel, SerialChannel};
pub use config::Config;
pub use error::TransferError;

/// Send everything in `source`, returning once the receiver acknowledged EOT
/// (or went quiet after it).
pub fn send(
    channel: &mut dyn Channel,
    source: &mut dyn BufRead,
    config: &Config,
) -> Result<(), TransferError> {
    let mut state = sender::SenderFsm::new(channel, source, config);

    loop {
        match state.step()? {
            sender::Step::Next(next) => state = next,
            sender::Step::Done => return Ok(()),
        }
    }
}

/// Receive a transfer into `sink`, requesting `config.mode`.
///
/// Trailing filler is trimmed from the final block. On failure the sink
/// keeps whatever blocks were already confirmed.
pub fn receive(
    channel: &mut dyn Channel,
    sink: &mut dyn Write,
    config: &Config,
) -> Result<(), TransferError> {
    let mut state = receiver::ReceiverFsm::new(channel, sink, config);

    loop {
        match state.step()? {
            receiver::Step::Next(next) => state = next,
            receiver::Step::Done => return Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{pipe, Fault, Faulty};
    use crate::protocol::{CRC_REQUEST, EOT, FILLER};
    use proptest::prelude::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn test_config(mode: Mode) -> Config {
        Config {
            timeout: Duration::from_millis(100),
            mode,
            ..Config::default()
        }
    }

    struct Outcome {
        sent: Result<(), TransferError>,
        received: Result<(), TransferError>,
        sink: Vec<u8>,
    }

    /// Run a sender thread against a receiver on this thread.
    fn transfer<A, B>(data: Vec<u8>, mut tx_end: A, mut rx_end: B, config: Config) -> Outcome
    where
        A: Channel + 'static,
        B: Channel + 'static,
    {
        logging::init_for_tests();

        let tx_config = config.clone();
        let sender = std::thread::spawn(move || {
            let mut source = Cursor::new(data);
            send(&mut tx_end, &mut source, &tx_config)
        });

        let mut sink = Vec::new();
        let received = receive(&mut rx_end, &mut sink, &config);
        // Closing our end unblocks a sender still waiting on us
        drop(rx_end);

        let sent = sender.join().expect("sender thread panicked");
        Outcome { sent, received, sink }
    }

    fn counting(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_round_trip_lengths() {
        for mode in [Mode::Checksum, Mode::Crc] {
            for len in [0, 1, 127, 128, 129, 256, 300, 2000] {
                let data = counting(len);
                let (a, b) = pipe();
                let outcome = transfer(data.clone(), a, b, test_config(mode));

                outcome.sent.unwrap_or_else(|e| panic!("send failed ({mode}, {len}): {e}"));
                outcome.received.unwrap_or_else(|e| panic!("receive failed ({mode}, {len}): {e}"));
                assert_eq!(outcome.sink, data, "content mismatch ({mode}, {len} bytes)");
            }
        }
    }

    #[test]
    fn test_sequence_wraps() {
        let mut data = Vec::new();
        for i in 0..512 {
            data.extend(std::iter::repeat((i % 256) as u8).take(128));
        }

        let (a, b) = pipe();
        let outcome = transfer(data.clone(), a, b, test_config(Mode::Crc));

        outcome.sent.expect("send failed");
        outcome.received.expect("receive failed");
        assert_eq!(outcome.sink.len(), data.len());
        assert_eq!(outcome.sink, data);
    }

    #[test]
    fn test_corruption_checksum_mode() {
        let data = counting(2000);
        let (a, b) = pipe();
        let b = Faulty::new(b, Fault::CorruptIn(700));
        let outcome = transfer(data.clone(), a, b, test_config(Mode::Checksum));

        outcome.sent.expect("send failed");
        outcome.received.expect("receive failed");
        assert_eq!(outcome.sink, data);
    }

    #[test]
    fn test_corruption_crc_mode() {
        let data = counting(2000);
        let (a, b) = pipe();
        let b = Faulty::new(b, Fault::CorruptIn(700));
        let outcome = transfer(data.clone(), a, b, test_config(Mode::Crc));

        outcome.sent.expect("send failed");
        outcome.received.expect("receive failed");
        assert_eq!(outcome.sink, data);
    }

    #[test]
    fn test_lost_acks_deliver_each_block_once() {
        // Every third byte the receiver sends is lost, so some ACKs never
        // arrive and the sender repeats blocks that were already accepted
        let data = counting(300);
        let (a, b) = pipe();
        let b = Faulty::new(b, Fault::DropOut(3));
        let outcome = transfer(data.clone(), a, b, test_config(Mode::Checksum));

        outcome.sent.expect("send failed");
        outcome.received.expect("receive failed");
        assert_eq!(outcome.sink, data);
    }

    #[test]
    fn test_crc_fallback_to_checksum() {
        let data = counting(500);
        let (a, b) = pipe();
        let b = Faulty::new(b, Fault::FilterOut(CRC_REQUEST));
        let outcome = transfer(data.clone(), a, b, test_config(Mode::Crc));

        outcome.sent.expect("send failed");
        outcome.received.expect("receive failed");
        assert_eq!(outcome.sink, data);
    }

    #[test]
    fn test_damaged_block_start_is_not_end_of_file() {
        // Inbound byte 133 is the SOH of block 2 in checksum mode. Flipping
        // it must not let the EOT byte inside that payload end the transfer.
        let mut data = vec![b'a'; 384];
        data[128 + 10] = EOT;
        let (a, b) = pipe();
        let b = Faulty::new(b, Fault::FlipAt(133));
        let outcome = transfer(data.clone(), a, b, test_config(Mode::Checksum));

        outcome.sent.expect("send failed");
        outcome.received.expect("receive failed");
        assert_eq!(outcome.sink, data);
    }

    #[test]
    fn test_single_bit_flips_recovered() {
        for mode in [Mode::Checksum, Mode::Crc] {
            for every in [150, 151, 173, 200, 263, 307, 350, 399] {
                let data = counting(2000);
                let (a, b) = pipe();
                let b = Faulty::new(b, Fault::FlipIn(every));
                let outcome = transfer(data.clone(), a, b, test_config(mode));

                outcome.sent.unwrap_or_else(|e| panic!("send failed ({mode}, every {every}): {e}"));
                outcome.received.unwrap_or_else(|e| panic!("receive failed ({mode}, every {every}): {e}"));
                assert_eq!(outcome.sink, data, "content mismatch ({mode}, every {every})");
            }
        }
    }

    #[test]
    fn test_corrupted_sequence_aborts() {
        // Inbound bytes 2 and 3 are the header of block 1; rewrite it into a
        // self-consistent header for block 5
        let (a, b) = pipe();
        let b = Faulty::with_faults(b, vec![Fault::ReplaceAt(2, 5), Fault::ReplaceAt(3, 0xFA)]);
        let outcome = transfer(counting(1000), a, b, test_config(Mode::Checksum));

        match outcome.received {
            Err(TransferError::SyncError { expected, received }) => {
                assert_eq!(expected, 1);
                assert_eq!(received, 5);
            }
            other => panic!("Expected SyncError, got {:?}", other),
        }
        assert!(outcome.sink.is_empty());
        assert!(
            matches!(outcome.sent, Err(TransferError::UnexpectedEndOfChannel)),
            "got {:?}",
            outcome.sent
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn round_trip_preserves_content(
            data in prop::collection::vec(any::<u8>(), 0..700)
                .prop_filter("trailing filler is indistinguishable from padding",
                    |d| d.last() != Some(&FILLER)),
            crc in any::<bool>(),
        ) {
            let mode = if crc { Mode::Crc } else { Mode::Checksum };
            let (a, b) = pipe();
            let outcome = transfer(data.clone(), a, b, test_config(mode));

            prop_assert!(outcome.sent.is_ok());
            prop_assert!(outcome.received.is_ok());
            prop_assert_eq!(outcome.sink, data);
        }
    }
}
