//! Detection of the extended-mode switch inside the passthrough byte stream.
//!
//! While shovelling host bytes to the RS-485 bus the firmware watches for
//! the exact image of an `Init` packet. Partially matched bytes are withheld
//! from the bus; if the match fails they are replayed in order, followed by
//! the byte that broke the match, so legacy ASCII traffic passes unharmed
//! even when it happens to start with `0xFF`.

use heapless::Vec;

use robolink_protocol::{simple_frame, Command, FRAME_OVERHEAD};

pub enum MatchOutcome {
    /// Byte consumed, match still in progress; forward nothing yet.
    Pending,
    /// The full `Init` packet arrived: switch to extended mode.
    Matched,
    /// Match broken: forward these bytes to the bus verbatim.
    Forward(Vec<u8, { FRAME_OVERHEAD + 1 }>),
}

pub struct InitMatcher {
    pattern: [u8; FRAME_OVERHEAD],
    offset: usize,
}

impl InitMatcher {
    pub fn new() -> Self {
        InitMatcher {
            pattern: simple_frame(Command::Init),
            offset: 0,
        }
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn push(&mut self, byte: u8) -> MatchOutcome {
        if byte == self.pattern[self.offset] {
            self.offset += 1;
            if self.offset == self.pattern.len() {
                self.offset = 0;
                return MatchOutcome::Matched;
            }
            return MatchOutcome::Pending;
        }

        // Replay matched bytes, then the mismatching byte itself. The byte
        // could still start a fresh match only if it equals the pattern's
        // first byte; the original firmware ignores that corner and so do we.
        let mut replay: Vec<u8, { FRAME_OVERHEAD + 1 }> = Vec::new();
        let _ = replay.extend_from_slice(&self.pattern[..self.offset]);
        let _ = replay.push(byte);
        self.offset = 0;
        MatchOutcome::Forward(replay)
    }
}

impl Default for InitMatcher {
    fn default() -> Self {
        InitMatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec as StdVec;

    fn run(matcher: &mut InitMatcher, bytes: &[u8]) -> (bool, StdVec<u8>) {
        let mut matched = false;
        let mut forwarded = StdVec::new();
        for &b in bytes {
            match matcher.push(b) {
                MatchOutcome::Pending => {}
                MatchOutcome::Matched => matched = true,
                MatchOutcome::Forward(replay) => forwarded.extend_from_slice(&replay),
            }
        }
        (matched, forwarded)
    }

    #[test]
    fn full_packet_matches_and_forwards_nothing() {
        let mut matcher = InitMatcher::new();
        let (matched, forwarded) = run(&mut matcher, &simple_frame(Command::Init));
        assert!(matched);
        assert!(forwarded.is_empty());
    }

    #[test]
    fn packet_split_across_reads_still_matches() {
        let mut matcher = InitMatcher::new();
        let packet = simple_frame(Command::Init);

        let (matched, forwarded) = run(&mut matcher, &packet[..2]);
        assert!(!matched);
        assert!(forwarded.is_empty());

        let (matched, forwarded) = run(&mut matcher, &packet[2..]);
        assert!(matched);
        assert!(forwarded.is_empty());
    }

    #[test]
    fn ascii_traffic_is_forwarded_verbatim(){
        let mut matcher = InitMatcher::new();
        let (matched, forwarded) = run(&mut matcher, b"#1ZP\r");
        assert!(!matched);
        assert_eq!(forwarded, b"#1ZP\r");
    }

    #[test]
    fn broken_match_replays_prefix() {
        let mut matcher = InitMatcher::new();
        // Starts like an Init packet, then diverges.
        let (matched, forwarded) = run(&mut matcher, &[0xFF, 0x0A, 0x42]);
        assert!(!matched);
        assert_eq!(forwarded, &[0xFF, 0x0A, 0x42]);

        // The matcher recovered and still detects a following real packet.
        let (matched, forwarded) = run(&mut matcher, &simple_frame(Command::Init));
        assert!(matched);
        assert!(forwarded.is_empty());
    }
}
