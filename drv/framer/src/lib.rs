//! In-band command framer: a state machine consuming one address-ring
//! word at a time, recognizing the magic/length/opcode/payload/CRC frame
//! described on the wire.
//!
//! Runs inside the capture-compare ISR, so no allocation and no waiting:
//! every call either advances the state or, on MAGIC3/CRC-LO, emits a
//! [`FrameEvent`] for the foreground command table to act on.
#![cfg_attr(not(test), no_std)]

use heapless::Vec;
use ks_proto::{crc32, crc32_reversed, FRAME_MAGIC, MAX_PAYLOAD};
use ringbuf::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Magic0,
    Magic1,
    Magic2,
    Magic3,
    Len,
    Opcode,
    Data,
    CrcHi,
    CrcLo,
}

/// A fully parsed, CRC-verified frame ready for dispatch.
pub struct ParsedFrame {
    pub opcode: u8,
    pub flags: u8,
    /// The length the sender declared, in bytes. May exceed
    /// [`ks_proto::MAX_PAYLOAD`]; `payload` is truncated to that cap, and
    /// callers must check `declared_len` themselves to reject oversize
    /// frames with `BAD_LENGTH` rather than silently processing a short
    /// one.
    pub declared_len: usize,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameEvent {
    /// A frame whose CRC matched; parked in the framer's `pending` slot,
    /// ready for [`Framer::take_dispatch`].
    Dispatch,
    /// A frame whose trailing CRC did not match. The frame's contents are
    /// dropped; only a CRC-error reply is warranted.
    CrcError,
}

#[derive(Copy, Clone, Debug)]
enum Trace {
    MagicLost,
    CrcMismatch(u32, u32),
    Dispatched(u8, usize),
}

ringbuf!(Trace, 24, Trace::MagicLost);

/// Owns the framer's state machine and the one in-progress frame buffer.
/// There is exactly one of these per capture ring that carries command
/// traffic.
pub struct Framer {
    state: State,
    declared_len: usize,
    words_consumed: usize,
    opcode: u8,
    flags: u8,
    crc_running: u32,
    crc_hi: u16,
    payload: Vec<u8, MAX_PAYLOAD>,
    pending: Option<ParsedFrame>,
}

impl Framer {
    pub const fn new() -> Self {
        Framer {
            state: State::Magic0,
            declared_len: 0,
            words_consumed: 0,
            opcode: 0,
            flags: 0,
            crc_running: 0,
            crc_hi: 0,
            payload: Vec::new(),
            pending: None,
        }
    }

    fn words_needed(declared_len: usize) -> usize {
        (declared_len + 1) / 2
    }

    fn restart(&mut self) {
        self.state = State::Magic0;
    }

    /// Feeds one captured 16-bit word into the state machine. Returns
    /// `Some` exactly when a frame just completed (successfully or not);
    /// on `Dispatch`, the parsed frame is available via
    /// [`Framer::take_dispatch`] until the next call replaces it.
    pub fn feed(&mut self, word: u16) -> Option<FrameEvent> {
        match self.state {
            State::Magic0 => {
                if word == FRAME_MAGIC[0] {
                    self.state = State::Magic1;
                }
                None
            }
            State::Magic1 => {
                self.state = if word == FRAME_MAGIC[1] { State::Magic2 } else { State::Magic0 };
                None
            }
            State::Magic2 => {
                self.state = if word == FRAME_MAGIC[2] { State::Magic3 } else { State::Magic0 };
                None
            }
            State::Magic3 => {
                if word == FRAME_MAGIC[3] {
                    self.declared_len = 0;
                    self.words_consumed = 0;
                    self.crc_running = 0;
                    self.payload.clear();
                    self.state = State::Len;
                } else {
                    self.state = State::Magic0;
                    ringbuf_entry!(Trace, Trace::MagicLost);
                }
                None
            }
            State::Len => {
                self.declared_len = word as usize;
                self.crc_running = crc32_reversed(self.crc_running, &word.to_le_bytes());
                self.state = State::Opcode;
                None
            }
            State::Opcode => {
                self.opcode = (word & 0x00FF) as u8;
                self.flags = ((word >> 8) & 0x00FF) as u8;
                self.crc_running = crc32_reversed(self.crc_running, &word.to_le_bytes());
                self.state = if self.declared_len == 0 { State::CrcHi } else { State::Data };
                None
            }
            State::Data => {
                let bytes = word.to_le_bytes();
                self.crc_running = crc32(self.crc_running, &bytes);
                let consumed_bytes = self.words_consumed * 2;
                let remaining = self.declared_len.saturating_sub(consumed_bytes);
                for &b in bytes.iter().take(remaining.min(2)) {
                    let _ = self.payload.push(b);
                }
                self.words_consumed += 1;
                if self.words_consumed >= Self::words_needed(self.declared_len) {
                    self.state = State::CrcHi;
                }
                None
            }
            State::CrcHi => {
                self.crc_hi = word;
                self.state = State::CrcLo;
                None
            }
            State::CrcLo => {
                let received = ((self.crc_hi as u32) << 16) | word as u32;
                self.restart();
                if received == self.crc_running {
                    ringbuf_entry!(Trace, Trace::Dispatched(self.opcode, self.declared_len));
                    self.pending = Some(ParsedFrame {
                        opcode: self.opcode,
                        flags: self.flags,
                        declared_len: self.declared_len,
                        payload: core::mem::replace(&mut self.payload, Vec::new()),
                    });
                    Some(FrameEvent::Dispatch)
                } else {
                    ringbuf_entry!(Trace, Trace::CrcMismatch(received, self.crc_running));
                    Some(FrameEvent::CrcError)
                }
            }
        }
    }

    /// Takes the most recently completed, CRC-valid frame. Returns `None`
    /// if called when the last event wasn't `Dispatch`, or after it's
    /// already been taken once.
    pub fn take_dispatch(&mut self) -> Option<ParsedFrame> {
        self.pending.take()
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_words(framer: &mut Framer, words: &[u16]) -> Option<FrameEvent> {
        let mut last = None;
        for &w in words {
            last = framer.feed(w);
        }
        last
    }

    fn build_frame(opcode: u8, flags: u8, payload: &[u8]) -> heapless::Vec<u16, 64> {
        let mut words: heapless::Vec<u16, 64> = heapless::Vec::new();
        for &m in &FRAME_MAGIC {
            words.push(m).unwrap();
        }
        words.push(payload.len() as u16).unwrap();
        words.push((opcode as u16) | ((flags as u16) << 8)).unwrap();

        let mut crc_running = 0u32;
        crc_running = crc32_reversed(crc_running, &(payload.len() as u16).to_le_bytes());
        crc_running = crc32_reversed(
            crc_running,
            &((opcode as u16) | ((flags as u16) << 8)).to_le_bytes(),
        );

        for chunk in payload.chunks(2) {
            let word = if chunk.len() == 2 {
                u16::from_le_bytes([chunk[0], chunk[1]])
            } else {
                chunk[0] as u16
            };
            words.push(word).unwrap();
            // The framer's CRC covers the full word (including the
            // zero-padding byte of an odd-length payload's last word), so
            // match that here rather than trimming to the declared length.
            crc_running = crc32(crc_running, &word.to_le_bytes());
        }

        words.push((crc_running >> 16) as u16).unwrap();
        words.push((crc_running & 0xFFFF) as u16).unwrap();
        words
    }

    #[test]
    fn parses_zero_length_frame() {
        let words = build_frame(0x01, 0x00, &[]);
        let mut framer = Framer::new();
        let event = feed_words(&mut framer, &words);
        assert_eq!(event, Some(FrameEvent::Dispatch));
        let frame = framer.take_dispatch().unwrap();
        assert_eq!(frame.opcode, 0x01);
        assert_eq!(frame.declared_len, 0);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn parses_odd_length_payload() {
        let payload = [0xDE, 0xAD, 0x01];
        let words = build_frame(0x07, 0x00, &payload);
        let mut framer = Framer::new();
        let event = feed_words(&mut framer, &words);
        assert_eq!(event, Some(FrameEvent::Dispatch));
        let frame = framer.take_dispatch().unwrap();
        assert_eq!(&frame.payload[..], &payload);
    }

    #[test]
    fn corrupted_crc_is_reported_and_resets() {
        let mut words = build_frame(0x02, 0x00, &[1, 2, 3, 4]);
        let last = words.len() - 1;
        words[last] ^= 0xFFFF;
        let mut framer = Framer::new();
        let event = feed_words(&mut framer, &words);
        assert_eq!(event, Some(FrameEvent::CrcError));
        assert!(framer.take_dispatch().is_none());
    }

    #[test]
    fn resyncs_after_false_start() {
        let mut framer = Framer::new();
        // Feed a near-miss magic sequence, then a genuine frame.
        framer.feed(FRAME_MAGIC[0]);
        framer.feed(FRAME_MAGIC[1]);
        framer.feed(0xDEAD); // breaks at MAGIC2
        let words = build_frame(0x04, 0x00, &[0xAA]);
        let event = feed_words(&mut framer, &words);
        assert_eq!(event, Some(FrameEvent::Dispatch));
    }

    #[test]
    fn declared_len_beyond_mtu_is_reported_for_caller_to_reject() {
        let big_len = MAX_PAYLOAD + 16;
        let mut framer = Framer::new();
        for &m in &FRAME_MAGIC {
            framer.feed(m);
        }
        framer.feed(big_len as u16);
        // We don't drive the remaining (many) data words in this test;
        // just check the declared length is recorded verbatim for a
        // caller-side BAD_LENGTH check once dispatch eventually happens.
        assert_eq!(framer.declared_len, big_len);
    }
}
