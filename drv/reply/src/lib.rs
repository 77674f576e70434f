//! Reply engine: usurps the host's data bus to clock a microcontroller-
//! sourced reply out in place of flash contents.
//!
//! Building the word stream (framing, CRC) is pure and unit-tested here;
//! driving it onto the bus is a hardware sequence (redirect the data
//! drivers, optionally reroute the host's strobe, arm the DMA channels,
//! poll for completion) that this crate also owns but can't exercise
//! without real silicon.
#![cfg_attr(not(test), no_std)]

use drv_flash::FlashMode;
use heapless::Vec;
use ks_proto::{crc32, ReplyFlags, Status, FRAME_MAGIC, MAX_PAYLOAD};
use ringbuf::{ringbuf, ringbuf_entry};

/// Largest word stream this engine will ever stage: magic + length +
/// status + MTU payload + CRC, rounded up to whole words.
const MAX_REPLY_WORDS: usize = 4 + 1 + 1 + (MAX_PAYLOAD / 2) + 2;

/// Largest a single die's half of that stream can be: in 32-bit mode the
/// words deinterleave one-for-one onto the low and high die channels, so
/// neither half exceeds half the full stream (rounded up for an odd word
/// count); in a 16-bit mode the whole stream lands on one die's channel.
const MAX_DIE_WORDS: usize = MAX_REPLY_WORDS;

/// DMA poll iterations before the engine gives up on a reply and
/// abandons it rather than hanging the ISR forever.
pub const SAFETY_CAP_ITERATIONS: u32 = 100_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplyError {
    PayloadTooLarge,
    DmaTimeout,
}

/// Builds the word stream for a reply. `raw` replies are simply the
/// concatenation of `chunks`, unframed; framed replies get
/// magic/length/status/payload/CRC, with the CRC computed the same way
/// the framer computes the request's (length and status fed byte-
/// reversed, payload fed in natural order).
pub fn build_reply(
    raw: bool,
    status: Status,
    chunks: &[&[u8]],
) -> Result<Vec<u16, MAX_REPLY_WORDS>, ReplyError> {
    let mut words: Vec<u16, MAX_REPLY_WORDS> = Vec::new();
    let total_len: usize = chunks.iter().map(|c| c.len()).sum();

    if raw {
        push_bytes_as_words(&mut words, chunks)?;
        return Ok(words);
    }

    if total_len > MAX_PAYLOAD {
        return Err(ReplyError::PayloadTooLarge);
    }

    for &m in &FRAME_MAGIC {
        words.push(m).map_err(|_| ReplyError::PayloadTooLarge)?;
    }
    let len_word = total_len as u16;
    words.push(len_word).map_err(|_| ReplyError::PayloadTooLarge)?;
    let status_word = status as u16;
    words.push(status_word).map_err(|_| ReplyError::PayloadTooLarge)?;

    let mut crc = 0u32;
    crc = ks_proto::crc32_reversed(crc, &len_word.to_le_bytes());
    crc = ks_proto::crc32_reversed(crc, &status_word.to_le_bytes());

    let words_before_payload = words.len();
    push_bytes_as_words(&mut words, chunks)?;
    for word in &words[words_before_payload..] {
        crc = crc32(crc, &word.to_le_bytes());
    }

    words.push((crc >> 16) as u16).map_err(|_| ReplyError::PayloadTooLarge)?;
    words.push((crc & 0xFFFF) as u16).map_err(|_| ReplyError::PayloadTooLarge)?;
    Ok(words)
}

fn push_bytes_as_words(
    words: &mut Vec<u16, MAX_REPLY_WORDS>,
    chunks: &[&[u8]],
) -> Result<(), ReplyError> {
    let mut carry: Option<u8> = None;
    for chunk in chunks {
        let mut iter = chunk.iter().copied();
        if let Some(lo) = carry.take() {
            let hi = iter.next();
            let word = match hi {
                Some(hi) => u16::from_le_bytes([lo, hi]),
                None => lo as u16,
            };
            words.push(word).map_err(|_| ReplyError::PayloadTooLarge)?;
        }
        loop {
            match (iter.next(), iter.next()) {
                (Some(lo), Some(hi)) => {
                    words.push(u16::from_le_bytes([lo, hi])).map_err(|_| ReplyError::PayloadTooLarge)?;
                }
                (Some(lo), None) => {
                    carry = Some(lo);
                    break;
                }
                _ => break,
            }
        }
    }
    if let Some(lo) = carry {
        words.push(lo as u16).map_err(|_| ReplyError::PayloadTooLarge)?;
    }
    Ok(())
}

/// Source of a reply DMA channel's remaining-transfer count, mirroring
/// [`drv_capture::DmaRemaining`] but for the memory-to-GPIO direction this
/// engine reprograms the channel into.
pub trait ReplyDma {
    /// Arms the channel to clock `words` out, one per host strobe.
    fn arm(&mut self, words: &[u16]);
    fn remaining(&self) -> u16;
}

#[derive(Copy, Clone, Debug)]
enum Trace {
    Sent(u8, usize),
    SafetyCapTripped,
}

ringbuf!(Trace, 16, Trace::SafetyCapTripped);

/// Polls `dma` until its remaining count reaches zero or
/// [`SAFETY_CAP_ITERATIONS`] elapses.
pub fn poll_completion<D: ReplyDma>(dma: &D) -> Result<(), ReplyError> {
    for _ in 0..SAFETY_CAP_ITERATIONS {
        if dma.remaining() == 0 {
            return Ok(());
        }
    }
    ringbuf_entry!(Trace, Trace::SafetyCapTripped);
    Err(ReplyError::DmaTimeout)
}

/// Pin group the engine usurps while a reply is in flight.
pub struct ReplyPins {
    pub flash_output_enable: drv_gpio::PinSet,
    pub strobe_reroute_select: drv_gpio::PinSet,
    pub data_direction: drv_gpio::PinSet,
}

/// Drives one reply through to completion on two DMA channels (low and
/// high die halves, mirroring the capture engine's address/data split).
pub struct ReplyEngine {
    gpio: drv_gpio::Gpio,
    pins: ReplyPins,
}

impl ReplyEngine {
    pub fn new(gpio: drv_gpio::Gpio, pins: ReplyPins) -> Self {
        ReplyEngine { gpio, pins }
    }

    /// Executes one reply: usurps the bus, clocks `words` out split across
    /// `low` and `high` according to `mode` (in 32-bit mode the stream
    /// deinterleaves one word per die per strobe; in a 16-bit mode the
    /// whole stream rides whichever die is active), then restores normal
    /// ROM-read routing regardless of outcome.
    pub fn send<D: ReplyDma>(
        &mut self,
        words: &[u16],
        mode: FlashMode,
        flags: ReplyFlags,
        low: &mut D,
        high: &mut D,
    ) -> Result<(), ReplyError> {
        self.gpio.set(self.pins.flash_output_enable); // deassert: flash off the bus
        self.gpio.set(self.pins.data_direction); // microcontroller drives

        if flags.contains(ReplyFlags::WITH_WRITE_ENABLE) {
            self.gpio.set(self.pins.strobe_reroute_select);
        }

        let (lo_words, hi_words) = split_dies(words, mode);
        if !lo_words.is_empty() {
            low.arm(&lo_words);
        }
        if !hi_words.is_empty() {
            high.arm(&hi_words);
        }

        let result = (if lo_words.is_empty() { Ok(()) } else { poll_completion(low) })
            .and_then(|()| if hi_words.is_empty() { Ok(()) } else { poll_completion(high) });

        if flags.contains(ReplyFlags::WITH_WRITE_ENABLE) {
            self.gpio.reset(self.pins.strobe_reroute_select);
        }
        self.gpio.reset(self.pins.data_direction);
        self.gpio.reset(self.pins.flash_output_enable);

        if result.is_ok() {
            ringbuf_entry!(Trace, Trace::Sent(0, words.len()));
        }
        result
    }
}

/// Splits a reply word stream into low-die and high-die DMA streams.
///
/// In [`FlashMode::Bits32`] (and its `Swap32`/`Auto` aliases) the stream
/// deinterleaves word-by-word: even positions clock out over the low die,
/// odd positions over the high die, so one strobe produces one 32-bit word
/// on the host's combined bus. In [`FlashMode::Bits16High`] the whole
/// stream instead rides the high die's channel, since that's the only die
/// physically listening; [`FlashMode::Bits16Low`] puts it all on low.
fn split_dies(
    words: &[u16],
    mode: FlashMode,
) -> (Vec<u16, MAX_DIE_WORDS>, Vec<u16, MAX_DIE_WORDS>) {
    let mut lo: Vec<u16, MAX_DIE_WORDS> = Vec::new();
    let mut hi: Vec<u16, MAX_DIE_WORDS> = Vec::new();

    match mode {
        FlashMode::Bits16High => {
            for &w in words {
                let _ = hi.push(w);
            }
        }
        FlashMode::Bits16Low => {
            for &w in words {
                let _ = lo.push(w);
            }
        }
        FlashMode::Bits32 | FlashMode::Swap32 | FlashMode::Auto => {
            for pair in words.chunks(2) {
                let _ = lo.push(pair[0]);
                if let Some(&h) = pair.get(1) {
                    let _ = hi.push(h);
                }
            }
        }
    }

    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeDma {
        remaining: Cell<u32>,
        armed_len: Cell<usize>,
    }

    impl FakeDma {
        fn new() -> Self {
            FakeDma { remaining: Cell::new(0), armed_len: Cell::new(0) }
        }

        fn finishing_after(calls: u32) -> Self {
            FakeDma { remaining: Cell::new(calls), armed_len: Cell::new(0) }
        }
    }

    impl ReplyDma for FakeDma {
        fn arm(&mut self, words: &[u16]) {
            self.armed_len.set(words.len());
            self.remaining.set(words.len() as u32);
        }

        fn remaining(&self) -> u16 {
            let r = self.remaining.get();
            if r > 0 {
                self.remaining.set(r - 1);
            }
            r.min(u16::MAX as u32) as u16
        }
    }

    #[test]
    fn framed_reply_round_trip_crc() {
        let words = build_reply(false, Status::Ok, &[&[1, 2, 3]]).unwrap();
        // magic(4) + len + status + 2 payload words (3 bytes -> 2 words) + crc(2)
        assert_eq!(words.len(), 4 + 1 + 1 + 2 + 2);
        assert_eq!(words[4], 3); // length
        assert_eq!(words[5], Status::Ok as u16);
    }

    #[test]
    fn raw_reply_is_unframed() {
        let words = build_reply(true, Status::Ok, &[&[0xAA, 0xBB, 0xCC]]).unwrap();
        assert_eq!(words.len(), 2); // 2 bytes + 1 byte -> 2 words
        assert_eq!(words[0], 0xBBAA);
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let big = [0u8; MAX_PAYLOAD + 2];
        assert_eq!(build_reply(false, Status::Ok, &[&big]), Err(ReplyError::PayloadTooLarge));
    }

    #[test]
    fn poll_completion_succeeds_before_cap() {
        let dma = FakeDma::finishing_after(5);
        assert!(poll_completion(&dma).is_ok());
    }

    #[test]
    fn poll_completion_trips_safety_cap() {
        let dma = FakeDma::new();
        dma.remaining.set(SAFETY_CAP_ITERATIONS + 1);
        assert_eq!(poll_completion(&dma), Err(ReplyError::DmaTimeout));
    }

    #[test]
    fn split_dies_deinterleaves_in_32bit_mode() {
        let words = [0x1111, 0x2222, 0x3333, 0x4444, 0x5555];
        let (lo, hi) = split_dies(&words, FlashMode::Bits32);
        assert_eq!(&lo[..], &[0x1111, 0x3333, 0x5555]);
        assert_eq!(&hi[..], &[0x2222, 0x4444]);
    }

    #[test]
    fn split_dies_routes_whole_stream_to_active_die_in_16bit_mode() {
        let words = [0xAAAA, 0xBBBB, 0xCCCC];
        let (lo, hi) = split_dies(&words, FlashMode::Bits16Low);
        assert_eq!(&lo[..], &words[..]);
        assert!(hi.is_empty());

        let (lo, hi) = split_dies(&words, FlashMode::Bits16High);
        assert!(lo.is_empty());
        assert_eq!(&hi[..], &words[..]);
    }

    #[test]
    fn send_arms_both_dma_channels_in_32bit_mode() {
        let mut engine = ReplyEngine::new(
            drv_gpio::Gpio,
            ReplyPins {
                flash_output_enable: drv_gpio::Port::D.pin(0),
                strobe_reroute_select: drv_gpio::Port::D.pin(6),
                data_direction: drv_gpio::Port::D.pin(7),
            },
        );
        let mut low = FakeDma::new();
        let mut high = FakeDma::new();
        let words = [0x1111u16, 0x2222, 0x3333, 0x4444];
        let result = engine.send(&words, FlashMode::Bits32, ReplyFlags::empty(), &mut low, &mut high);
        assert!(result.is_ok());
        assert_eq!(low.armed_len.get(), 2);
        assert_eq!(high.armed_len.get(), 2);
    }

    #[test]
    fn chunk_boundary_byte_carries_into_next_chunk() {
        // first chunk ends on an odd byte; its leftover byte should
        // combine with the next chunk's first byte into one word.
        let words = build_reply(true, Status::Ok, &[&[0x11], &[0x22, 0x33]]).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], 0x2211);
        assert_eq!(words[1], 0x33);
    }
}
