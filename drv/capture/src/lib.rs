//! Strobe-clocked DMA capture rings.
//!
//! Two 1024-entry rings back every host read: one for the low 16 address
//! bits, one for either the high address bits or the data bus (capture
//! mode is a board-level choice, not this crate's). A timer channel slaved
//! to the host's output-enable line clocks one DMA transfer per host
//! strobe; the DMA controller is the sole producer and never stops, so the
//! "write pointer" is derived arithmetically from its remaining-transfer
//! count rather than tracked separately.
#![cfg_attr(not(test), no_std)]

use ringbuf::{ringbuf, ringbuf_entry};

/// Ring capacity, in 16-bit words. Matches the DMA channel's circular
/// buffer length.
pub const RING_LEN: usize = 1024;

/// Resynchronization threshold: once the framer has fallen behind the DMA
/// producer by this many full wraps, capture is throttled until the main
/// loop catches it up.
const MAX_WRAP_LAG: u32 = 10;

/// Source of the DMA channel's remaining-transfer count (its `NDTR`
/// register, abstracted for testability). The producer index is always
/// `RING_LEN - remaining()`.
pub trait DmaRemaining {
    fn remaining(&self) -> u16;
}

#[derive(Copy, Clone, Debug)]
enum Trace {
    Resynced(u32),
    Throttled(u32),
    Resumed,
}

ringbuf!(Trace, 16, Trace::Resumed);

/// One capture ring and the framer-owned consumer state over it.
///
/// The backing array is written exclusively by DMA; this struct never
/// writes into it; it only computes indices into storage the caller hands
/// in on every call (so the same struct works against a real `'static`
/// DMA target buffer or a host-test fake).
pub struct CaptureRing {
    consumer: usize,
    /// Wrap count as of the last time the producer index was observed to
    /// be behind the consumer (i.e. the ring wrapped underneath us).
    wraps_seen: u32,
    /// Wrap count as of the last time the main loop checked in and
    /// resynchronized this count with the actual producer state.
    wraps_acked: u32,
    throttled: bool,
}

impl CaptureRing {
    pub const fn new() -> Self {
        CaptureRing {
            consumer: 0,
            wraps_seen: 0,
            wraps_acked: 0,
            throttled: true,
        }
    }

    pub fn throttled(&self) -> bool {
        self.throttled
    }

    /// Producer index: the next ring slot the DMA will write.
    fn producer_index(remaining: u16) -> usize {
        RING_LEN - remaining as usize
    }

    /// Returns the next captured word, advancing the consumer, or `None`
    /// if the consumer has caught up with the producer. Called once per
    /// drained word from the framer ISR; `backing` is the ring's live
    /// memory and `dma` its remaining-count source.
    pub fn next_word<D: DmaRemaining>(&mut self, backing: &[u16; RING_LEN], dma: &D) -> Option<u16> {
        if self.throttled {
            return None;
        }
        let producer = Self::producer_index(dma.remaining());
        if producer == self.consumer {
            return None;
        }
        let word = backing[self.consumer];
        let next = (self.consumer + 1) % RING_LEN;
        if next == 0 {
            self.wraps_seen += 1;
            if self.wraps_seen.wrapping_sub(self.wraps_acked) > MAX_WRAP_LAG {
                self.throttled = true;
                ringbuf_entry!(Trace, Trace::Throttled(self.wraps_seen));
            }
        }
        self.consumer = next;
        Some(word)
    }

    /// Called from the main polling loop once it has drained whatever
    /// backlog caused a throttle; re-enables capture and resynchronizes
    /// the wrap accounting.
    pub fn resume(&mut self) {
        self.wraps_acked = self.wraps_seen;
        if self.throttled {
            self.throttled = false;
            ringbuf_entry!(Trace, Trace::Resumed);
        }
    }

    /// Forces the consumer to the producer's current position, discarding
    /// whatever lies between. Used when the framer detects it has lost
    /// sync badly enough that catching up word-by-word isn't worth it;
    /// the framer itself resynchronizes on the next magic sequence.
    pub fn resync<D: DmaRemaining>(&mut self, dma: &D) {
        self.consumer = Self::producer_index(dma.remaining());
        self.wraps_seen = self.wraps_seen.wrapping_add(1);
        ringbuf_entry!(Trace, Trace::Resynced(self.wraps_seen));
    }

    /// Enables draining (used at init, once the timer/DMA pair is armed).
    pub fn arm(&mut self) {
        self.throttled = false;
    }
}

impl Default for CaptureRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDma {
        remaining: core::cell::Cell<u16>,
    }

    impl DmaRemaining for FakeDma {
        fn remaining(&self) -> u16 {
            self.remaining.get()
        }
    }

    #[test]
    fn drains_words_up_to_producer() {
        let mut backing = [0u16; RING_LEN];
        backing[0] = 0xAAAA;
        backing[1] = 0xBBBB;
        let dma = FakeDma { remaining: core::cell::Cell::new((RING_LEN - 2) as u16) };
        let mut ring = CaptureRing::new();
        ring.arm();

        assert_eq!(ring.next_word(&backing, &dma), Some(0xAAAA));
        assert_eq!(ring.next_word(&backing, &dma), Some(0xBBBB));
        assert_eq!(ring.next_word(&backing, &dma), None);
    }

    #[test]
    fn throttles_after_ten_unacked_wraps() {
        let backing = [0u16; RING_LEN];
        let mut ring = CaptureRing::new();
        ring.arm();

        for wrap in 0..11u32 {
            let dma = FakeDma { remaining: core::cell::Cell::new(0) };
            // Drain exactly one ring's worth to force a wrap each time.
            for _ in 0..RING_LEN {
                ring.next_word(&backing, &dma);
                if ring.throttled() {
                    break;
                }
            }
            if wrap < 10 {
                assert!(!ring.throttled(), "should not throttle before 10 unacked wraps");
            }
        }
        assert!(ring.throttled());
    }

    #[test]
    fn resume_clears_throttle_and_acks_wraps() {
        let backing = [0u16; RING_LEN];
        let dma = FakeDma { remaining: core::cell::Cell::new(0) };
        let mut ring = CaptureRing::new();
        ring.arm();
        for _ in 0..(RING_LEN * 11) {
            ring.next_word(&backing, &dma);
        }
        assert!(ring.throttled());
        ring.resume();
        assert!(!ring.throttled());
    }
}
