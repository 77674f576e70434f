//! Thin wrappers exposing DMA1 channel `NDTR` as the `remaining()` counts
//! [`drv_capture::DmaRemaining`] and [`drv_reply::ReplyDma`] need, and the
//! channel reprogramming the reply engine does when it flips a channel from
//! peripheral-to-memory (capture) to memory-to-peripheral (reply).
use drv_capture::DmaRemaining;
use drv_reply::ReplyDma;
use stm32f1::stm32f103::dma1::CH;

/// One DMA1 channel, already configured by [`crate::system`] for its normal
/// (capture) direction; the reply engine reprograms it in place for the
/// duration of one reply and restores it afterward.
pub struct CaptureChannel {
    ch: &'static CH,
}

impl CaptureChannel {
    /// # Safety
    /// `ch` must name a channel owned exclusively by the capture ring this
    /// wraps; no other code may touch its registers concurrently.
    pub unsafe fn new(ch: &'static CH) -> Self {
        CaptureChannel { ch }
    }

    fn set_enabled(&self, enabled: bool) {
        self.ch.cr.modify(|_, w| w.en().bit(enabled));
    }

    /// Reprograms this channel for one memory-to-peripheral burst of
    /// `words`, starting it immediately. Used by the reply engine; the
    /// caller is responsible for restoring the channel's normal capture
    /// configuration afterward.
    pub fn arm_reply(&self, words: &[u16], peripheral_address: u32) {
        self.set_enabled(false);
        self.ch.cpar.write(|w| unsafe { w.bits(peripheral_address) });
        self.ch.cmar.write(|w| unsafe { w.bits(words.as_ptr() as u32) });
        self.ch.cndtr.write(|w| unsafe { w.bits(words.len() as u32) });
        self.ch.cr.modify(|_, w| {
            w.dir().set_bit() // memory-to-peripheral
                .minc().set_bit()
                .pinc().clear_bit()
                .circ().clear_bit()
                .msize().bits16()
                .psize().bits16()
        });
        self.set_enabled(true);
    }

    /// Restores circular peripheral-to-memory capture mode into `backing`,
    /// re-arming continuous address/data capture.
    pub fn restore_capture(&self, backing: &[u16], peripheral_address: u32) {
        self.set_enabled(false);
        self.ch.cpar.write(|w| unsafe { w.bits(peripheral_address) });
        self.ch.cmar.write(|w| unsafe { w.bits(backing.as_ptr() as u32) });
        self.ch.cndtr.write(|w| unsafe { w.bits(backing.len() as u32) });
        self.ch.cr.modify(|_, w| {
            w.dir().clear_bit() // peripheral-to-memory
                .minc().set_bit()
                .pinc().clear_bit()
                .circ().set_bit()
                .msize().bits16()
                .psize().bits16()
        });
        self.set_enabled(true);
    }
}

impl DmaRemaining for CaptureChannel {
    fn remaining(&self) -> u16 {
        self.ch.cndtr.read().ndt().bits()
    }
}

impl ReplyDma for CaptureChannel {
    fn arm(&mut self, words: &[u16]) {
        let peripheral_address = self.ch.cpar.read().bits();
        self.arm_reply(words, peripheral_address);
    }

    fn remaining(&self) -> u16 {
        self.ch.cndtr.read().ndt().bits()
    }
}
