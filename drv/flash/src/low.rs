//! Single-word flash bus primitives: address/data drive, unlock-sequence
//! command issue, and the datasheet-exact read/write timing.
//!
//! Every operation here is a single bus transaction. [`crate::high`] builds
//! programming, erase, and identification on top of these.

use drv_gpio::{Gpio, OutputType, PinSet, Pull, Speed};
use drv_timing::Clock;
use ringbuf::{ringbuf, ringbuf_entry};

/// Minimum output-enable-to-data-valid time, per datasheet.
const T_OE_NS: u32 = 20;
/// Minimum output-disable-to-next-enable float time.
const T_DF_NS: u32 = 15;
/// Minimum write-enable pulse width.
const T_WP_NS: u32 = 30;

/// Flash bus width / die-selection mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashMode {
    /// Both dies driven as one 32-bit word.
    Bits32,
    /// Only the low (bits 0-15) die is addressed; high die's DQ lines float.
    Bits16Low,
    /// Only the high (bits 16-31) die is addressed.
    Bits16High,
    /// Probe both dies and settle on whichever responds; resolves to one of
    /// the above before any transaction completes.
    Auto,
    /// Byte-order-swapped 32-bit mode.
    ///
    /// Treated as a plain alias of [`FlashMode::Bits32`]: nothing in this
    /// driver reorders bytes within a word differently for this variant.
    Swap32,
}

impl FlashMode {
    /// The bitmask ANDed into command/data words so they reach only the
    /// active die (or both, in 32-bit modes).
    pub fn word_mask(self) -> u32 {
        match self {
            FlashMode::Bits32 | FlashMode::Swap32 | FlashMode::Auto => 0xFFFF_FFFF,
            FlashMode::Bits16Low => 0x0000_FFFF,
            FlashMode::Bits16High => 0xFFFF_0000,
        }
    }

    /// True if only the high die is live, so low-die-targeted opcodes need
    /// shifting into the upper half before they're issued.
    pub fn is_high_only(self) -> bool {
        matches!(self, FlashMode::Bits16High)
    }
}

/// What to do with the three address-override bits (A17-A19).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OverrideOp {
    /// Drive `value` on the lines named by `which`, remembering the
    /// previous state so it can be [`OverrideOp::Restore`]d.
    Record,
    /// Release the named lines back to host-driven (float the
    /// microcontroller's drivers), without forgetting the prior value.
    Disable,
    /// Re-drive whatever was last recorded.
    Restore,
}

/// A snapshot of the address-line override state, for save/restore across a
/// temporary disable (e.g. while the microcontroller itself drives the
/// address bus during a reply).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OverrideState {
    /// Bitmask of {A17,A18,A19} currently overridden (bit0=A17 .. bit2=A19).
    pub which: u8,
    /// Values driven on the overridden lines, same bit positions.
    pub value: u8,
    enabled: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashError {
    Timeout,
    VerifyFailed,
    StatusFailure,
    BadAddress,
}

#[derive(Copy, Clone, Debug)]
enum Trace {
    Cmd(u32, u32),
    Override(u8, u8),
    WriteTimeout(u32),
}

ringbuf!(Trace, 32, Trace::Cmd(0, 0));

/// Pin group wired to the flash part. Address lines beyond A16 are driven
/// through the override mechanism rather than this struct, since they're
/// shared with the host's own address bus.
pub struct FlashPins {
    pub address_lo: PinSet,
    pub address_hi: PinSet,
    /// Low die's 16 data lines (bits 0-15 of the 32-bit bus).
    pub data: PinSet,
    /// High die's 16 data lines (bits 16-31), a genuinely separate port --
    /// the two dies are independent parallel flash parts, not one 32-bit
    /// part, and Bits16Low/Bits16High modes address only one of them.
    pub data_hi: PinSet,
    pub output_enable: PinSet,
    pub write_enable: PinSet,
    pub chip_enable: PinSet,
    pub override_lines: PinSet,
}

/// Owns the flash GPIO wiring and the current bus mode. One instance per
/// board; there is exactly one parallel flash part pair.
pub struct FlashBus {
    gpio: Gpio,
    clock: Clock,
    pins: FlashPins,
    mode: FlashMode,
    data_driven: bool,
    overrides: OverrideState,
}

impl FlashBus {
    pub fn new(gpio: Gpio, clock: Clock, pins: FlashPins) -> Self {
        let bus = FlashBus {
            gpio,
            clock,
            pins,
            mode: FlashMode::Bits32,
            data_driven: false,
            overrides: OverrideState::default(),
        };
        bus.gpio.configure_output(
            bus.pins.address_lo,
            OutputType::PushPull,
            Speed::High50MHz,
        ).ok();
        bus.gpio.configure_output(
            bus.pins.address_hi,
            OutputType::PushPull,
            Speed::High50MHz,
        ).ok();
        bus.gpio.configure_output(
            bus.pins.output_enable,
            OutputType::PushPull,
            Speed::High50MHz,
        ).ok();
        bus.gpio.configure_output(
            bus.pins.write_enable,
            OutputType::PushPull,
            Speed::High50MHz,
        ).ok();
        bus.gpio.configure_output(
            bus.pins.chip_enable,
            OutputType::PushPull,
            Speed::High50MHz,
        ).ok();
        bus.gpio.set(bus.pins.output_enable);
        bus.gpio.set(bus.pins.write_enable);
        bus.gpio.reset(bus.pins.chip_enable);
        bus.gpio.configure_input(bus.pins.data, Pull::Floating).ok();
        bus.gpio.configure_input(bus.pins.data_hi, Pull::Floating).ok();
        bus
    }

    pub fn set_mode(&mut self, mode: FlashMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> FlashMode {
        self.mode
    }

    /// Microseconds since boot, for callers timing a status poll.
    pub fn uptime_us(&self) -> u64 {
        drv_timing::uptime_us(&self.clock)
    }

    /// Claims the data pins as outputs for this driver's own transactions
    /// (as opposed to the reply engine driving them directly).
    pub fn enable(&mut self) {
        if !self.data_driven {
            self.gpio
                .configure_output(self.pins.data, OutputType::PushPull, Speed::High50MHz)
                .ok();
            self.gpio
                .configure_output(self.pins.data_hi, OutputType::PushPull, Speed::High50MHz)
                .ok();
            self.data_driven = true;
        }
    }

    /// Releases the data pins back to inputs, letting normal ROM reads pass
    /// through undisturbed.
    pub fn disable(&mut self) {
        if self.data_driven {
            self.gpio.configure_input(self.pins.data, Pull::Floating).ok();
            self.gpio.configure_input(self.pins.data_hi, Pull::Floating).ok();
            self.data_driven = false;
        }
    }

    fn drive_address(&self, addr: u32) {
        self.gpio.write_port(self.pins.address_lo.port, (addr & 0xFFFF) as u16);
        self.gpio.write_port(self.pins.address_hi.port, ((addr >> 16) & 0xFFFF) as u16);
    }

    /// Reads one word at `addr`, honoring the active mode's width. In a
    /// single-die mode the result is normalized back down to the
    /// conventional low-aligned position (mask first, to isolate the
    /// active die's bits in their physical lane, then shift), so status
    /// and verify comparisons against low-aligned constants work
    /// regardless of which die is actually live.
    pub fn read_word(&mut self, addr: u32) -> u32 {
        critical_section::with(|_cs| {
            self.drive_address(addr);
            self.gpio.reset(self.pins.output_enable);
            self.clock.busy_wait_ns(T_OE_NS);
            let lo = self.gpio.read_port(self.pins.data.port) as u32;
            let hi = self.gpio.read_port(self.pins.data_hi.port) as u32;
            let word = (lo | (hi << 16)) & self.mode.word_mask();
            self.gpio.set(self.pins.output_enable);
            self.clock.busy_wait_ns(T_DF_NS);
            if self.mode.is_high_only() {
                word >> 16
            } else {
                word
            }
        })
    }

    /// Writes one word at `addr` with data driven across the write-enable
    /// pulse. Caller must have called [`FlashBus::enable`] first. In a
    /// high-only mode, a low-aligned opcode/value is shifted up so it
    /// lands on the high die's lane before the mode mask and the split
    /// across the two physical ports.
    pub fn write_word(&mut self, addr: u32, value: u32) {
        let value = if self.mode.is_high_only() { value << 16 } else { value };
        let value = value & self.mode.word_mask();
        let lo = value as u16;
        let hi = (value >> 16) as u16;
        critical_section::with(|_cs| {
            self.drive_address(addr);
            self.gpio.set(self.pins.output_enable);
            self.gpio.write_port(self.pins.data.port, lo);
            self.gpio.write_port(self.pins.data_hi.port, hi);
            self.gpio.reset(self.pins.write_enable);
            self.clock.busy_wait_ns(T_WP_NS);
            self.gpio.set(self.pins.write_enable);
        });
    }

    /// Issues a single command cycle: write `value` at `addr` with no
    /// unlock preamble. Used directly for identify/reset/erase-suspend, and
    /// as the building block for [`FlashBus::unlock_cmd`].
    pub fn cmd(&mut self, addr: u32, value: u32) {
        ringbuf_entry!(Trace, Trace::Cmd(addr, value));
        self.write_word(addr, value);
    }

    /// Issues the three-cycle unlock sequence (AAh@555, 55h@2AA, opcode@addr)
    /// required by most flash commands.
    pub fn unlock_cmd(&mut self, addr: u32, opcode: u32) {
        self.cmd(0x555, 0xAA);
        self.cmd(0x2AA, 0x55);
        self.cmd(addr, opcode);
    }

    /// Bulk read starting at `addr` into `buf`, one word per entry.
    pub fn read(&mut self, addr: u32, buf: &mut [u32]) {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.read_word(addr + i as u32);
        }
    }

    /// Bulk write starting at `addr` from `data`, one word per entry. Does
    /// not poll for completion; callers needing verified programming should
    /// use [`crate::high::program`].
    pub fn write(&mut self, addr: u32, data: &[u32]) {
        self.enable();
        for (i, word) in data.iter().enumerate() {
            self.write_word(addr + i as u32, *word);
        }
        self.disable();
    }

    /// Reads the two identify words (manufacturer, device) after issuing
    /// the identify unlock sequence, then returns the part to read-array
    /// mode.
    pub fn id(&mut self) -> (u32, u32) {
        self.enable();
        self.unlock_cmd(0x555, 0x90);
        let part1 = self.read_word(0x00);
        let part2 = self.read_word(0x01);
        self.unlock_cmd(0x555, 0xF0);
        self.disable();
        (part1, part2)
    }

    /// Records, disables, or restores a drive state on the A17-A19
    /// override lines. Returns the override state as it stood *before* this
    /// call, so callers can restore it later regardless of `op`.
    pub fn address_override(&mut self, which: u8, value: u8, op: OverrideOp) -> OverrideState {
        let prev = self.overrides;
        ringbuf_entry!(Trace, Trace::Override(which, value));
        match op {
            OverrideOp::Record => {
                self.gpio.configure_output(
                    self.pins.override_lines,
                    OutputType::PushPull,
                    Speed::Medium10MHz,
                ).ok();
                self.drive_override_bits(which, value);
                self.overrides = OverrideState { which, value, enabled: true };
            }
            OverrideOp::Disable => {
                self.gpio.configure_input(self.pins.override_lines, Pull::Floating).ok();
                self.overrides.enabled = false;
            }
            OverrideOp::Restore => {
                if prev.enabled {
                    self.gpio.configure_output(
                        self.pins.override_lines,
                        OutputType::PushPull,
                        Speed::Medium10MHz,
                    ).ok();
                    self.drive_override_bits(prev.which, prev.value);
                }
                self.overrides = prev;
            }
        }
        prev
    }

    /// Drives the lines named by `which` (bit0=A17..bit2=A19) to `value`'s
    /// corresponding bits, leaving the rest of the override port's pins
    /// untouched.
    fn drive_override_bits(&self, which: u8, value: u8) {
        let set_mask = (which as u16) & (value as u16);
        let clear_mask = (which as u16) & !(value as u16);
        if set_mask != 0 {
            self.gpio.set(PinSet { pin_mask: set_mask, ..self.pins.override_lines });
        }
        if clear_mask != 0 {
            self.gpio.reset(PinSet { pin_mask: clear_mask, ..self.pins.override_lines });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_masks() {
        assert_eq!(FlashMode::Bits32.word_mask(), 0xFFFF_FFFF);
        assert_eq!(FlashMode::Bits16Low.word_mask(), 0x0000_FFFF);
        assert_eq!(FlashMode::Bits16High.word_mask(), 0xFFFF_0000);
        assert_eq!(FlashMode::Swap32.word_mask(), FlashMode::Bits32.word_mask());
    }

    #[test]
    fn high_only_flag() {
        assert!(FlashMode::Bits16High.is_high_only());
        assert!(!FlashMode::Bits32.is_high_only());
    }

    #[test]
    fn override_state_default_disabled() {
        let s = OverrideState::default();
        assert!(!s.enabled);
        assert_eq!(s.which, 0);
    }
}
