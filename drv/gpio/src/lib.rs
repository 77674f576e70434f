//! Typed GPIO pin-bank abstraction over the raw port registers.
//!
//! Every other driver in this firmware -- flash, bank select, bus capture --
//! ultimately bottoms out in a handful of pin writes, so this crate owns the
//! one place that pokes `CRL`/`CRH`/`BSRR` directly. Everything above it
//! talks in terms of [`Port`] and [`PinSet`].
#![no_std]

use vcell::VolatileCell;

/// One GPIO port's register block, in the layout common to this MCU family:
/// two 32-bit mode/config registers (`CRL` for pins 0-7, `CRH` for 8-15), an
/// input data register, an output data register, an atomic set/reset
/// register, a reset-only register, and a pin lock register.
#[repr(C)]
pub struct RegisterBlock {
    pub crl: VolatileCell<u32>,
    pub crh: VolatileCell<u32>,
    pub idr: VolatileCell<u32>,
    pub odr: VolatileCell<u32>,
    pub bsrr: VolatileCell<u32>,
    pub brr: VolatileCell<u32>,
    pub lckr: VolatileCell<u32>,
}

/// Enumeration of the GPIO ports present on this MCU package.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Port {
    A,
    B,
    C,
    D,
    E,
}

impl Port {
    const fn base(self) -> usize {
        match self {
            Port::A => 0x4001_0800,
            Port::B => 0x4001_0C00,
            Port::C => 0x4001_1000,
            Port::D => 0x4001_1400,
            Port::E => 0x4001_1800,
        }
    }

    fn registers(self) -> &'static RegisterBlock {
        unsafe { &*(self.base() as *const RegisterBlock) }
    }

    /// Turns a `Port` into a `PinSet` containing one pin, number `index`
    /// (0-15).
    pub const fn pin(self, index: u8) -> PinSet {
        PinSet {
            port: self,
            pin_mask: 1 << index,
        }
    }
}

/// A set of pins within one port, described by a bitmask so that
/// whole-nibble configuration operations (address override, data bus) can
/// be expressed as a single call.
#[derive(Copy, Clone, Debug)]
pub struct PinSet {
    pub port: Port,
    pub pin_mask: u16,
}

impl PinSet {
    pub const fn and_pin(self, index: u8) -> Self {
        Self {
            pin_mask: self.pin_mask | 1 << index,
            ..self
        }
    }
}

/// Output drive speed, named after the MCU's three output slew-rate grades.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Speed {
    Low2MHz = 0b10,
    Medium10MHz = 0b01,
    High50MHz = 0b11,
}

/// Output stage type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputType {
    PushPull,
    OpenDrain,
}

/// Input pull configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Pull {
    Floating,
    Up,
    Down,
}

/// Pin function mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Input(Pull),
    Output(OutputType, Speed),
    Alternate(OutputType, Speed),
    Analog,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GpioError {
    BadPin,
}

/// A handle to the GPIO hardware. Stateless beyond the register pointers it
/// resolves lazily per port, so it's fine to have several of these alive at
/// once; the actual pin writes are made atomic by `BSRR`/`BRR` or by a
/// critical section around the `CRL`/`CRH` read-modify-write.
#[derive(Copy, Clone, Debug, Default)]
pub struct Gpio;

impl Gpio {
    pub const fn new() -> Self {
        Gpio
    }

    /// Configures every pin named by `pins.pin_mask` on `pins.port` to
    /// `mode`.
    pub fn configure(&self, pins: PinSet, mode: Mode) -> Result<(), GpioError> {
        if pins.pin_mask == 0 {
            return Err(GpioError::BadPin);
        }
        let (mode_bits, cnf_bits) = mode.bits();
        let packed = (mode_bits | (cnf_bits << 2)) as u32;

        critical_section::with(|_cs| {
            let regs = pins.port.registers();
            for index in 0..16u8 {
                if pins.pin_mask & (1 << index) == 0 {
                    continue;
                }
                let reg = if index < 8 { &regs.crl } else { &regs.crh };
                let shift = (index % 8) * 4;
                let mask = 0b1111u32 << shift;
                let cur = reg.get();
                reg.set((cur & !mask) | (packed << shift));
            }
        });
        Ok(())
    }

    pub fn configure_input(&self, pins: PinSet, pull: Pull) -> Result<(), GpioError> {
        self.configure(pins, Mode::Input(pull))
    }

    pub fn configure_output(
        &self,
        pins: PinSet,
        output_type: OutputType,
        speed: Speed,
    ) -> Result<(), GpioError> {
        self.configure(pins, Mode::Output(output_type, speed))
    }

    /// Sets the named pins high.
    pub fn set(&self, pins: PinSet) {
        pins.port.registers().bsrr.set(pins.pin_mask as u32);
    }

    /// Sets the named pins low.
    pub fn reset(&self, pins: PinSet) {
        pins.port.registers().brr.set(pins.pin_mask as u32);
    }

    /// Sets the named pins high if `level`, low otherwise.
    pub fn set_to(&self, pins: PinSet, level: bool) {
        if level {
            self.set(pins);
        } else {
            self.reset(pins);
        }
    }

    /// Reads the whole port's input data register and masks it down to
    /// `pins.pin_mask`.
    pub fn read(&self, pins: PinSet) -> u16 {
        (pins.port.registers().idr.get() as u16) & pins.pin_mask
    }

    /// Reads the whole port's input data register, unmasked. Used by the
    /// bus-capture engine, which reads all 16 bits of a port as the address
    /// or data snapshot regardless of which lines are wired up.
    pub fn read_port(&self, port: Port) -> u16 {
        port.registers().idr.get() as u16
    }

    /// Writes the whole port's output data register directly, unmasked.
    /// Used by drivers (flash data bus, address drive) that need to set
    /// several pins on one port to an arbitrary pattern in one write rather
    /// than pin-at-a-time through [`Gpio::set`]/[`Gpio::reset`].
    pub fn write_port(&self, port: Port, value: u16) {
        port.registers().odr.set(value as u32);
    }

    /// Returns the MMIO address of `port`'s output data register, for
    /// drivers (DMA, the reply engine) that need to program a peripheral to
    /// write it directly rather than going through this API.
    pub fn odr_address(&self, port: Port) -> u32 {
        port.base() as u32 + core::mem::offset_of!(RegisterBlock, odr) as u32
    }

    /// Returns the MMIO address of `port`'s input data register, for DMA
    /// sources (the bus-capture rings).
    pub fn idr_address(&self, port: Port) -> u32 {
        port.base() as u32 + core::mem::offset_of!(RegisterBlock, idr) as u32
    }
}

impl Mode {
    /// Packs this mode into the (MODE, CNF) 2-bit field pair used by
    /// `CRL`/`CRH`.
    fn bits(self) -> (u8, u8) {
        match self {
            Mode::Input(Pull::Floating) => (0b00, 0b01),
            Mode::Input(Pull::Up) | Mode::Input(Pull::Down) => (0b00, 0b10),
            Mode::Output(OutputType::PushPull, speed) => (speed as u8, 0b00),
            Mode::Output(OutputType::OpenDrain, speed) => (speed as u8, 0b01),
            Mode::Alternate(OutputType::PushPull, speed) => (speed as u8, 0b10),
            Mode::Alternate(OutputType::OpenDrain, speed) => (speed as u8, 0b11),
            Mode::Analog => (0b00, 0b00),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bit_packing_is_distinct() {
        let input_float = Mode::Input(Pull::Floating).bits();
        let input_pull = Mode::Input(Pull::Up).bits();
        let out_pp_50 = Mode::Output(OutputType::PushPull, Speed::High50MHz).bits();
        let out_od_2 = Mode::Output(OutputType::OpenDrain, Speed::Low2MHz).bits();

        assert_ne!(input_float, input_pull);
        assert_eq!(out_pp_50, (0b11, 0b00));
        assert_eq!(out_od_2, (0b10, 0b01));
    }

    #[test]
    fn and_pin_extends_mask() {
        let p = Port::A.pin(3).and_pin(5);
        assert_eq!(p.pin_mask, (1 << 3) | (1 << 5));
    }
}
