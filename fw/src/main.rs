//! Firmware entry point: peripheral bring-up, system construction, and the
//! foreground loop plus the two interrupt handlers (capture-compare frame
//! dispatch, SysTick).
#![no_std]
#![no_main]

extern crate panic_halt;

mod commands;
mod dma;
mod mcu_flash;
mod system;

use cortex_m_rt::entry;
use drv_flash::FlashPins;
use drv_framer::FrameEvent;
use drv_gpio::Port;
use drv_reply::ReplyPins;
use drv_timing::Clock;
use stm32f1::stm32f103::{interrupt, Peripherals as McuPeripherals};

use crate::dma::CaptureChannel;
use crate::mcu_flash::McuFlash;
use crate::system::System;

/// HSE crystal rate fitted to this board.
const HSE_HZ: u32 = 8_000_000;
/// Target core clock: HSE x9 via the main PLL.
const HCLK_HZ: u32 = 72_000_000;
const _: () = assert!(HSE_HZ * 9 == HCLK_HZ);

/// Brings the core clock up from HSI to `HCLK_HZ` via HSE + the main PLL,
/// and widens flash wait states to match, per the reference manual's
/// sequencing (enable HSE, configure PLL while still on HSI, only then
/// switch SW over).
fn init_clocks(rcc: &stm32f1::stm32f103::RCC, flash_acr: &stm32f1::stm32f103::flash::ACR) {
    flash_acr.modify(|_, w| unsafe { w.latency().bits(2) });

    rcc.cr.modify(|_, w| w.hseon().set_bit());
    while rcc.cr.read().hserdy().bit_is_clear() {}

    rcc.cfgr.modify(|_, w| unsafe {
        w.pllsrc().set_bit() // PLL source = HSE
            .pllmul().bits(0b0111) // x9: 8 MHz * 9 = 72 MHz
            .hpre().div1()
            .ppre1().div2() // APB1 capped at 36 MHz
            .ppre2().div1()
    });

    rcc.cr.modify(|_, w| w.pllon().set_bit());
    while rcc.cr.read().pllrdy().bit_is_clear() {}

    rcc.cfgr.modify(|_, w| unsafe { w.sw().bits(0b10) }); // SW = PLL
    while rcc.cfgr.read().sws().bits() != 0b10 {}
}

fn enable_peripheral_clocks(rcc: &stm32f1::stm32f103::RCC) {
    rcc.apb2enr.modify(|_, w| {
        w.iopaen().set_bit()
            .iopben().set_bit()
            .iopcen().set_bit()
            .iopden().set_bit()
            .iopeen().set_bit()
            .afioen().set_bit()
    });
    rcc.ahbenr.modify(|_, w| w.dma1en().set_bit());
    rcc.apb1enr.modify(|_, w| w.tim2en().set_bit());
}

/// Configures TIM2 channel 1 as an input-capture edge detector on the
/// host's address strobe, with its capture event routed to a DMA request
/// rather than an interrupt -- the DMA controller, not the CPU, is what
/// actually timestamps each strobe edge by copying the address/data ports'
/// IDR into the capture rings. The CPU only learns about it once a framer
/// dispatch or CRC error falls out the other end, via DMA1 channel 1's own
/// transfer-complete interrupt.
fn init_strobe_timer(tim2: &stm32f1::stm32f103::TIM2) {
    tim2.ccmr1_input().modify(|_, w| w.cc1s().ti1());
    tim2.ccer.modify(|_, w| w.cc1e().set_bit());
    tim2.dier.modify(|_, w| w.cc1de().set_bit());
    tim2.cr1.modify(|_, w| w.cen().set_bit());
}

/// Board pin assignment: the flash data/address/control lines, the reply
/// engine's bus-usurpation lines, and the A17-A19 bank override lines.
/// Arbitrary but internally consistent; a real board's schematic would pin
/// this down exactly.
fn flash_pins() -> FlashPins {
    FlashPins {
        address_lo: Port::A.pin(0).and_pin(1).and_pin(2).and_pin(3),
        address_hi: Port::B.pin(0).and_pin(1),
        data: Port::C.pin(0).and_pin(1).and_pin(2).and_pin(3),
        data_hi: Port::E.pin(0).and_pin(1).and_pin(2).and_pin(3),
        output_enable: Port::D.pin(0),
        write_enable: Port::D.pin(1),
        chip_enable: Port::D.pin(2),
        override_lines: Port::D.pin(3).and_pin(4).and_pin(5),
    }
}

fn reply_pins() -> ReplyPins {
    ReplyPins {
        flash_output_enable: Port::D.pin(0),
        strobe_reroute_select: Port::D.pin(6),
        data_direction: Port::D.pin(7),
    }
}

#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().expect("core peripherals already taken");
    let dp = McuPeripherals::take().expect("device peripherals already taken");

    init_clocks(&dp.RCC, &dp.FLASH.acr);
    enable_peripheral_clocks(&dp.RCC);

    let clock = Clock::init(cp.DWT, cp.SYST, HCLK_HZ);

    static DMA1_CELL: static_cell::StaticCell<stm32f1::stm32f103::DMA1> =
        static_cell::StaticCell::new();
    let dma1: &'static stm32f1::stm32f103::DMA1 = DMA1_CELL.init(dp.DMA1);

    // SAFETY: channels 1 and 2 are owned exclusively by the low/high
    // capture rings for the remainder of the program; nothing else touches
    // DMA1 channels 1-2.
    let addr_lo_dma = unsafe { CaptureChannel::new(&dma1.ch1) };
    let addr_hi_dma = unsafe { CaptureChannel::new(&dma1.ch2) };

    let mcu_flash = McuFlash::new(dp.FLASH);
    let flash_pins = flash_pins();
    let addr_lo_port = flash_pins.address_lo.port;
    let addr_hi_port = flash_pins.address_hi.port;

    static SYSTEM_CELL: static_cell::StaticCell<System> = static_cell::StaticCell::new();
    let sys = SYSTEM_CELL.init(System::new(
        clock,
        flash_pins,
        reply_pins(),
        addr_lo_dma,
        addr_hi_dma,
        mcu_flash,
    ));
    sys.arm_capture(drv_gpio::Gpio::new(), addr_lo_port, addr_hi_port);
    init_strobe_timer(&dp.TIM2);
    system::publish(sys);

    unsafe {
        cortex_m::peripheral::NVIC::unmask(stm32f1::stm32f103::Interrupt::DMA1_CHANNEL1);
    }

    loop {
        // SAFETY: the foreground loop is the single reader/writer of the
        // published system outside the capture-compare ISR, which only
        // calls `drain_framer`.
        let sys = unsafe { system::system() };

        sys.config.poll(&sys.clock);

        if sys.addr_lo_ring.throttled() || sys.addr_hi_ring.throttled() {
            sys.resume_capture();
        }

        if let Some(next) = sys.bank.take_next_reset() {
            let _ = sys.bank.select(&mut sys.flash, next);
        }

        cortex_m::asm::wfi();
    }
}

#[interrupt]
fn DMA1_CHANNEL1() {
    // SAFETY: this ISR is the sole caller of `drain_framer`/`take_dispatch`;
    // the foreground loop never touches the framer or capture rings.
    let sys = unsafe { system::system() };
    match sys.drain_framer() {
        Some(FrameEvent::Dispatch) => {
            if let Some(frame) = sys.framer.take_dispatch() {
                commands::dispatch(sys, &frame);
            }
        }
        Some(FrameEvent::CrcError) => commands::handle_crc_error(sys),
        None => {}
    }
}

#[cortex_m_rt::exception]
fn SysTick() {
    let sys = unsafe { system::system() };
    sys.clock.on_systick();
}
