//! Owns every process-wide singleton: the flash bus, bank manager, config
//! store, capture rings, framer, reply engine, and mailbox.
//!
//! Constructed once in `main`, then published through a static pointer so
//! the capture-compare interrupt handler can reach it without threading a
//! reference through `cortex-m-rt`'s vector table. Nothing else holds a
//! `&mut System` concurrently with the ISR: the foreground loop only reads
//! through the same pointer, and the two contexts are not preemptible with
//! respect to each other outside the narrow critical sections each driver
//! already takes around its own register writes.
use core::cell::UnsafeCell;

use drv_bank::BankManager;
use drv_capture::{CaptureRing, RING_LEN};
use drv_config::ConfigStore;
use drv_flash::{FlashBus, FlashPins};
use drv_framer::Framer;
use drv_gpio::{Gpio, Port};
use drv_mailbox::Mailbox;
use drv_reply::{ReplyEngine, ReplyPins};
use drv_timing::Clock;

use crate::dma::CaptureChannel;
use crate::mcu_flash::McuFlash;

/// Backing memory for the low-address capture ring. DMA-written, framer-read.
static mut ADDR_LO_RING: [u16; RING_LEN] = [0; RING_LEN];
/// Backing memory for the high-address/data capture ring.
static mut ADDR_HI_RING: [u16; RING_LEN] = [0; RING_LEN];

static mut MAILBOX_A_TO_U: [u8; 2048] = [0; 2048];
static mut MAILBOX_U_TO_A: [u8; 2048] = [0; 2048];

/// All process-wide hardware-backed state. Lives exactly once, in a
/// `'static` published by [`publish`].
pub struct System {
    pub clock: Clock,
    pub flash: FlashBus,
    pub bank: BankManager,
    pub config: ConfigStore<McuFlash>,
    pub addr_lo_ring: CaptureRing,
    pub addr_hi_ring: CaptureRing,
    pub addr_lo_dma: CaptureChannel,
    pub addr_hi_dma: CaptureChannel,
    pub framer: Framer,
    pub reply: ReplyEngine,
    pub mailbox: Mailbox<'static>,
}

impl System {
    pub fn new(
        clock: Clock,
        flash_pins: FlashPins,
        reply_pins: ReplyPins,
        addr_lo_dma: CaptureChannel,
        addr_hi_dma: CaptureChannel,
        mcu_flash: McuFlash,
    ) -> Self {
        let gpio = Gpio::new();
        let flash = FlashBus::new(gpio, clock, flash_pins);
        let config = ConfigStore::load(mcu_flash);
        let mut bank = BankManager::new();
        for b in 0..drv_bank::BANK_COUNT as u8 {
            if let Ok(byte) = config.bank_merge_byte(b) {
                let _ = bank.set_merge_byte(b, byte);
            }
        }
        let _ = bank.set_power_on(config.power_on_bank());
        let _ = bank.set_next_reset(config.next_reset_bank());

        // SAFETY: `System` is constructed exactly once, before interrupts
        // are unmasked, so no concurrent access to the mailbox backing
        // buffers is possible yet.
        let mailbox = unsafe {
            Mailbox::new(
                &mut *core::ptr::addr_of_mut!(MAILBOX_A_TO_U),
                &mut *core::ptr::addr_of_mut!(MAILBOX_U_TO_A),
            )
        };

        System {
            clock,
            flash,
            bank,
            config,
            addr_lo_ring: CaptureRing::new(),
            addr_hi_ring: CaptureRing::new(),
            addr_lo_dma,
            addr_hi_dma,
            framer: Framer::new(),
            reply: ReplyEngine::new(gpio, reply_pins),
            mailbox,
        }
    }

    /// Points both capture DMA channels at their ring buffers and the GPIO
    /// ports wired to the Amiga address/data bus, then arms the rings' own
    /// bookkeeping. `addr_lo_port`/`addr_hi_port` are the same ports named
    /// by the `FlashPins` passed to [`System::new`]: the bus is captured on
    /// the same pins the flash driver later drives during a reply.
    /// Call after the capture-compare timer is started.
    pub fn arm_capture(&mut self, gpio: Gpio, addr_lo_port: Port, addr_hi_port: Port) {
        let lo_backing = unsafe { &*core::ptr::addr_of!(ADDR_LO_RING) };
        let hi_backing = unsafe { &*core::ptr::addr_of!(ADDR_HI_RING) };
        self.addr_lo_dma
            .restore_capture(lo_backing, gpio.idr_address(addr_lo_port));
        self.addr_hi_dma
            .restore_capture(hi_backing, gpio.idr_address(addr_hi_port));
        self.addr_lo_ring.arm();
        self.addr_hi_ring.arm();
    }

    /// Drains whatever the low-address ring's framer state machine can
    /// consume right now, returning a completed frame event if one
    /// occurred. Called from the capture-compare ISR.
    pub fn drain_framer(&mut self) -> Option<drv_framer::FrameEvent> {
        let backing = unsafe { &*core::ptr::addr_of!(ADDR_LO_RING) };
        let mut last = None;
        while let Some(word) = self.addr_lo_ring.next_word(backing, &self.addr_lo_dma) {
            if let Some(event) = self.framer.feed(word) {
                last = Some(event);
            }
        }
        last
    }

    /// Called from the foreground loop once backlog has been handled, to
    /// clear a capture throttle.
    pub fn resume_capture(&mut self) {
        self.addr_lo_ring.resume();
        self.addr_hi_ring.resume();
    }
}

/// One `UnsafeCell`-wrapped slot for the published system pointer. Not
/// `Sync` by construction; access is disciplined by the single-producer
/// (ISR) / single-consumer (foreground) protocol documented on
/// [`System`], not by the type system.
struct SystemCell(UnsafeCell<Option<*mut System>>);
unsafe impl Sync for SystemCell {}

static SYSTEM_PTR: SystemCell = SystemCell(UnsafeCell::new(None));

/// Publishes `system` as the process-wide singleton. Must be called
/// exactly once, from `main`, before interrupts are unmasked.
pub fn publish(system: &'static mut System) {
    unsafe {
        *SYSTEM_PTR.0.get() = Some(system as *mut System);
    }
}

/// Borrows the published system. Panics if called before [`publish`] --
/// which would indicate an interrupt firing during early boot, a bug
/// worth a hard stop rather than undefined behavior.
///
/// # Safety
/// The caller must not call this reentrantly in a way that would produce
/// two live `&mut System` at once (e.g. from within a nested interrupt of
/// higher priority that also calls `system`).
pub unsafe fn system() -> &'static mut System {
    match *SYSTEM_PTR.0.get() {
        Some(ptr) => &mut *ptr,
        None => panic!("system accessed before publish"),
    }
}
