//! Monotonic tick and nanosecond-accurate busy-wait.
//!
//! Flash read/write cycles are specified in nanoseconds and must not drift
//! with compiler optimization level, so this crate measures the core clock
//! once at startup and converts nanosecond and microsecond delays into cycle
//! counts measured against the Cortex-M DWT cycle counter. A separate
//! millisecond-granularity counter, driven by the SysTick exception, backs
//! the coarser timeouts (config flush debounce, erase timeouts, UPTIME).
#![no_std]

use core::sync::atomic::{AtomicU32, Ordering};
use cortex_m::peripheral::{DWT, SYST};

/// Core clock rate in Hz. Set once at [`Clock::init`] and read thereafter;
/// never changes at runtime on this board.
static HCLK_HZ: AtomicU32 = AtomicU32::new(0);

/// Milliseconds elapsed since [`Clock::init`], incremented by the SysTick
/// handler. Wraps after roughly 49 days; nothing on this board runs that
/// long between power cycles, but callers comparing ticks should use
/// wrapping arithmetic regardless.
static MILLIS: AtomicU32 = AtomicU32::new(0);

/// Owns the timing peripherals (DWT cycle counter, SysTick) and exposes
/// nanosecond busy-waits plus a monotonic millisecond/microsecond clock.
///
/// Carries no state of its own -- everything lives in the statics above --
/// so it's `Copy`: callers that need a `Clock` in more than one place (the
/// system struct and the drivers it hands a copy to) just get another one.
#[derive(Copy, Clone)]
pub struct Clock;

impl Clock {
    /// Enables the DWT cycle counter and configures SysTick for a 1 kHz
    /// tick. `hclk_hz` is the measured or configured core clock rate.
    pub fn init(mut dwt: DWT, mut syst: SYST, hclk_hz: u32) -> Self {
        HCLK_HZ.store(hclk_hz, Ordering::Relaxed);

        dwt.enable_cycle_counter();

        syst.set_clock_source(cortex_m::peripheral::syst::SystClkSource::Core);
        syst.set_reload(hclk_hz / 1000 - 1);
        syst.clear_current();
        syst.enable_counter();
        syst.enable_interrupt();

        Clock
    }

    /// Call from the SysTick exception handler.
    pub fn on_systick(&self) {
        MILLIS.fetch_add(1, Ordering::Relaxed);
    }

    /// Milliseconds since [`Clock::init`].
    pub fn millis(&self) -> u32 {
        MILLIS.load(Ordering::Relaxed)
    }

    /// Microseconds since [`Clock::init`], synthesized from the millisecond
    /// counter and the DWT cycle counter for sub-millisecond resolution.
    ///
    /// Not glitch-free across a millisecond rollover (a stale `millis` read
    /// paired with a cycle count from just after the rollover could show a
    /// tiny backward step); callers that need strict monotonicity should
    /// retry if two consecutive reads disagree in the wrong direction, as
    /// [`uptime_us`] does.
    pub fn micros(&self) -> u64 {
        let hclk = HCLK_HZ.load(Ordering::Relaxed) as u64;
        let ms = self.millis() as u64;
        let cycles_into_ms = (DWT::cycle_count() as u64)
            % hclk.max(1)
            * 1000
            / hclk.max(1);
        ms * 1000 + cycles_into_ms
    }

    /// Busy-waits for at least `ns` nanoseconds, masking interrupts for the
    /// duration so the spin can't be stretched by a preempting ISR. Used for
    /// the flash part's t_OE/t_DF/t_WP timings, which are specified in tens
    /// of nanoseconds and would be corrupted by even one interrupt latency.
    pub fn busy_wait_ns(&self, ns: u32) {
        let hclk = HCLK_HZ.load(Ordering::Relaxed) as u64;
        let cycles = ((ns as u64) * hclk / 1_000_000_000).max(1) as u32;
        cortex_m::interrupt::free(|_| self.busy_wait_cycles(cycles));
    }

    /// Busy-waits for at least `cycles` core clock cycles.
    pub fn busy_wait_cycles(&self, cycles: u32) {
        let start = DWT::cycle_count();
        while DWT::cycle_count().wrapping_sub(start) < cycles {
            cortex_m::asm::nop();
        }
    }

    /// Busy-waits for at least `us` microseconds. Used for the flash
    /// program-completion poll's inter-poll sleep and other microsecond-ish
    /// foreground delays where SysTick resolution (1 ms) is too coarse.
    pub fn busy_wait_us(&self, us: u32) {
        self.busy_wait_ns(us.saturating_mul(1000));
    }
}

/// Monotonically non-decreasing microseconds-since-boot, used by the
/// `UPTIME` command and by callers that only need "has N ms elapsed"
/// rather than nanosecond precision.
pub fn uptime_us(clock: &Clock) -> u64 {
    // Two reads guard against the sub-ms synthesis in `micros` going
    // backwards across a millisecond rollover; if the second read is
    // smaller, the rollover happened between samples and the first read
    // is closer to truth than a torn one would be.
    let a = clock.micros();
    let b = clock.micros();
    a.max(b)
}

/// A deadline expressed in milliseconds on [`Clock`]'s timeline, for
/// coarse-grained timeouts (erase, reply-DMA safety cap is cycle-based and
/// doesn't use this).
#[derive(Copy, Clone, Debug)]
pub struct Deadline(u32);

impl Deadline {
    pub fn after_ms(clock: &Clock, ms: u32) -> Self {
        Deadline(clock.millis().wrapping_add(ms))
    }

    pub fn has_elapsed(&self, clock: &Clock) -> bool {
        clock.millis().wrapping_sub(self.0) < (u32::MAX / 2)
    }
}
