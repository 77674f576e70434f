//! Static ring buffer for recording trace events in interrupt and main-loop
//! contexts without allocation.
//!
//! The capture ISR, framer, and reply engine all run in places where a UART
//! `println!` is either too slow or not safe to call. Instead they deposit an
//! entry into a named ring buffer with [`ringbuf_entry!`], which a debugger
//! (or a USB-side log-dump command) can read back out of RAM after the fact.
//!
//! Entries that repeat the same line and payload as the most recent entry are
//! folded into a running count instead of being appended, so a spinning loop
//! doesn't evict useful history.
#![no_std]

use core::cell::RefCell;
use critical_section::Mutex;

/// Declares a ring buffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ring buffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all
/// initialized to `expr`. If you omit the name it defaults to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::RingbufCell<$t, $n> =
            $crate::RingbufCell::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Inserts `payload` into the ring buffer named `NAME` (or `__RINGBUF` if no
/// name is given), tagging the entry with the call site's source line.
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let (p, buf) = ($payload, &$buf);
        $crate::RecordEntry::record_entry(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

/// A single entry in a [`Ringbuf`]. When an entry is recorded with the same
/// `line` and `payload` as the most recent one, `count` is incremented rather
/// than allocating a new slot.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy> {
    pub line: u16,
    pub generation: u16,
    pub payload: T,
    pub count: u16,
}

/// A fixed-size ring buffer of `N` entries of type `T`.
#[derive(Debug)]
pub struct Ringbuf<T: Copy, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy, const N: usize> Ringbuf<T, N> {
    fn do_record(&mut self, last: usize, line: u16, payload: T) {
        let ndx = {
            let next = last.wrapping_add(1);
            if next >= self.buffer.len() {
                0
            } else {
                next
            }
        };
        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }
}

/// Interior-mutable static home for a [`Ringbuf`], guarded by a global
/// critical section rather than an IPC lease -- there is only one CPU here,
/// and the framer ISR is the only preemptor.
pub struct RingbufCell<T: Copy, const N: usize>(Mutex<RefCell<Ringbuf<T, N>>>);

impl<T: Copy, const N: usize> RingbufCell<T, N> {
    pub const fn new(init: Ringbuf<T, N>) -> Self {
        Self(Mutex::new(RefCell::new(init)))
    }
}

/// Abstracts over a ring buffer cell so [`ringbuf_entry!`] works whether
/// logging is compiled in or stripped out by the `disabled` feature.
pub trait RecordEntry<T: Copy> {
    fn record_entry(&self, line: u16, payload: T);
}

#[cfg(not(feature = "disabled"))]
impl<T: Copy + PartialEq, const N: usize> RecordEntry<T> for RingbufCell<T, N> {
    fn record_entry(&self, line: u16, payload: T) {
        critical_section::with(|cs| {
            let mut ring = self.0.borrow_ref_mut(cs);
            let last = ring.last.unwrap_or(usize::MAX);

            if let Some(ent) = ring.buffer.get_mut(last) {
                if ent.line == line && ent.payload == payload {
                    if let Some(new_count) = ent.count.checked_add(1) {
                        ent.count = new_count;
                        return;
                    }
                }
            }

            ring.do_record(last, line, payload);
        });
    }
}

#[cfg(feature = "disabled")]
impl<T: Copy, const N: usize> RecordEntry<T> for RingbufCell<T, N> {
    fn record_entry(&self, _line: u16, _payload: T) {}
}
