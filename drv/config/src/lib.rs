//! Non-volatile configuration store: an append-with-invalidate log in the
//! microcontroller's own internal flash, with a magic/CRC-validated active
//! record.
//!
//! The region is word-write-only and sector-erase-only, so records are
//! never updated in place; a change invalidates the old record and appends
//! a new one, erasing and restarting at the base only when the region
//! fills. [`ConfigStore`] is generic over an [`InternalFlash`] so it can be
//! exercised in host tests against a plain byte-array fake.
#![cfg_attr(not(test), no_std)]

use drv_timing::{Clock, Deadline};
use ringbuf::{ringbuf, ringbuf_entry};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const MAGIC: u32 = 0x1946_0602;
pub const VERSION: u8 = 0x01;
pub const BANK_COUNT: usize = 8;
/// 15 printable characters plus a NUL terminator.
pub const NAME_CAP: usize = 16;
pub const NO_BANK: u8 = 0xFF;
/// Size of the internal-flash region reserved for this log.
pub const AREA_SIZE: usize = 0x2000;

/// Debounce window: a dirty record is not flushed until this many
/// milliseconds after the last mutation, so a burst of `BANK_NAME`/
/// `BANK_MERGE` calls costs one erase-sized write, not several.
const FLUSH_DEBOUNCE_MS: u32 = 1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    BadName,
    BadBank,
    RegionFull,
    WriteFailed,
    EraseFailed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FlashAccessMode {
    Bits32 = 0,
    Bits16Low = 1,
    Bits16High = 2,
    Auto = 3,
    /// See the flash driver's own note: treated as an alias of
    /// [`FlashAccessMode::Bits32`] until something demonstrates the byte
    /// reordering needs distinct handling.
    Swap32 = 4,
}

impl FlashAccessMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FlashAccessMode::Bits16Low,
            2 => FlashAccessMode::Bits16High,
            3 => FlashAccessMode::Auto,
            4 => FlashAccessMode::Swap32,
            _ => FlashAccessMode::Bits32,
        }
    }
}

/// The on-flash record layout. Every field after `crc` (inclusive of
/// `size`) is covered by the checksum; `magic` and `crc` itself are not.
#[derive(Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RawRecord {
    magic: u32,
    crc: u32,
    size: u32,
    valid: u8,
    version: u8,
    ee_mode: u8,
    bank_current: u8,
    bank_poweron: u8,
    bank_nextreset: u8,
    board_revision: u8,
    feature_flags: u8,
    led_brightness: u8,
    _reserved: [u8; 3],
    merge: [u8; BANK_COUNT],
    longreset_seq: [u8; BANK_COUNT],
    names: [[u8; NAME_CAP]; BANK_COUNT],
    board_name: [u8; NAME_CAP],
}

/// Byte offset of the `crc` field; everything from here on is checksummed.
const CRC_COVERAGE_START: usize = 8;

impl RawRecord {
    fn factory_default() -> Self {
        let mut r = RawRecord {
            magic: MAGIC,
            crc: 0,
            size: core::mem::size_of::<RawRecord>() as u32,
            valid: 1,
            version: VERSION,
            ee_mode: FlashAccessMode::Auto as u8,
            bank_current: 0,
            bank_poweron: 0,
            bank_nextreset: NO_BANK,
            board_revision: 0,
            feature_flags: 0,
            led_brightness: 128,
            _reserved: [0; 3],
            merge: [0; BANK_COUNT],
            longreset_seq: [NO_BANK; BANK_COUNT],
            names: [[0; NAME_CAP]; BANK_COUNT],
            board_name: [0; NAME_CAP],
        };
        r.crc = r.compute_crc();
        r
    }

    fn compute_crc(&self) -> u32 {
        ks_proto_crc(self.as_bytes())
    }

    fn is_valid(&self) -> bool {
        self.magic == MAGIC && self.valid == 1 && self.crc == self.compute_crc()
    }
}

/// Local CRC helper so this crate doesn't need a dependency on `ks-proto`
/// just for one function; the polynomial matches the wire protocol's.
fn ks_proto_crc(record_bytes: &[u8]) -> u32 {
    use crc::{Crc, CRC_32_ISO_HDLC};
    const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    CRC.checksum(&record_bytes[CRC_COVERAGE_START..])
}

/// Abstraction over the internal-flash peripheral: byte-addressable reads,
/// word-granularity programs, and whole-region erase. All offsets are
/// relative to the config region's base address.
pub trait InternalFlash {
    fn read(&self, offset: usize, buf: &mut [u8]);
    fn program(&mut self, offset: usize, data: &[u8]) -> Result<(), ConfigError>;
    fn erase_region(&mut self) -> Result<(), ConfigError>;
}

#[derive(Copy, Clone, Debug)]
enum Trace {
    Loaded(u32),
    NoValidRecord,
    /// A candidate record's magic and `valid` flag looked right but its CRC
    /// didn't match the stored bytes, distinct from finding no record at
    /// all.
    CrcMismatch(usize),
    Invalidated(usize),
    Written(usize),
    RegionErased,
}

ringbuf!(Trace, 16, Trace::NoValidRecord);

/// Owns the in-memory decoded record, the dirty/flush-debounce state, and
/// the flash region it's backed by.
pub struct ConfigStore<F: InternalFlash> {
    flash: F,
    record: RawRecord,
    /// Byte offset, within the region, of the currently active record.
    active_offset: Option<usize>,
    dirty: bool,
    flush_deadline: Option<Deadline>,
}

impl<F: InternalFlash> ConfigStore<F> {
    /// Scans the region for a valid record and loads it, or installs
    /// factory defaults (and marks them dirty, so they get written on the
    /// first poll) if none is found.
    pub fn load(flash: F) -> Self {
        let mut store = ConfigStore {
            flash,
            record: RawRecord::factory_default(),
            active_offset: None,
            dirty: false,
            flush_deadline: None,
        };

        let record_size = core::mem::size_of::<RawRecord>();
        let mut offset = 0usize;
        let mut buf = [0u8; core::mem::size_of::<RawRecord>()];
        while offset + record_size <= AREA_SIZE {
            store.flash.read(offset, &mut buf);
            if let Some(candidate) = RawRecord::read_from_bytes(&buf).ok() {
                if candidate.magic == MAGIC && candidate.valid == 1 {
                    if candidate.is_valid() {
                        store.record = candidate;
                        store.active_offset = Some(offset);
                        ringbuf_entry!(Trace, Trace::Loaded(offset as u32));
                    } else {
                        ringbuf_entry!(Trace, Trace::CrcMismatch(offset));
                    }
                    offset += candidate.size.max(record_size as u32) as usize;
                    continue;
                } else if candidate.magic == 0xFFFF_FFFF {
                    break;
                }
            }
            offset += record_size;
        }

        if store.active_offset.is_none() {
            ringbuf_entry!(Trace, Trace::NoValidRecord);
            store.dirty = true;
        }
        store
    }

    /// Marks the in-memory record dirty and (re)starts the flush debounce
    /// window; call after any setter below.
    fn mark_dirty(&mut self, clock: &Clock) {
        self.dirty = true;
        self.flush_deadline = Some(Deadline::after_ms(clock, FLUSH_DEBOUNCE_MS));
    }

    /// Call from the foreground loop; flushes the record once the debounce
    /// window has elapsed since the last mutation.
    pub fn poll(&mut self, clock: &Clock) {
        if !self.dirty {
            return;
        }
        if let Some(deadline) = self.flush_deadline {
            if !deadline.has_elapsed(clock) {
                return;
            }
        }
        // Errors here are not retried immediately; the next mutation (or
        // the caller re-marking dirty) will try again.
        let _ = self.flush();
        self.dirty = false;
        self.flush_deadline = None;
    }

    fn flush(&mut self) -> Result<(), ConfigError> {
        self.record.valid = 1;
        self.record.size = core::mem::size_of::<RawRecord>() as u32;
        self.record.crc = self.record.compute_crc();
        let record_size = core::mem::size_of::<RawRecord>();
        let new_bytes = self.record.as_bytes();

        // Invalidate any existing valid record that differs from the one
        // we're about to write; if one already matches, there's nothing to
        // do.
        let mut offset = 0usize;
        let mut buf = [0u8; core::mem::size_of::<RawRecord>()];
        let mut write_at = None;
        while offset + record_size <= AREA_SIZE {
            self.flash.read(offset, &mut buf);
            match RawRecord::read_from_bytes(&buf) {
                Ok(existing) if existing.magic == MAGIC && existing.valid == 1 => {
                    if buf == *new_bytes {
                        return Ok(());
                    }
                    // `valid` sits right after magic(4)+crc(4)+size(4).
                    self.flash.program(offset + 12, &[0u8])?;
                    ringbuf_entry!(Trace, Trace::Invalidated(offset));
                    offset += existing.size.max(record_size as u32) as usize;
                }
                Ok(existing) if existing.magic == 0xFFFF_FFFF => {
                    write_at = Some(offset);
                    break;
                }
                _ => offset += record_size,
            }
        }

        let write_at = match write_at {
            Some(o) if o + record_size <= AREA_SIZE => o,
            _ => {
                self.flash.erase_region()?;
                ringbuf_entry!(Trace, Trace::RegionErased);
                0
            }
        };

        self.flash.program(write_at, new_bytes)?;
        self.active_offset = Some(write_at);
        ringbuf_entry!(Trace, Trace::Written(write_at));
        Ok(())
    }

    // --- bank info -------------------------------------------------

    pub fn bank_merge_byte(&self, bank: u8) -> Result<u8, ConfigError> {
        self.record
            .merge
            .get(bank as usize)
            .copied()
            .ok_or(ConfigError::BadBank)
    }

    pub fn set_bank_merge_byte(&mut self, clock: &Clock, bank: u8, byte: u8) -> Result<(), ConfigError> {
        let slot = self
            .record
            .merge
            .get_mut(bank as usize)
            .ok_or(ConfigError::BadBank)?;
        *slot = byte;
        self.mark_dirty(clock);
        Ok(())
    }

    pub fn bank_name(&self, bank: u8) -> Result<&str, ConfigError> {
        let raw = self.record.names.get(bank as usize).ok_or(ConfigError::BadBank)?;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        core::str::from_utf8(&raw[..len]).map_err(|_| ConfigError::BadName)
    }

    pub fn set_bank_name(&mut self, clock: &Clock, bank: u8, name: &str) -> Result<(), ConfigError> {
        if name.len() >= NAME_CAP {
            return Err(ConfigError::BadName);
        }
        let slot = self.record.names.get_mut(bank as usize).ok_or(ConfigError::BadBank)?;
        *slot = [0u8; NAME_CAP];
        slot[..name.len()].copy_from_slice(name.as_bytes());
        self.mark_dirty(clock);
        Ok(())
    }

    pub fn current_bank(&self) -> u8 {
        self.record.bank_current
    }

    pub fn set_current_bank(&mut self, clock: &Clock, bank: u8) {
        self.record.bank_current = bank;
        self.mark_dirty(clock);
    }

    pub fn power_on_bank(&self) -> u8 {
        self.record.bank_poweron
    }

    pub fn set_power_on_bank(&mut self, clock: &Clock, bank: u8) {
        self.record.bank_poweron = bank;
        self.mark_dirty(clock);
    }

    pub fn next_reset_bank(&self) -> u8 {
        self.record.bank_nextreset
    }

    pub fn set_next_reset_bank(&mut self, clock: &Clock, bank: u8) {
        self.record.bank_nextreset = bank;
        self.mark_dirty(clock);
    }

    pub fn long_reset_sequence(&self) -> &[u8; BANK_COUNT] {
        &self.record.longreset_seq
    }

    pub fn set_long_reset_sequence(&mut self, clock: &Clock, seq: &[u8; BANK_COUNT]) {
        self.record.longreset_seq = *seq;
        self.mark_dirty(clock);
    }

    // --- flash mode / board identity --------------------------------

    pub fn flash_access_mode(&self) -> FlashAccessMode {
        FlashAccessMode::from_u8(self.record.ee_mode)
    }

    pub fn set_flash_access_mode(&mut self, clock: &Clock, mode: FlashAccessMode) {
        self.record.ee_mode = mode as u8;
        self.mark_dirty(clock);
    }

    pub fn board_name(&self) -> &str {
        let raw = &self.record.board_name;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        core::str::from_utf8(&raw[..len]).unwrap_or("")
    }

    pub fn set_board_name(&mut self, clock: &Clock, name: &str) -> Result<(), ConfigError> {
        if name.len() >= NAME_CAP {
            return Err(ConfigError::BadName);
        }
        self.record.board_name = [0u8; NAME_CAP];
        self.record.board_name[..name.len()].copy_from_slice(name.as_bytes());
        self.mark_dirty(clock);
        Ok(())
    }

    pub fn board_revision(&self) -> u8 {
        self.record.board_revision
    }

    pub fn feature_flags(&self) -> u8 {
        self.record.feature_flags
    }

    pub fn led_brightness(&self) -> u8 {
        self.record.led_brightness
    }

    pub fn set_led_brightness(&mut self, clock: &Clock, brightness: u8) {
        self.record.led_brightness = brightness;
        self.mark_dirty(clock);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec;
    use std::vec::Vec;

    struct FakeFlash {
        data: Rc<RefCell<Vec<u8>>>,
    }

    impl FakeFlash {
        fn new() -> Self {
            FakeFlash {
                data: Rc::new(RefCell::new(vec![0xFFu8; AREA_SIZE])),
            }
        }
    }

    impl InternalFlash for FakeFlash {
        fn read(&self, offset: usize, buf: &mut [u8]) {
            let data = self.data.borrow();
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
        }

        fn program(&mut self, offset: usize, new_data: &[u8]) -> Result<(), ConfigError> {
            let mut data = self.data.borrow_mut();
            for (i, b) in new_data.iter().enumerate() {
                // Internal flash can only clear bits without an erase.
                data[offset + i] &= *b;
            }
            Ok(())
        }

        fn erase_region(&mut self) -> Result<(), ConfigError> {
            let mut data = self.data.borrow_mut();
            for b in data.iter_mut() {
                *b = 0xFF;
            }
            Ok(())
        }
    }

    #[test]
    fn record_size_is_word_aligned() {
        assert_eq!(core::mem::size_of::<RawRecord>() % 4, 0);
    }

    #[test]
    fn factory_default_is_self_consistent() {
        let r = RawRecord::factory_default();
        assert!(r.is_valid());
    }

    #[test]
    fn fresh_region_loads_factory_defaults_and_is_dirty() {
        let store = ConfigStore::load(FakeFlash::new());
        assert!(store.is_dirty());
        assert_eq!(store.current_bank(), 0);
        assert_eq!(store.next_reset_bank(), NO_BANK);
    }

    #[test]
    fn set_bank_name_round_trips_through_flush_and_reload() {
        let mut store = ConfigStore::load(FakeFlash::new());
        // shares the same backing Vec across loads
        let shared = store.flash.data.clone();

        let clock = Clock;
        store.set_bank_name(&clock, 2, "ROMA").unwrap();
        store.flush().unwrap();
        assert_eq!(store.bank_name(2).unwrap(), "ROMA");

        let reloaded = ConfigStore::load(FakeFlash { data: shared });
        assert_eq!(reloaded.bank_name(2).unwrap(), "ROMA");
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn second_write_invalidates_first_and_appends() {
        let mut store = ConfigStore::load(FakeFlash::new());
        let shared = store.flash.data.clone();
        let clock = Clock;

        store.set_current_bank(&clock, 1);
        store.flush().unwrap();
        let first_offset = store.active_offset.unwrap();

        store.set_current_bank(&clock, 2);
        store.flush().unwrap();
        let second_offset = store.active_offset.unwrap();

        assert_ne!(first_offset, second_offset);

        let mut buf = [0u8; core::mem::size_of::<RawRecord>()];
        let data = shared.borrow();
        buf.copy_from_slice(&data[first_offset..first_offset + buf.len()]);
        let old_record = RawRecord::read_from_bytes(&buf).unwrap();
        assert_eq!(old_record.valid, 0);
    }

    #[test]
    fn merge_byte_bounds_check() {
        let store = ConfigStore::load(FakeFlash::new());
        assert_eq!(store.bank_merge_byte(100), Err(ConfigError::BadBank));
    }
}
