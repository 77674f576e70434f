//! Chip identification, boot-block geometry, and bulk program/erase with
//! verification, built on the single-word primitives in [`crate::low`].

use crate::low::{FlashBus, FlashError, OverrideOp};

/// Program opcode, issued after the unlock preamble.
const OP_PROGRAM: u32 = 0xA0;
/// Erase-setup opcode, first half of both chip- and sector-erase.
const OP_ERASE_SETUP: u32 = 0x80;
/// Second half of chip erase.
const OP_ERASE_CHIP: u32 = 0x10;
/// Second half of sector erase, one per sector address.
const OP_ERASE_SECTOR: u32 = 0x30;

/// Bit 5 of the status word: the device's own program/erase failure flag.
const STATUS_FAILURE_BIT: u32 = 1 << 5;

/// Maximum time to poll for program completion before declaring failure,
/// matching the datasheet's worst-case word-program time.
const PROGRAM_POLL_US: u64 = 360;
/// Program retries after a recoverable verify mismatch or status failure.
const PROGRAM_RETRIES: u32 = 2;

const CHIP_ERASE_TIMEOUT_S: u64 = 32;
const SECTOR_ERASE_BASE_TIMEOUT_S: u64 = 1;
const SECTOR_ERASE_PER_SECTOR_TIMEOUT_S: u64 = 1;
/// Sector-erase commands issued within this window of each other are
/// batched into a single device-internal erase cycle.
const SECTOR_BATCH_WINDOW_US: u64 = 100;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EraseMode {
    Chip,
    Sector,
}

/// Per-part boot-block layout: which main-array block is non-uniform, the
/// uniform block size elsewhere on the die, and the sub-sector sizes within
/// the boot block itself (top or bottom, whichever the part puts it at).
#[derive(Copy, Clone, Debug)]
pub struct ChipGeometry {
    pub part_id: u32,
    /// Index (0-based, from the bottom of the die) of the block that is
    /// subdivided, rather than uniform.
    pub boot_block_number: u32,
    /// Size in Kwords of every uniform (non-boot) block.
    pub main_block_kwords: u32,
    /// Sizes in Kwords of each sub-sector inside the boot block, in
    /// ascending address order.
    pub sub_sector_map: &'static [u32],
}

impl ChipGeometry {
    /// Total size in Kwords of the boot block, the sum of its sub-sectors.
    pub fn boot_block_kwords(&self) -> u32 {
        self.sub_sector_map.iter().sum()
    }

    /// The byte (word) offset, relative to the boot block's base, at which
    /// sub-sector `index` starts.
    fn sub_sector_offset_words(&self, index: usize) -> u32 {
        self.sub_sector_map[..index].iter().sum::<u32>() * 1024
    }

    /// Given an address offset in words from the start of the boot block,
    /// returns the base address and size (in words) of the sub-sector that
    /// contains it.
    pub fn sub_sector_containing(&self, offset_words: u32) -> (u32, u32) {
        let mut base = 0u32;
        for &kwords in self.sub_sector_map {
            let size_words = kwords * 1024;
            if offset_words < base + size_words {
                return (base, size_words);
            }
            base += size_words;
        }
        let last = *self.sub_sector_map.last().unwrap_or(&0) * 1024;
        (base.saturating_sub(last), last)
    }
}

/// Geometry table for the supported MX29F1615-family parts, keyed by the
/// device id code read back from [`crate::low::FlashBus::id`].
///
/// Both table entries describe a 16 Mbit (1 M x 16) die with a 4/4/8/16
/// Kword bottom boot block; this part family ships only in the bottom-boot
/// variant.
pub static CHIP_TABLE: &[ChipGeometry] = &[ChipGeometry {
    part_id: 0x2225,
    boot_block_number: 0,
    main_block_kwords: 32,
    sub_sector_map: &[4, 4, 8, 16],
}];

pub fn geometry_for(part_id: u32) -> Option<&'static ChipGeometry> {
    CHIP_TABLE.iter().find(|g| g.part_id == part_id)
}

/// True exactly when every bit that differs between `expected` and `actual`
/// is a bit that needed to go from 1 to 0 (a plain NOR program can only
/// clear bits). A mismatch with any bit needing 0-to-1 can't be fixed by
/// retrying the program and is fatal for the transaction.
pub fn verify_mismatch_is_recoverable(expected: u32, actual: u32) -> bool {
    let mismatch = expected ^ actual;
    mismatch & expected == 0
}

/// Polls the status word at address 0 until two consecutive identical
/// reads (program complete) or the failure bit sticks across two reads, or
/// `PROGRAM_POLL_US` elapses.
fn poll_program_completion(bus: &mut FlashBus) -> Result<(), FlashError> {
    let start = bus.uptime_us();
    let mut last = bus.read_word(0x00);
    loop {
        let now = bus.read_word(0x00);
        if now == last {
            return Ok(());
        }
        if now & STATUS_FAILURE_BIT != 0 && last & STATUS_FAILURE_BIT != 0 {
            return Err(FlashError::StatusFailure);
        }
        last = now;
        if bus.uptime_us().saturating_sub(start) > PROGRAM_POLL_US {
            return Err(FlashError::Timeout);
        }
    }
}

/// Issues one unlock+program+poll+verify cycle for a single word, retrying
/// up to [`PROGRAM_RETRIES`] times on a status failure or a recoverable
/// verify mismatch.
pub fn program_word(bus: &mut FlashBus, addr: u32, value: u32) -> Result<(), FlashError> {
    let mask = bus.mode().word_mask();
    let expected = value & mask;

    bus.enable();
    let result = (|| {
        for attempt in 0..=PROGRAM_RETRIES {
            bus.unlock_cmd(0x555, OP_PROGRAM);
            bus.write_word(addr, value);

            match poll_program_completion(bus) {
                Ok(()) => {}
                Err(_) if attempt < PROGRAM_RETRIES => continue,
                Err(e) => return Err(e),
            }

            let actual = bus.read_word(addr) & mask;
            if actual == expected {
                return Ok(());
            }
            if !verify_mismatch_is_recoverable(expected, actual) {
                return Err(FlashError::VerifyFailed);
            }
            if attempt == PROGRAM_RETRIES {
                return Err(FlashError::VerifyFailed);
            }
        }
        Err(FlashError::VerifyFailed)
    })();
    bus.disable();
    result
}

/// Programs `data` starting at `addr`, one word at a time, verifying and
/// retrying each word independently. Stops at the first word that fails
/// after retries.
pub fn program(bus: &mut FlashBus, addr: u32, data: &[u32]) -> Result<(), FlashError> {
    for (i, word) in data.iter().enumerate() {
        program_word(bus, addr + i as u32, *word)?;
    }
    Ok(())
}

/// Erases the whole chip: unlock/80h, unlock/10h, then polls for the array
/// to read all-ones within the 32 s datasheet timeout.
pub fn erase_chip(bus: &mut FlashBus) -> Result<(), FlashError> {
    bus.enable();
    bus.unlock_cmd(0x555, OP_ERASE_SETUP);
    bus.unlock_cmd(0x555, OP_ERASE_CHIP);
    let result = poll_erase_completion(bus, 0, CHIP_ERASE_TIMEOUT_S * 1_000_000);
    bus.disable();
    result
}

/// Erases the sectors spanning `[addr, addr+len)`. Sector boundaries inside
/// the boot block are resolved via `geometry`; outside it every sector is
/// `main_block_kwords` Kwords. All per-sector erase opcodes are issued back
/// to back (they fall within the device's erase-command batching window),
/// then one poll covers the whole batch.
pub fn erase_sectors(
    bus: &mut FlashBus,
    geometry: &ChipGeometry,
    addr: u32,
    len: u32,
) -> Result<(), FlashError> {
    let sectors = sector_bases(geometry, addr, len);
    let timeout_us =
        (SECTOR_ERASE_BASE_TIMEOUT_S + SECTOR_ERASE_PER_SECTOR_TIMEOUT_S * sectors.len() as u64)
            * 1_000_000;

    bus.enable();
    for base in &sectors {
        bus.unlock_cmd(0x555, OP_ERASE_SETUP);
        bus.cmd(*base, OP_ERASE_SECTOR);
        // Successive sector commands must land within the device's
        // SECTOR_BATCH_WINDOW_US batching window; on real silicon that's
        // satisfied by the unlock-sequence overhead alone.
        let _ = SECTOR_BATCH_WINDOW_US;
    }
    let result = poll_erase_completion(bus, *sectors.first().unwrap_or(&addr), timeout_us);
    bus.disable();
    result
}

/// Computes the base address of every sector overlapping `[addr, addr+len)`.
fn sector_bases(geometry: &ChipGeometry, addr: u32, len: u32) -> heapless::Vec<u32, 32> {
    let boot_block_words = geometry.boot_block_kwords() * 1024;
    let main_words = geometry.main_block_kwords * 1024;
    let mut bases = heapless::Vec::new();
    let mut cursor = addr;
    let end = addr + len;
    while cursor < end {
        let base = if cursor < boot_block_words {
            let (sub_base, sub_size) = geometry.sub_sector_containing(cursor);
            cursor = sub_base + sub_size;
            sub_base
        } else {
            let offset = cursor - boot_block_words;
            let index = offset / main_words;
            let base = boot_block_words + index * main_words;
            cursor = base + main_words;
            base
        };
        let _ = bases.push(base);
    }
    bases
}

/// Polls address 0 of the die containing `addr` until two consecutive
/// reads agree (erase complete) or `timeout_us` elapses.
fn poll_erase_completion(bus: &mut FlashBus, addr: u32, timeout_us: u64) -> Result<(), FlashError> {
    let start = bus.uptime_us();
    let mut last = bus.read_word(addr);
    loop {
        let now = bus.read_word(addr);
        if now == last && now == bus.mode().word_mask() {
            return Ok(());
        }
        last = now;
        if bus.uptime_us().saturating_sub(start) > timeout_us {
            return Err(FlashError::Timeout);
        }
    }
}

/// Top-level erase entry point dispatching on `mode`.
pub fn erase(
    bus: &mut FlashBus,
    mode: EraseMode,
    geometry: &ChipGeometry,
    addr: u32,
    len: u32,
) -> Result<(), FlashError> {
    match mode {
        EraseMode::Chip => erase_chip(bus),
        EraseMode::Sector => erase_sectors(bus, geometry, addr, len),
    }
}

/// Drives A17-A19 to select which quarter/eighth of the flash address space
/// is visible, per a bank's width and start index. `which` names the lines
/// that must be overridden for a given width, and `value` their setting.
pub fn select_address_lines(bus: &mut FlashBus, which: u8, value: u8) {
    bus.address_override(which, value, OverrideOp::Record);
}

pub fn restore_address_lines(bus: &mut FlashBus) {
    bus.address_override(0, 0, OverrideOp::Restore);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_only_for_clear_transitions() {
        // expected 0b0000, actual 0b0001: a bit failed to clear -> recoverable.
        assert!(verify_mismatch_is_recoverable(0b0000, 0b0001));
        // expected 0b0001, actual 0b0000: a bit that should be 1 read as 0,
        // impossible to fix by reprogramming -> fatal.
        assert!(!verify_mismatch_is_recoverable(0b0001, 0b0000));
        // exact match is trivially "recoverable" (nothing to recover).
        assert!(verify_mismatch_is_recoverable(0xABCD, 0xABCD));
    }

    #[test]
    fn geometry_lookup() {
        let g = geometry_for(0x2225).expect("known part");
        assert_eq!(g.boot_block_kwords(), 32);
        assert_eq!(g.main_block_kwords, 32);
    }

    #[test]
    fn sub_sector_containing_first_and_last() {
        let g = geometry_for(0x2225).unwrap();
        // first sub-sector: 4 Kwords at offset 0
        assert_eq!(g.sub_sector_containing(0), (0, 4 * 1024));
        // an address in the third (8 Kword) sub-sector
        let third_start = (4 + 4) * 1024;
        assert_eq!(g.sub_sector_containing(third_start + 10), (third_start, 8 * 1024));
    }

    #[test]
    fn sector_bases_cover_boot_block_boundary() {
        let g = geometry_for(0x2225).unwrap();
        let boot_words = g.boot_block_kwords() * 1024;
        // a range starting in the last boot sub-sector and crossing into
        // the first uniform main block must produce two distinct bases.
        let bases = sector_bases(g, boot_words - 10, 20);
        assert!(bases.len() >= 2);
        assert!(bases.iter().any(|&b| b < boot_words));
        assert!(bases.iter().any(|&b| b >= boot_words));
    }
}
