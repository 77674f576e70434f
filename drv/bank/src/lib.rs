//! Logical ROM bank selection and merging.
//!
//! A bank is a quarter/half/whole slice of the flash address space, chosen
//! by driving A17-A19 low-order-first. This crate owns the merge-byte
//! encoding and the current/power-on/next-reset/long-reset bookkeeping;
//! [`drv_flash::high::select_address_lines`] does the actual pin drive.
#![cfg_attr(not(test), no_std)]

use drv_flash::{restore_address_lines, select_address_lines, FlashBus};
use ringbuf::{ringbuf, ringbuf_entry};

/// Number of logical banks (a quarter-flash each at width 1).
pub const BANK_COUNT: usize = 8;

/// Sentinel meaning "no bank" in the power-on/next-reset/long-reset slots.
pub const NO_BANK: u8 = 0xFF;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BankError {
    OutOfRange,
    BadWidth,
    BadAlignment,
    NotAStartBank,
    NotMerged,
}

/// Decoded form of a bank's merge byte: high nibble is width in quarters
/// (1, 2, 4, or 8), low nibble is this bank's position within that range
/// (0 for the addressable "start" bank, nonzero for subsumed banks).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Merge {
    pub width: u8,
    pub position: u8,
}

impl Merge {
    pub const UNMERGED: Merge = Merge { width: 1, position: 0 };

    pub fn from_byte(byte: u8) -> Self {
        Merge {
            width: byte >> 4,
            position: byte & 0x0F,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.width << 4) | (self.position & 0x0F)
    }

    pub fn is_start(self) -> bool {
        self.position == 0
    }
}

/// Validates that `start` is a legal first bank index for a merge of
/// `width` quarters, per the width-dependent alignment rules.
pub fn validate_merge_range(start: u8, width: u8) -> Result<(), BankError> {
    if start as usize >= BANK_COUNT {
        return Err(BankError::OutOfRange);
    }
    match width {
        1 => Ok(()),
        2 => {
            if start % 2 == 0 {
                Ok(())
            } else {
                Err(BankError::BadAlignment)
            }
        }
        4 => {
            if start == 0 || start == 4 {
                Ok(())
            } else {
                Err(BankError::BadAlignment)
            }
        }
        8 => {
            if start == 0 {
                Ok(())
            } else {
                Err(BankError::BadAlignment)
            }
        }
        _ => Err(BankError::BadWidth),
    }
}

/// Builds the merge bytes for banks `[start, start+width)` given a merge of
/// `width` quarters starting at `start`. Returns one byte per bank in the
/// range, in order, for the caller to store into the config record.
pub fn merge_bytes(start: u8, width: u8) -> Result<heapless::Vec<u8, 8>, BankError> {
    validate_merge_range(start, width)?;
    let mut out = heapless::Vec::new();
    for position in 0..width {
        let m = Merge { width, position };
        out.push(m.to_byte()).map_err(|_| BankError::BadWidth)?;
    }
    Ok(out)
}

/// Derives the number of address lines to override and the value to drive
/// them to, for a *start* bank at logical index `bank` with the given
/// merge width (in quarters). Each "quarter" covers 1/8 of the flash's
/// total address space; A17 selects within a half, A18 within a quarter,
/// A19 the top/bottom half. Widening the merge releases the low-order
/// address lines of the covered range back to the host/flash and keeps
/// only the lines needed to select the *range*.
///
/// Returns `(which, value)`: `which` bit *n* set means A(17+n) is
/// overridden; `value` bit *n* is the level to drive it to.
pub fn address_line_override(bank: u8, width: u8) -> (u8, u8) {
    let lines_to_drive = 3 - width.trailing_zeros() as u8;
    let which = (1u8 << lines_to_drive) - 1;
    let value = bank & which;
    (which, value)
}

#[derive(Copy, Clone, Debug)]
enum Trace {
    Selected(u8),
    LongReset(u8, u8),
}

ringbuf!(Trace, 16, Trace::Selected(0));

/// Bank selection and rotation state, mirroring the fields persisted in the
/// config record. Owns no hardware directly; callers pass a [`FlashBus`]
/// for [`BankManager::select`] to drive the override pins through.
pub struct BankManager {
    merges: [Merge; BANK_COUNT],
    current: u8,
    power_on: u8,
    next_reset: u8,
    /// 0xFF-terminated list of start banks visited on successive
    /// long-reset presses.
    long_reset: heapless::Vec<u8, { BANK_COUNT + 1 }>,
}

impl BankManager {
    pub fn new() -> Self {
        BankManager {
            merges: [Merge::UNMERGED; BANK_COUNT],
            current: 0,
            power_on: 0,
            next_reset: NO_BANK,
            long_reset: heapless::Vec::new(),
        }
    }

    pub fn merge_byte(&self, bank: u8) -> Option<u8> {
        self.merges.get(bank as usize).map(|m| m.to_byte())
    }

    pub fn set_merge_byte(&mut self, bank: u8, byte: u8) -> Result<(), BankError> {
        let slot = self
            .merges
            .get_mut(bank as usize)
            .ok_or(BankError::OutOfRange)?;
        *slot = Merge::from_byte(byte);
        Ok(())
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn power_on(&self) -> u8 {
        self.power_on
    }

    pub fn next_reset(&self) -> u8 {
        self.next_reset
    }

    pub fn long_reset_sequence(&self) -> &[u8] {
        &self.long_reset
    }

    pub fn set_long_reset_sequence(&mut self, seq: &[u8]) -> Result<(), BankError> {
        for &bank in seq {
            if bank != NO_BANK {
                self.require_start_bank(bank)?;
            }
        }
        self.long_reset.clear();
        for &bank in seq {
            self.long_reset.push(bank).map_err(|_| BankError::OutOfRange)?;
        }
        Ok(())
    }

    fn require_start_bank(&self, bank: u8) -> Result<(), BankError> {
        let merge = self
            .merges
            .get(bank as usize)
            .ok_or(BankError::OutOfRange)?;
        if merge.is_start() {
            Ok(())
        } else {
            Err(BankError::NotAStartBank)
        }
    }

    /// Selects `bank` as current, driving the override pins through `bus`.
    pub fn select(&mut self, bus: &mut FlashBus, bank: u8) -> Result<(), BankError> {
        self.require_start_bank(bank)?;
        let merge = self.merges[bank as usize];
        let (which, value) = address_line_override(bank, merge.width);
        select_address_lines(bus, which, value);
        self.current = bank;
        ringbuf_entry!(Trace, Trace::Selected(bank));
        Ok(())
    }

    /// Releases the override pins, e.g. while the microcontroller itself
    /// needs the address bus for a reply.
    pub fn release(&self, bus: &mut FlashBus) {
        restore_address_lines(bus);
    }

    pub fn set_power_on(&mut self, bank: u8) -> Result<(), BankError> {
        self.require_start_bank(bank)?;
        self.power_on = bank;
        Ok(())
    }

    pub fn set_next_reset(&mut self, bank: u8) -> Result<(), BankError> {
        if bank != NO_BANK {
            self.require_start_bank(bank)?;
        }
        self.next_reset = bank;
        Ok(())
    }

    /// Consumes `next_reset` (if set) and returns the bank a reset should
    /// select, clearing the field so it applies exactly once.
    pub fn take_next_reset(&mut self) -> Option<u8> {
        if self.next_reset == NO_BANK {
            None
        } else {
            let bank = self.next_reset;
            self.next_reset = NO_BANK;
            Some(bank)
        }
    }

    /// Advances to the bank after `current` in the long-reset sequence,
    /// wrapping to the first entry if `current` isn't in the list or is its
    /// last element.
    pub fn long_reset_advance(&mut self) -> Option<u8> {
        if self.long_reset.is_empty() {
            return None;
        }
        let position = self
            .long_reset
            .iter()
            .position(|&b| b == self.current)
            .map(|p| (p + 1) % self.long_reset.len())
            .unwrap_or(0);
        let next = self.long_reset[position];
        ringbuf_entry!(Trace, Trace::LongReset(self.current, next));
        if next == NO_BANK {
            self.long_reset.first().copied()
        } else {
            Some(next)
        }
    }
}

impl Default for BankManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_round_trip() {
        let m = Merge { width: 4, position: 2 };
        assert_eq!(Merge::from_byte(m.to_byte()), m);
    }

    #[test]
    fn width_alignment_rules() {
        assert!(validate_merge_range(0, 2).is_ok());
        assert!(validate_merge_range(1, 2).is_err());
        assert!(validate_merge_range(0, 4).is_ok());
        assert!(validate_merge_range(2, 4).is_err());
        assert!(validate_merge_range(0, 8).is_ok());
        assert!(validate_merge_range(1, 8).is_err());
        assert!(validate_merge_range(0, 3).is_err());
    }

    #[test]
    fn merge_bytes_sequence() {
        let bytes = merge_bytes(0, 4).unwrap();
        assert_eq!(&bytes[..], &[0x40, 0x41, 0x42, 0x43]);
    }

    #[test]
    fn address_override_widths() {
        assert_eq!(address_line_override(5, 1), (0b111, 5));
        assert_eq!(address_line_override(0, 8), (0b000, 0));
        assert_eq!(address_line_override(1, 4), (0b001, 1));
    }

    #[test]
    fn next_reset_applies_once() {
        let mut mgr = BankManager::new();
        mgr.set_next_reset(3).unwrap();
        assert_eq!(mgr.take_next_reset(), Some(3));
        assert_eq!(mgr.take_next_reset(), None);
    }

    #[test]
    fn long_reset_wraps() {
        let mut mgr = BankManager::new();
        mgr.set_long_reset_sequence(&[0, 2, 4, NO_BANK]).unwrap();
        mgr.current = 4;
        assert_eq!(mgr.long_reset_advance(), Some(0));
        mgr.current = 0;
        assert_eq!(mgr.long_reset_advance(), Some(2));
    }

    #[test]
    fn long_reset_rejects_non_start_bank() {
        let mut mgr = BankManager::new();
        mgr.set_merge_byte(1, Merge { width: 2, position: 1 }.to_byte()).unwrap();
        assert_eq!(
            mgr.set_long_reset_sequence(&[0, 1]),
            Err(BankError::NotAStartBank)
        );
    }
}
