//! Parallel NOR flash driver: single-word bus primitives ([`low`]) plus
//! chip identification, geometry, and verified bulk program/erase
//! ([`high`]) for the board's MX29F1615-family flash pair.
#![cfg_attr(not(test), no_std)]

pub mod high;
pub mod low;

pub use high::{
    erase, erase_chip, erase_sectors, geometry_for, program, program_word,
    restore_address_lines, select_address_lines, verify_mismatch_is_recoverable, ChipGeometry,
    EraseMode, CHIP_TABLE,
};
pub use low::{FlashBus, FlashError, FlashMode, FlashPins, OverrideOp, OverrideState};
