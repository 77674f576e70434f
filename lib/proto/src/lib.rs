//! Wire types shared between the bus-capture framer, the reply engine, the
//! mailbox, and the command table.
//!
//! Both the in-band frame carried on the host's address bus and the framed
//! messages carried in the mailbox share one layout: a fixed magic, a
//! length, an opcode/status byte, a payload, and a trailing CRC-32. This
//! crate is the single place that knows the exact byte order of that
//! layout, so the framer, reply engine, and mailbox server can't drift out
//! of sync with each other.
#![no_std]

use crc::{Crc, CRC_32_ISO_HDLC};
use num_derive::FromPrimitive;

/// The four magic words that open every in-band frame, little-endian,
/// one per host strobe.
pub const FRAME_MAGIC: [u16; 4] = [0x0204, 0x1017, 0x0119, 0x0117];

/// The same magic, as the eight bytes carried at the head of a mailbox
/// frame.
pub const MAILBOX_MAGIC: [u8; 8] = [0x04, 0x02, 0x17, 0x10, 0x19, 0x01, 0x17, 0x01];

/// Largest payload (in bytes) the framer and reply engine will accept or
/// produce. Chosen so a full frame plus framing overhead fits comfortably in
/// one capture-ring wrap.
pub const MAX_PAYLOAD: usize = 1024;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the CRC-32 over a byte-reversed feed of `data`.
///
/// The host drives the low address bits in its own (big-endian-ish) word
/// order for the length and opcode fields, so the CRC must be fed those two
/// fields with each 16-bit word's bytes swapped to match. Payload bytes are
/// fed in their natural order via [`crc32`].
pub fn crc32_reversed(seed: u32, data: &[u8]) -> u32 {
    let mut digest = CRC.digest_with_initial(seed);
    let mut buf = [0u8; 2];
    for chunk in data.chunks(2) {
        match chunk.len() {
            2 => {
                buf[0] = chunk[1];
                buf[1] = chunk[0];
                digest.update(&buf);
            }
            1 => digest.update(chunk),
            _ => unreachable!(),
        }
    }
    digest.finalize()
}

/// Computes the CRC-32 over `data` in natural byte order, continuing from
/// `seed`.
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    let mut digest = CRC.digest_with_initial(seed);
    digest.update(data);
    digest.finalize()
}

/// Opcodes recognized by the command table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Id = 1,
    Uptime = 2,
    TestPattern = 3,
    Loopback = 4,
    FlashRead = 5,
    FlashId = 6,
    FlashWrite = 7,
    FlashErase = 8,
    BankInfo = 9,
    BankSet = 10,
    BankMerge = 11,
    BankName = 12,
    BankLongReset = 13,
    MsgInfo = 14,
    MsgSend = 15,
    MsgReceive = 16,
    MsgLock = 17,
    Clock = 18,
}

/// Status codes a handler returns in the opcode field of its reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Crc = 1,
    UnknownCommand = 2,
    BadLength = 3,
    BadArg = 4,
    NoData = 5,
    Locked = 6,
    Failure = 7,
}

bitflags::bitflags! {
    /// Flags carried in the high byte of the opcode/flags word of a
    /// `BANK_SET` request.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct BankSetFlags: u8 {
        const SET_CURRENT  = 0x01;
        const SET_TEMP     = 0x02;
        const UNSET_TEMP   = 0x04;
        const SET_RESET    = 0x08;
        const SET_POWER_ON = 0x10;
        const REBOOT       = 0x20;
    }
}

bitflags::bitflags! {
    /// Flags for `MSG_SEND` / `MSG_RECEIVE`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MsgBufFlags: u8 {
        const ALT_BUFFER = 0x01;
    }
}

bitflags::bitflags! {
    /// Flags for `MSG_LOCK`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MsgLockFlags: u8 {
        const UNLOCK = 0x01;
    }
}

bitflags::bitflags! {
    /// Flags for `CLOCK`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ClockFlags: u8 {
        const SET = 0x01;
        const SET_IF_NOT_SET = 0x02;
    }
}

bitflags::bitflags! {
    /// Flags the command table passes down to the reply engine describing
    /// how a reply should be framed and clocked out.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ReplyFlags: u8 {
        /// Omit magic/length/status/CRC framing; the payload chunks are the
        /// entire reply.
        const RAW = 0x01;
        /// Reroute the host's output-enable strobe to the flash's
        /// write-enable pin while this reply is in flight.
        const WITH_WRITE_ENABLE = 0x02;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_matches_mailbox_bytes() {
        let mut packed = [0u8; 8];
        for (i, w) in FRAME_MAGIC.iter().enumerate() {
            packed[i * 2] = (*w & 0xff) as u8;
            packed[i * 2 + 1] = (*w >> 8) as u8;
        }
        assert_eq!(packed, MAILBOX_MAGIC);
    }

    #[test]
    fn crc_is_order_sensitive() {
        let a = crc32(0, &[1, 2, 3, 4]);
        let b = crc32_reversed(0, &[1, 2, 3, 4]);
        assert_ne!(a, b);
        // crc32_reversed with pre-swapped input should equal crc32 direct.
        let c = crc32(0, &[2, 1, 4, 3]);
        assert_eq!(b, c);
    }

    #[test]
    fn bank_set_flags_compose() {
        let f = BankSetFlags::SET_CURRENT | BankSetFlags::SET_POWER_ON;
        assert!(f.contains(BankSetFlags::SET_CURRENT));
        assert!(f.contains(BankSetFlags::SET_POWER_ON));
        assert!(!f.contains(BankSetFlags::REBOOT));
    }
}
