//! Command table: one handler per opcode, translating a parsed in-band
//! frame into flash/bank/config/mailbox operations and a reply.
//!
//! Every handler ends by calling the reply engine itself rather than
//! returning a value, since a reply is a hardware action (bus usurpation)
//! and some opcodes legitimately send more than one reply segment.
use heapless::Vec;
use ks_proto::{
    crc32, crc32_reversed, BankSetFlags, ClockFlags, MsgBufFlags, MsgLockFlags, Opcode,
    ReplyFlags, Status, FRAME_MAGIC, MAX_PAYLOAD,
};
use num_traits::FromPrimitive;

use drv_framer::ParsedFrame;
use drv_mailbox::{Direction, MailboxError, Side};
use drv_reply::build_reply;

use crate::system::System;

/// Board identity word pair expected back from `ID`: a fixed build marker
/// and a feature-bits word (bit 0: mailbox present).
const ID_WORD_0: u32 = 0x1209_1610;
const ID_FEATURE_BITS: u32 = 0x0000_0001;

/// Largest `LOOPBACK` echo: magic(8) + len(2) + opcode(2) + payload + pad(1)
/// + crc(4).
const LOOPBACK_CAP: usize = 8 + 2 + 2 + MAX_PAYLOAD + 1 + 4;

/// Largest `MSG_RECEIVE` reply: the frame's own opcode plus its payload.
const MSG_RECEIVE_REPLY_CAP: usize = MAX_PAYLOAD + 2;

/// Largest word count a single `FLASH_READ`/`FLASH_WRITE` request covers.
const MAX_FLASH_WORDS: usize = 256;
const MAX_FLASH_BYTES: usize = MAX_FLASH_WORDS * 4;

fn send_framed(sys: &mut System, status: Status, payload: &[u8]) {
    if let Ok(words) = build_reply(false, status, &[payload]) {
        let mode = sys.flash.mode();
        let _ = sys.reply.send(&words, mode, ReplyFlags::empty(), &mut sys.addr_lo_dma, &mut sys.addr_hi_dma);
    }
}

fn send_raw(sys: &mut System, payload: &[u8], with_write_enable: bool) {
    let flags = if with_write_enable {
        ReplyFlags::RAW | ReplyFlags::WITH_WRITE_ENABLE
    } else {
        ReplyFlags::RAW
    };
    if let Ok(words) = build_reply(true, Status::Ok, &[payload]) {
        let mode = sys.flash.mode();
        let _ = sys.reply.send(&words, mode, flags, &mut sys.addr_lo_dma, &mut sys.addr_hi_dma);
    }
}

/// Entry point called from the foreground loop once the framer has
/// produced a dispatchable frame.
pub fn dispatch(sys: &mut System, frame: &ParsedFrame) {
    if frame.declared_len > MAX_PAYLOAD {
        send_framed(sys, Status::BadLength, &[]);
        return;
    }

    match Opcode::from_u8(frame.opcode) {
        Some(Opcode::Nop) => send_framed(sys, Status::Ok, &[]),
        Some(Opcode::Id) => handle_id(sys),
        Some(Opcode::Uptime) => handle_uptime(sys),
        Some(Opcode::TestPattern) => handle_test_pattern(sys),
        Some(Opcode::Loopback) => handle_loopback(sys, frame),
        Some(Opcode::FlashRead) => handle_flash_read(sys, &frame.payload),
        Some(Opcode::FlashId) => handle_flash_id(sys),
        Some(Opcode::FlashWrite) => handle_flash_write(sys, &frame.payload),
        Some(Opcode::FlashErase) => handle_flash_erase(sys, &frame.payload),
        Some(Opcode::BankInfo) => handle_bank_info(sys, &frame.payload),
        Some(Opcode::BankSet) => handle_bank_set(sys, frame.flags, &frame.payload),
        Some(Opcode::BankMerge) => handle_bank_merge(sys, &frame.payload),
        Some(Opcode::BankName) => handle_bank_name(sys, &frame.payload),
        Some(Opcode::BankLongReset) => handle_bank_long_reset(sys, &frame.payload),
        Some(Opcode::MsgInfo) => handle_msg_info(sys, &frame.payload),
        Some(Opcode::MsgSend) => handle_msg_send(sys, frame.flags, &frame.payload),
        Some(Opcode::MsgReceive) => handle_msg_receive(sys, frame.flags),
        Some(Opcode::MsgLock) => handle_msg_lock(sys, frame.flags, &frame.payload),
        Some(Opcode::Clock) => handle_clock(sys, frame.flags, &frame.payload),
        None => send_framed(sys, Status::UnknownCommand, &[]),
    }
}

/// Called from the foreground loop (or ISR, per the spec's error-handling
/// design) whenever the framer reports a CRC mismatch.
pub fn handle_crc_error(sys: &mut System) {
    send_framed(sys, Status::Crc, &[]);
}

fn handle_id(sys: &mut System) {
    let mut payload = [0u8; 20];
    payload[0..4].copy_from_slice(&ID_WORD_0.to_be_bytes());
    payload[4..8].copy_from_slice(&ID_FEATURE_BITS.to_be_bytes());
    send_framed(sys, Status::Ok, &payload);
}

fn handle_uptime(sys: &mut System) {
    let us = drv_timing::uptime_us(&sys.clock);
    send_framed(sys, Status::Ok, &us.to_be_bytes());
}

fn handle_test_pattern(sys: &mut System) {
    let mut payload = [0u8; 28 * 4];
    for (i, chunk) in payload.chunks_mut(4).enumerate() {
        chunk.copy_from_slice(&(i as u32).to_be_bytes());
    }
    send_framed(sys, Status::Ok, &payload);
}

fn handle_loopback(sys: &mut System, frame: &ParsedFrame) {
    // Reconstruct the exact wire bytes of the frame as the host sent it and
    // clock them back unchanged, including its own magic/length/opcode/CRC.
    let mut bytes: Vec<u8, LOOPBACK_CAP> = Vec::new();
    for &w in &FRAME_MAGIC {
        let _ = bytes.extend_from_slice(&w.to_le_bytes());
    }
    let len_word = frame.declared_len as u16;
    let opcode_word = (frame.opcode as u16) | ((frame.flags as u16) << 8);
    let _ = bytes.extend_from_slice(&len_word.to_le_bytes());
    let _ = bytes.extend_from_slice(&opcode_word.to_le_bytes());

    let mut crc = 0u32;
    crc = crc32_reversed(crc, &len_word.to_le_bytes());
    crc = crc32_reversed(crc, &opcode_word.to_le_bytes());

    let data_start = bytes.len();
    let _ = bytes.extend_from_slice(&frame.payload);
    if frame.payload.len() % 2 == 1 {
        let _ = bytes.push(0);
    }
    for chunk in bytes[data_start..].chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_le_bytes([chunk[0], chunk[1]])
        } else {
            chunk[0] as u16
        };
        crc = crc32(crc, &word.to_le_bytes());
    }

    let _ = bytes.extend_from_slice(&(crc >> 16).to_le_bytes());
    let _ = bytes.extend_from_slice(&(crc & 0xFFFF).to_le_bytes());

    send_raw(sys, &bytes, false);
}

/// Parses a `(addr: u32, len: u16)` pair, big-endian, common to the flash
/// opcodes.
fn parse_addr_len(payload: &[u8]) -> Option<(u32, u16)> {
    if payload.len() < 6 {
        return None;
    }
    let addr = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let len = u16::from_be_bytes([payload[4], payload[5]]);
    Some((addr, len))
}

fn handle_flash_read(sys: &mut System, payload: &[u8]) {
    let Some((addr, len)) = parse_addr_len(payload) else {
        send_framed(sys, Status::BadLength, &[]);
        return;
    };
    if len as usize > MAX_FLASH_WORDS {
        send_framed(sys, Status::BadArg, &[]);
        return;
    }
    let mut words = [0u32; MAX_FLASH_WORDS];
    sys.flash.read(addr, &mut words[..len as usize]);

    let mut meta = [0u8; 6];
    meta[0..4].copy_from_slice(&addr.to_be_bytes());
    meta[4..6].copy_from_slice(&len.to_be_bytes());
    send_framed(sys, Status::Ok, &meta);

    let mut data: Vec<u8, MAX_FLASH_BYTES> = Vec::new();
    for w in &words[..len as usize] {
        let _ = data.extend_from_slice(&w.to_le_bytes());
    }
    send_raw(sys, &data, false);
}

fn handle_flash_id(sys: &mut System) {
    let (part1, part2) = sys.flash.id();
    let mut payload = [0u8; 8];
    payload[0..4].copy_from_slice(&part1.to_be_bytes());
    payload[4..8].copy_from_slice(&part2.to_be_bytes());
    send_framed(sys, Status::Ok, &payload);
}

fn handle_flash_write(sys: &mut System, payload: &[u8]) {
    let Some((addr, len)) = parse_addr_len(payload) else {
        send_framed(sys, Status::BadLength, &[]);
        return;
    };
    let data_bytes = &payload[6..];
    if data_bytes.len() < len as usize * 4 {
        send_framed(sys, Status::BadLength, &[]);
        return;
    }

    if len as usize > MAX_FLASH_WORDS {
        send_framed(sys, Status::BadArg, &[]);
        return;
    }
    let mut words = [0u32; MAX_FLASH_WORDS];
    for (i, slot) in words[..len as usize].iter_mut().enumerate() {
        let b = &data_bytes[i * 4..i * 4 + 4];
        *slot = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    }

    let result = drv_flash::program(&mut sys.flash, addr, &words[..len as usize]);
    let status = if result.is_ok() { Status::Ok } else { Status::Failure };
    let mut meta = [0u8; 6];
    meta[0..4].copy_from_slice(&addr.to_be_bytes());
    meta[4..6].copy_from_slice(&len.to_be_bytes());
    send_framed(sys, status, &meta);
    send_raw(sys, data_bytes, true);
}

fn handle_flash_erase(sys: &mut System, payload: &[u8]) {
    let Some((addr, len)) = parse_addr_len(payload) else {
        send_framed(sys, Status::BadLength, &[]);
        return;
    };
    let (part1, _) = sys.flash.id();
    let status = match drv_flash::geometry_for(part1) {
        Some(geometry) => {
            let result = drv_flash::erase(&mut sys.flash, drv_flash::EraseMode::Sector, geometry, addr, len as u32);
            if result.is_ok() { Status::Ok } else { Status::Failure }
        }
        None => Status::Failure,
    };
    let mut meta = [0u8; 6];
    meta[0..4].copy_from_slice(&addr.to_be_bytes());
    meta[4..6].copy_from_slice(&len.to_be_bytes());
    send_framed(sys, status, &meta);
}

fn handle_bank_info(sys: &mut System, payload: &[u8]) {
    let Some(&bank) = payload.first() else {
        send_framed(sys, Status::BadLength, &[]);
        return;
    };
    let Some(merge) = sys.bank.merge_byte(bank) else {
        send_framed(sys, Status::BadArg, &[]);
        return;
    };
    let name = sys.config.bank_name(bank).unwrap_or("");
    let mut reply: Vec<u8, 64> = Vec::new();
    let _ = reply.push(bank);
    let _ = reply.push(merge);
    let _ = reply.push(sys.bank.current());
    let _ = reply.push(sys.bank.power_on());
    let _ = reply.push(sys.bank.next_reset());
    let name_bytes = name.as_bytes();
    let _ = reply.push(name_bytes.len() as u8);
    let _ = reply.extend_from_slice(name_bytes);
    send_framed(sys, Status::Ok, &reply);
}

fn handle_bank_set(sys: &mut System, flags: u8, payload: &[u8]) {
    let Some(&bank) = payload.first() else {
        send_framed(sys, Status::BadLength, &[]);
        return;
    };
    let flags = BankSetFlags::from_bits_truncate(flags);
    let mut status = Status::Ok;

    if flags.contains(BankSetFlags::SET_CURRENT) || flags.contains(BankSetFlags::SET_TEMP) {
        if sys.bank.select(&mut sys.flash, bank).is_err() {
            status = Status::BadArg;
        } else {
            sys.config.set_current_bank(&sys.clock, bank);
        }
    }
    if flags.contains(BankSetFlags::UNSET_TEMP) {
        let power_on = sys.bank.power_on();
        let _ = sys.bank.select(&mut sys.flash, power_on);
    }
    if flags.contains(BankSetFlags::SET_RESET) {
        if sys.bank.set_next_reset(bank).is_err() {
            status = Status::BadArg;
        } else {
            sys.config.set_next_reset_bank(&sys.clock, bank);
        }
    }
    if flags.contains(BankSetFlags::SET_POWER_ON) {
        if sys.bank.set_power_on(bank).is_err() {
            status = Status::BadArg;
        } else {
            sys.config.set_power_on_bank(&sys.clock, bank);
        }
    }

    send_framed(sys, status, &[]);

    if flags.contains(BankSetFlags::REBOOT) {
        cortex_m::peripheral::SCB::sys_reset();
    }
}

fn handle_bank_merge(sys: &mut System, payload: &[u8]) {
    if payload.len() < 2 {
        send_framed(sys, Status::BadLength, &[]);
        return;
    }
    let start = payload[0];
    let width = payload[1];
    match drv_bank::merge_bytes(start, width) {
        Ok(bytes) => {
            for (i, &byte) in bytes.iter().enumerate() {
                let bank = start + i as u8;
                let _ = sys.bank.set_merge_byte(bank, byte);
                sys.config.set_bank_merge_byte(&sys.clock, bank, byte).ok();
            }
            send_framed(sys, Status::Ok, &bytes);
        }
        Err(_) => send_framed(sys, Status::BadArg, &[]),
    }
}

fn handle_bank_name(sys: &mut System, payload: &[u8]) {
    let Some((&bank, rest)) = payload.split_first() else {
        send_framed(sys, Status::BadLength, &[]);
        return;
    };
    let Ok(name) = core::str::from_utf8(rest) else {
        send_framed(sys, Status::BadArg, &[]);
        return;
    };
    match sys.config.set_bank_name(&sys.clock, bank, name) {
        Ok(()) => send_framed(sys, Status::Ok, &[]),
        Err(_) => send_framed(sys, Status::BadArg, &[]),
    }
}

fn handle_bank_long_reset(sys: &mut System, payload: &[u8]) {
    if payload.len() > drv_config::BANK_COUNT {
        send_framed(sys, Status::BadLength, &[]);
        return;
    }
    let mut seq = [drv_bank::NO_BANK; 8];
    seq[..payload.len()].copy_from_slice(payload);
    match sys.bank.set_long_reset_sequence(&seq) {
        Ok(()) => {
            sys.config.set_long_reset_sequence(&sys.clock, &seq);
            send_framed(sys, Status::Ok, &[]);
        }
        Err(_) => send_framed(sys, Status::BadArg, &[]),
    }
}

fn handle_msg_info(sys: &mut System, payload: &[u8]) {
    let direction = if payload.first().copied().unwrap_or(0) == 0 { Direction::AtoU } else { Direction::UtoA };
    let mut reply = [0u8; 8];
    reply[0..4].copy_from_slice(&(sys.mailbox.available(direction) as u32).to_be_bytes());
    reply[4..8].copy_from_slice(&(sys.mailbox.free(direction) as u32).to_be_bytes());
    send_framed(sys, Status::Ok, &reply);
}

fn handle_msg_send(sys: &mut System, flags: u8, payload: &[u8]) {
    if payload.len() < 2 {
        send_framed(sys, Status::BadLength, &[]);
        return;
    }
    let flags = MsgBufFlags::from_bits_truncate(flags);
    let direction = if flags.contains(MsgBufFlags::ALT_BUFFER) { Direction::AtoU } else { Direction::UtoA };
    let opcode = u16::from_be_bytes([payload[0], payload[1]]);
    match sys.mailbox.send(direction, opcode, &payload[2..]) {
        Ok(()) => send_framed(sys, Status::Ok, &[]),
        Err(MailboxError::QueueFull) => send_framed(sys, Status::Failure, &[]),
        Err(_) => send_framed(sys, Status::BadArg, &[]),
    }
}

fn handle_msg_receive(sys: &mut System, flags: u8) {
    let flags = MsgBufFlags::from_bits_truncate(flags);
    let direction = if flags.contains(MsgBufFlags::ALT_BUFFER) { Direction::UtoA } else { Direction::AtoU };
    match sys.mailbox.receive(Side::Host, direction) {
        Ok(frame) => {
            let mut reply: Vec<u8, MSG_RECEIVE_REPLY_CAP> = Vec::new();
            let _ = reply.extend_from_slice(&frame.opcode.to_be_bytes());
            let _ = reply.extend_from_slice(&frame.payload);
            send_framed(sys, Status::Ok, &reply);
        }
        Err(MailboxError::Locked) => send_framed(sys, Status::Locked, &[]),
        Err(MailboxError::NoData) => send_framed(sys, Status::NoData, &[]),
        Err(_) => send_framed(sys, Status::Failure, &[]),
    }
}

fn handle_msg_lock(sys: &mut System, flags: u8, payload: &[u8]) {
    let Some(&dir_byte) = payload.first() else {
        send_framed(sys, Status::BadLength, &[]);
        return;
    };
    let direction = if dir_byte == 0 { Direction::AtoU } else { Direction::UtoA };
    let flags = MsgLockFlags::from_bits_truncate(flags);
    if flags.contains(MsgLockFlags::UNLOCK) {
        sys.mailbox.unlock(Side::Host, direction);
    } else {
        sys.mailbox.lock(Side::Host, direction);
    }
    send_framed(sys, Status::Ok, &[]);
}

/// Wall-clock offset, seconds since the Unix epoch, tracked purely in RAM:
/// the board has no RTC backup domain of its own, so this resets to zero
/// every power cycle until a `CLOCK` set arrives.
static mut WALL_CLOCK_OFFSET_S: u32 = 0;
static mut WALL_CLOCK_SET: bool = false;

fn handle_clock(sys: &mut System, flags: u8, payload: &[u8]) {
    let flags = ClockFlags::from_bits_truncate(flags);
    if payload.len() >= 8 && (flags.contains(ClockFlags::SET) || flags.contains(ClockFlags::SET_IF_NOT_SET)) {
        let seconds = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        unsafe {
            let already_set = core::ptr::read_volatile(core::ptr::addr_of!(WALL_CLOCK_SET));
            if flags.contains(ClockFlags::SET) || !already_set {
                let uptime_s = (drv_timing::uptime_us(&sys.clock) / 1_000_000) as u32;
                core::ptr::write_volatile(core::ptr::addr_of_mut!(WALL_CLOCK_OFFSET_S), seconds.wrapping_sub(uptime_s));
                core::ptr::write_volatile(core::ptr::addr_of_mut!(WALL_CLOCK_SET), true);
            }
        }
    }

    let uptime_s = (drv_timing::uptime_us(&sys.clock) / 1_000_000) as u32;
    let offset = unsafe { core::ptr::read_volatile(core::ptr::addr_of!(WALL_CLOCK_OFFSET_S)) };
    let now = offset.wrapping_add(uptime_s);
    let mut reply = [0u8; 8];
    reply[0..4].copy_from_slice(&now.to_be_bytes());
    reply[4..8].copy_from_slice(&0u32.to_be_bytes());
    send_framed(sys, Status::Ok, &reply);
}
