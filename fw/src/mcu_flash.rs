//! [`drv_config::InternalFlash`] over the STM32F103's own program flash.
//!
//! The STM32F1 flash controller programs in 16-bit half-words and erases in
//! 1 KiB pages. The config region reserved in `memory.x` (`CONFIG`, 8 KiB)
//! is carved into 8 such pages; [`McuFlash::erase_region`] walks all of
//! them.
use drv_config::{ConfigError, InternalFlash};
use stm32f1::stm32f103::FLASH;

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;
const PAGE_SIZE: usize = 1024;

/// Base address of the config region, published by the linker script as
/// `_config_region_start`.
extern "C" {
    static _config_region_start: u32;
    static _config_region_len: u32;
}

pub struct McuFlash {
    flash: FLASH,
}

impl McuFlash {
    pub fn new(flash: FLASH) -> Self {
        McuFlash { flash }
    }

    fn base(&self) -> usize {
        unsafe { &_config_region_start as *const u32 as usize }
    }

    fn region_len(&self) -> usize {
        unsafe { &_config_region_len as *const u32 as usize }
    }

    fn unlock(&self) {
        if self.flash.cr.read().lock().bit_is_set() {
            self.flash.keyr.write(|w| unsafe { w.bits(FLASH_KEY1) });
            self.flash.keyr.write(|w| unsafe { w.bits(FLASH_KEY2) });
        }
    }

    fn lock(&self) {
        self.flash.cr.modify(|_, w| w.lock().set_bit());
    }

    fn wait_ready(&self) {
        while self.flash.sr.read().bsy().bit_is_set() {}
    }

    fn erase_page(&self, page_addr: u32) -> Result<(), ConfigError> {
        self.wait_ready();
        self.flash.cr.modify(|_, w| w.per().set_bit());
        self.flash.ar.write(|w| unsafe { w.bits(page_addr) });
        self.flash.cr.modify(|_, w| w.strt().set_bit());
        self.wait_ready();
        self.flash.cr.modify(|_, w| w.per().clear_bit());
        if self.flash.sr.read().wrprterr().bit_is_set() || self.flash.sr.read().pgerr().bit_is_set() {
            self.flash.sr.modify(|_, w| w.wrprterr().clear_bit().pgerr().clear_bit());
            return Err(ConfigError::EraseFailed);
        }
        Ok(())
    }

    fn program_halfword(&self, addr: u32, half: u16) -> Result<(), ConfigError> {
        self.wait_ready();
        self.flash.cr.modify(|_, w| w.pg().set_bit());
        unsafe {
            core::ptr::write_volatile(addr as *mut u16, half);
        }
        self.wait_ready();
        self.flash.cr.modify(|_, w| w.pg().clear_bit());
        if self.flash.sr.read().wrprterr().bit_is_set() || self.flash.sr.read().pgerr().bit_is_set() {
            self.flash.sr.modify(|_, w| w.wrprterr().clear_bit().pgerr().clear_bit());
            return Err(ConfigError::WriteFailed);
        }
        Ok(())
    }
}

impl InternalFlash for McuFlash {
    fn read(&self, offset: usize, buf: &mut [u8]) {
        let base = self.base() + offset;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = unsafe { core::ptr::read_volatile((base + i) as *const u8) };
        }
    }

    /// Programs `data` at `offset`, a half-word at a time. `program` can
    /// only clear bits (the region must already be erased or the bytes
    /// already zero there) -- the same constraint [`drv_config`] assumes of
    /// any `InternalFlash` implementer.
    fn program(&mut self, offset: usize, data: &[u8]) -> Result<(), ConfigError> {
        self.unlock();
        let base = self.base() + offset;
        let mut i = 0;
        while i < data.len() {
            let addr = (base + i) as u32;
            let half = if i + 1 < data.len() {
                u16::from_le_bytes([data[i], data[i + 1]])
            } else {
                // Odd trailing byte: preserve the other half-word's current
                // high byte rather than clobbering it with 0xFF.
                let existing_hi = unsafe { core::ptr::read_volatile((addr + 1) as *const u8) };
                u16::from_le_bytes([data[i], existing_hi])
            };
            self.program_halfword(addr, half)?;
            i += 2;
        }
        self.lock();
        Ok(())
    }

    fn erase_region(&mut self) -> Result<(), ConfigError> {
        self.unlock();
        let base = self.base() as u32;
        let len = self.region_len();
        let mut result = Ok(());
        for page in 0..(len / PAGE_SIZE) {
            if let Err(e) = self.erase_page(base + (page * PAGE_SIZE) as u32) {
                result = Err(e);
                break;
            }
        }
        self.lock();
        result
    }
}
