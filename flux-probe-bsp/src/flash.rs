//! Flash programming for the bootloader-update path.
//!
//! The bootloader occupies the first flash sector; the running firmware
//! replaces it only after the staged image has passed its CRC, and verifies
//! the result afterwards.

use stm32ral::flash;
use stm32ral::{read_reg, write_reg};

pub const FLASH_BASE: u32 = 0x0800_0000;

/// The bootloader lives in sector 0 (16 KiB on this part).
pub const BOOTLOADER_SIZE: u32 = 16 * 1024;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xcdef_89ab;

const CR_PG: u32 = 1 << 0;
const CR_SER: u32 = 1 << 1;
const CR_SNB_SHIFT: u32 = 3;
/// PSIZE = 0b10: 32-bit parallelism.
const CR_PSIZE_X32: u32 = 0b10 << 8;
const CR_STRT: u32 = 1 << 16;
const CR_LOCK: u32 = 1 << 31;
const SR_BSY: u32 = 1 << 16;

pub struct Flash {
    flash: flash::Instance,
}

impl Flash {
    pub fn new(flash: flash::Instance) -> Self {
        Flash { flash }
    }

    fn wait_idle(&self) {
        while read_reg!(flash, self.flash, SR) & SR_BSY != 0 {}
    }

    pub fn unlock(&self) {
        write_reg!(flash, self.flash, KEYR, KEY1);
        write_reg!(flash, self.flash, KEYR, KEY2);
    }

    pub fn lock(&self) {
        write_reg!(flash, self.flash, CR, CR_LOCK);
    }

    pub fn erase_sector(&self, sector: u8) {
        self.wait_idle();
        write_reg!(
            flash,
            self.flash,
            CR,
            CR_SER | ((sector as u32) << CR_SNB_SHIFT) | CR_PSIZE_X32
        );
        write_reg!(
            flash,
            self.flash,
            CR,
            CR_SER | ((sector as u32) << CR_SNB_SHIFT) | CR_PSIZE_X32 | CR_STRT
        );
        self.wait_idle();
    }

    /// Program `data` (length a multiple of 4) at `addr`, word by word.
    pub fn program(&self, addr: u32, data: &[u8]) {
        self.wait_idle();
        write_reg!(flash, self.flash, CR, CR_PG | CR_PSIZE_X32);
        for (i, word) in data.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            let dst = (addr as usize + 4 * i) as *mut u32;
            unsafe { core::ptr::write_volatile(dst, value) };
            cortex_m::asm::dsb();
            self.wait_idle();
        }
        write_reg!(flash, self.flash, CR, 0);
    }

    /// Read back a programmed region for verification.
    pub fn read(addr: u32, len: usize) -> &'static [u8] {
        unsafe { core::slice::from_raw_parts(addr as *const u8, len) }
    }
}
