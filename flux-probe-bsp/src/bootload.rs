// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

#![allow(clippy::unreadable_literal)]

use stm32ral::{modify_reg, scb};

/// Reserved RAM word shared with the bootloader, at the top of DTCM. The
/// bootloader checks it on every reset and stays resident to accept an
/// update when it holds the magic value.
const RESET_FLAG: *mut u32 = 0x2000_fff0 as *mut u32;
const FLAG_VALUE: u32 = 0xDEADBEEF;

/// Call this function to reset into the update bootloader.
pub fn bootload() -> ! {
    unsafe {
        core::ptr::write_volatile(RESET_FLAG, FLAG_VALUE);

        // Request system reset
        modify_reg!(scb, SCB, AIRCR, VECTKEYSTAT: 0x05FA, SYSRESETREQ: 1);
    }

    // Wait for reset
    loop {
        cortex_m::asm::nop();
    }
}
