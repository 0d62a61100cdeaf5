//! INDEX pulse interrupt and the state it shares with the main loop.
//!
//! The EXTI2 handler is the only preemptive context in the firmware. The
//! detector state is multi-word, so both sides access it inside a
//! global-interrupt-disable critical section; the glitch mask is a single
//! word updated from the dispatcher and read by the handler, so it rides in
//! an atomic instead.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::interrupt::{self, Mutex};
use flux_probe_core::index::IndexDetector;
use flux_probe_core::time::time_ms;

static DETECTOR: Mutex<RefCell<IndexDetector>> = Mutex::new(RefCell::new(IndexDetector::new()));
static MASK_US: AtomicU32 = AtomicU32::new(200);

/// Stale-trigger refresh period; see `IndexDetector::refresh`.
pub const REFRESH_PERIOD: u32 = time_ms(5000);

const INDEX_IRQ_PRIO: u8 = 0x20;

/// Route the INDEX pin edge to EXTI2 and enable it in the NVIC.
pub fn setup(exti: &flux_probe_bsp::exti::Exti) {
    exti.setup_index();
    let irq = flux_probe_bsp::exti::INDEX_IRQ as usize;
    unsafe {
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        nvic.ipr[irq].write(INDEX_IRQ_PRIO);
        nvic.iser[irq / 32].write(1 << (irq % 32));
    }
}

pub fn count() -> u32 {
    interrupt::free(|cs| DETECTOR.borrow(cs).borrow().count)
}

pub fn reset_count() {
    interrupt::free(|cs| DETECTOR.borrow(cs).borrow_mut().count = 0);
}

/// Consistent `(count, rdata_cnt)` pair for the read-path encoder.
pub fn snapshot() -> (u32, u32) {
    interrupt::free(|cs| {
        let d = DETECTOR.borrow(cs).borrow();
        (d.count, d.rdata_cnt)
    })
}

pub fn set_hard_sector_ticks(ticks: u32) {
    interrupt::free(|cs| {
        DETECTOR
            .borrow(cs)
            .borrow_mut()
            .set_hard_sector_ticks(ticks)
    });
}

pub fn set_mask_us(us: u32) {
    MASK_US.store(us, Ordering::Relaxed);
}

/// Periodic trigger-time refresh, driven by a main-loop timer.
pub fn refresh(now: u32) {
    interrupt::free(|cs| {
        DETECTOR
            .borrow(cs)
            .borrow_mut()
            .refresh(now, REFRESH_PERIOD)
    });
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn EXTI2() {
    let cnt = flux_probe_bsp::tim::rdata_cnt();
    let now = flux_probe_bsp::clock::now();
    flux_probe_bsp::exti::clear_index_pending();

    let mask_us = MASK_US.load(Ordering::Relaxed);
    interrupt::free(|cs| {
        DETECTOR.borrow(cs).borrow_mut().pulse(now, cnt, mask_us);
    });
}
