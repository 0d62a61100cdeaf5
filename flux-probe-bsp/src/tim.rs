//! The flux sample timer (TIM2).
//!
//! One 32-bit timer serves both transfer directions, clocked at the 72 MHz
//! sample rate. For reads, channel 1 captures the counter on every falling
//! RDATA edge and DMA drains the captures into a ring. For writes, channel 3
//! runs in PWM mode 1 emitting a fixed-width low pulse per period, and DMA
//! feeds successive periods into ARR, so the stored samples directly set the
//! spacing of WDATA pulses.

use stm32ral::tim2;
use stm32ral::{read_reg, write_reg};

use crate::rcc::Clocks;

const CR1_CEN: u32 = 1 << 0;
const DIER_UDE: u32 = 1 << 8;
const DIER_CC1DE: u32 = 1 << 9;
const EGR_UG: u32 = 1 << 0;
const CCER_CC1E: u32 = 1 << 0;
const CCER_CC1P: u32 = 1 << 1;
const CCER_CC3E: u32 = 1 << 8;
const CCER_CC3P: u32 = 1 << 9;
/// CC1S = 01: channel 1 is an input mapped on TI1.
const CCMR1_CC1S_TI1: u32 = 0x0001;
/// CC3S = 00 (output), OC3M = 110 (PWM mode 1).
const CCMR2_OC3_PWM1: u32 = 0x0060;

const CCR1_OFFSET: u32 = 0x34;
const ARR_OFFSET: u32 = 0x2c;

/// Fixed width of the generated WDATA pulse, in sample ticks (400 ns).
const WDATA_PULSE: u32 = (400 * crate::clock::SAMPLE_MHZ) / 1000;

pub struct SampleTimer {
    tim: tim2::Instance,
    psc: u32,
}

impl SampleTimer {
    pub fn new(tim: tim2::Instance) -> Self {
        SampleTimer { tim, psc: 0 }
    }

    /// Derive the prescaler dividing the timer clock down to the sample
    /// rate. Must be called before either prep function.
    pub fn set_base_clock(&mut self, clocks: &Clocks) {
        let timclk = clocks.timclk1();
        self.psc = timclk / (crate::clock::SAMPLE_MHZ * 1_000_000) - 1;
    }

    /// Configure channel 1 input capture for the read path. The counter
    /// spans the full 32-bit range; captures go out via the CC1 DMA request.
    pub fn rdata_prep(&self) {
        write_reg!(tim2, self.tim, PSC, self.psc);
        write_reg!(tim2, self.tim, ARR, 0xffff_ffff);
        write_reg!(tim2, self.tim, CCMR1, CCMR1_CC1S_TI1);
        write_reg!(tim2, self.tim, DIER, DIER_CC1DE);
        write_reg!(tim2, self.tim, CR2, 0);
        // Load PSC/ARR, then discard the spurious update flag.
        write_reg!(tim2, self.tim, EGR, EGR_UG);
        write_reg!(tim2, self.tim, SR, 0);
    }

    /// Arm channel 1 capture on the falling edge. Called after the capture
    /// DMA stream is running so no early edge raises an unserviced request.
    pub fn rdata_enable_capture(&self) {
        write_reg!(tim2, self.tim, CCER, CCER_CC1E | CCER_CC1P);
    }

    /// Configure channel 3 PWM for the write path: a 400 ns active-low
    /// pulse, then inactive until the counter reloads. Feeding ARR by DMA
    /// sets the pulse-to-pulse spacing.
    pub fn wdata_prep(&self) {
        write_reg!(tim2, self.tim, PSC, self.psc);
        write_reg!(tim2, self.tim, CCMR2, CCMR2_OC3_PWM1);
        // The floppy bus is active-low: invert the output.
        write_reg!(tim2, self.tim, CCER, CCER_CC3E | CCER_CC3P);
        write_reg!(tim2, self.tim, CCR3, WDATA_PULSE);
        write_reg!(tim2, self.tim, DIER, DIER_UDE);
        write_reg!(tim2, self.tim, CR2, 0);
    }

    /// Force an update event so the first DMA-loaded ARR value takes effect
    /// before the counter starts. The dummy SR write gives the hardware
    /// time to process the event.
    pub fn force_update(&self) {
        write_reg!(tim2, self.tim, EGR, EGR_UG);
        write_reg!(tim2, self.tim, SR, 0);
    }

    pub fn start(&self) {
        write_reg!(tim2, self.tim, CR1, CR1_CEN);
    }

    /// Disable the counter, its outputs and any pending DMA request.
    pub fn stop(&self) {
        write_reg!(tim2, self.tim, CCER, 0);
        write_reg!(tim2, self.tim, CR1, 0);
        write_reg!(tim2, self.tim, SR, 0);
    }

    #[inline(always)]
    pub fn cnt(&self) -> u32 {
        read_reg!(tim2, self.tim, CNT)
    }

    /// Peripheral address of CCR1, for the capture DMA stream.
    pub fn ccr1_addr() -> u32 {
        tim2::TIM2 as u32 + CCR1_OFFSET
    }

    /// Peripheral address of ARR, for the reload DMA stream.
    pub fn arr_addr() -> u32 {
        tim2::TIM2 as u32 + ARR_OFFSET
    }
}

/// Capture-counter read for contexts that cannot borrow the owned timer,
/// i.e. the index-pulse interrupt handler.
#[inline(always)]
pub fn rdata_cnt() -> u32 {
    let tim = unsafe { &*tim2::TIM2 };
    read_reg!(tim2, tim, CNT)
}
