//! Monotonic microsecond clock.
//!
//! The DWT cycle counter runs at the 72 MHz core clock, which equals the
//! sample rate, so one monotonic tick is one sample tick. The counter wraps
//! every ~59 seconds; all consumers compare timestamps by signed difference,
//! which tolerates wrap as long as compared values are within 2^31 ticks.

use cortex_m::peripheral::{DCB, DWT};

/// Monotonic clock rate in MHz. The RCC setup must produce this core clock.
pub const TIME_MHZ: u32 = 72;

/// Flux sample rate in MHz.
pub const SAMPLE_MHZ: u32 = 72;

pub struct Clock {
    _dwt: DWT,
}

impl Clock {
    /// Enable the cycle counter. Takes ownership of the DWT so nothing else
    /// can reconfigure it.
    pub fn new(mut dwt: DWT, dcb: &mut DCB) -> Self {
        dcb.enable_trace();
        dwt.enable_cycle_counter();
        Clock { _dwt: dwt }
    }

    #[inline(always)]
    pub fn now(&self) -> u32 {
        DWT::cycle_count()
    }
}

/// Free-standing read for interrupt context.
#[inline(always)]
pub fn now() -> u32 {
    DWT::cycle_count()
}
