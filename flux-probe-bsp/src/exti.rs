//! External interrupt wiring for the INDEX pin (PB2, EXTI line 2).

use stm32ral::{exti, modify_reg, syscfg, write_reg};

/// EXTI line carrying the INDEX edge.
pub const INDEX_LINE: u32 = 2;

/// NVIC interrupt number of EXTI2 on this part.
pub const INDEX_IRQ: u16 = 8;

pub struct Exti {
    exti: exti::Instance,
    syscfg: syscfg::Instance,
}

impl Exti {
    pub fn new(exti: exti::Instance, syscfg: syscfg::Instance) -> Self {
        Exti { exti, syscfg }
    }

    /// Route PB2 to EXTI2 and arm the falling-edge trigger. Priority and
    /// NVIC enable are the caller's business.
    pub fn setup_index(&self) {
        // Map EXTI[3:0] onto port B.
        write_reg!(syscfg, self.syscfg, EXTICR1, 0x1111);
        write_reg!(exti, self.exti, RTSR, 0);
        write_reg!(exti, self.exti, FTSR, 1 << INDEX_LINE);
        modify_reg!(exti, self.exti, IMR, |r| r | (1 << INDEX_LINE));
    }
}

/// Acknowledge the INDEX edge from the interrupt handler.
#[inline(always)]
pub fn clear_index_pending() {
    let exti = unsafe { &*exti::EXTI };
    write_reg!(exti, exti, PR, 1 << INDEX_LINE);
}
