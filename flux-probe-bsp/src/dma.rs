// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

use stm32ral::dma;
use stm32ral::{modify_reg, read_reg, write_reg};

use crate::tim::SampleTimer;

/*
RDATA capture: DMA1, stream 5, channel 3 (TIM2_CH1), peripheral-to-memory
WDATA reload:  DMA1, stream 1, channel 3 (TIM2_UP), memory-to-peripheral

Both run circular over the shared sample ring; software tracks the hardware
position through NDTR only.
*/

pub struct DMA {
    dma1: dma::Instance,
}

impl DMA {
    pub fn new(dma1: dma::Instance) -> Self {
        DMA { dma1 }
    }

    /// Static stream configuration. Peripheral addresses never change;
    /// memory addresses and lengths are set per transfer.
    pub fn setup(&self) {
        // Stream 5, channel 3: TIM2_CH1 capture into the sample ring.
        write_reg!(
            dma,
            self.dma1,
            CR5,
            CHSEL: 3,
            PL: High,
            MSIZE: Bits32,
            PSIZE: Bits32,
            MINC: Incremented,
            PINC: Fixed,
            CIRC: Enabled,
            DIR: PeripheralToMemory,
            EN: Disabled
        );
        write_reg!(dma, self.dma1, PAR5, SampleTimer::ccr1_addr());

        // Stream 1, channel 3: sample ring into TIM2_ARR.
        write_reg!(
            dma,
            self.dma1,
            CR1,
            CHSEL: 3,
            PL: High,
            MSIZE: Bits32,
            PSIZE: Bits32,
            MINC: Incremented,
            PINC: Fixed,
            CIRC: Enabled,
            DIR: MemoryToPeripheral,
            EN: Disabled
        );
        write_reg!(dma, self.dma1, PAR1, SampleTimer::arr_addr());
    }

    /// Start capturing RDATA samples into `ring`.
    pub fn rdata_start(&self, ring: &mut [u32]) {
        write_reg!(
            dma,
            self.dma1,
            HIFCR,
            CTCIF5: Clear,
            CHTIF5: Clear,
            CTEIF5: Clear,
            CDMEIF5: Clear,
            CFEIF5: Clear
        );
        write_reg!(dma, self.dma1, NDTR5, ring.len() as u32);
        write_reg!(dma, self.dma1, M0AR5, ring.as_mut_ptr() as u32);
        modify_reg!(dma, self.dma1, CR5, EN: Enabled);
    }

    /// Start feeding WDATA periods from `ring`. The caller pre-fills the
    /// ring and triggers a timer update before enabling the counter, so the
    /// first period is deterministic.
    pub fn wdata_start(&self, ring: &[u32]) {
        write_reg!(
            dma,
            self.dma1,
            LIFCR,
            CTCIF1: Clear,
            CHTIF1: Clear,
            CTEIF1: Clear,
            CDMEIF1: Clear,
            CFEIF1: Clear
        );
        write_reg!(dma, self.dma1, NDTR1, ring.len() as u32);
        write_reg!(dma, self.dma1, M0AR1, ring.as_ptr() as u32);
        // Ensure the ring contents hit RAM before the stream starts.
        cortex_m::asm::dsb();
        modify_reg!(dma, self.dma1, CR1, EN: Enabled);
    }

    /// Remaining-transfer counts. The hardware's ring position is
    /// `(len - ndtr) mod len`; a stale-by-one read is tolerated because the
    /// producer/consumer rules always leave a guard slot.
    pub fn rdata_ndtr(&self) -> usize {
        read_reg!(dma, self.dma1, NDTR5) as usize
    }

    pub fn wdata_ndtr(&self) -> usize {
        read_reg!(dma, self.dma1, NDTR1) as usize
    }

    /// Stop both streams and wait for the engine to release them.
    pub fn stop(&self) {
        modify_reg!(dma, self.dma1, CR5, EN: Disabled);
        modify_reg!(dma, self.dma1, CR1, EN: Disabled);
        while read_reg!(dma, self.dma1, CR5, EN == Enabled)
            || read_reg!(dma, self.dma1, CR1, EN == Enabled)
        {}
    }
}
