#![no_std]
#![no_main]

mod drive;
mod floppy;
mod index;
mod testmode;
mod usb;

use cortex_m_rt::entry;
use panic_rtt_target as _;
use rtt_target::{rprintln, rtt_init_print};

use flux_probe_bsp as bsp;
use flux_probe_core::TimCnt;

pub const FW_MAJOR: u8 = 1;
pub const FW_MINOR: u8 = 0;
pub const GIT_VERSION: &str = git_version::git_version!(fallback = "unknown");

/// Bulk endpoint maximum packet size at high speed.
pub const USB_HS_MPS: u16 = 512;

/// Host-facing transfer ring: 128 KiB, power of two.
pub const U_BUF_SZ: u32 = 128 * 1024;

/// Timer-sample ring shared with the DMA engine.
pub const DMA_RING_LEN: usize = 512;

static mut U_BUF: [u8; U_BUF_SZ as usize] = [0; U_BUF_SZ as usize];
static mut DMA_RING: [TimCnt; DMA_RING_LEN] = [0; DMA_RING_LEN];

#[entry]
fn main() -> ! {
    rtt_init_print!();

    let mut cp = cortex_m::Peripherals::take().unwrap();

    let rcc = bsp::rcc::RCC::new(stm32ral::rcc::RCC::take().unwrap());

    // Configure system clock: the sample timers need the 72MHz grade.
    let clocks = unsafe { rcc.setup(bsp::rcc::CoreFrequency::F72MHz) };

    let clock = bsp::clock::Clock::new(cp.DWT, &mut cp.DCB);

    let delay = bsp::delay::Delay::new(stm32ral::syst::SYST::take().unwrap());
    delay.set_sysclk(&clocks);

    let gpioa = bsp::gpio::GPIO::new(stm32ral::gpio::GPIOA::take().unwrap());
    let gpiob = bsp::gpio::GPIO::new(stm32ral::gpio::GPIOB::take().unwrap());
    let gpioc = bsp::gpio::GPIO::new(stm32ral::gpio::GPIOC::take().unwrap());
    let gpioe = bsp::gpio::GPIO::new(stm32ral::gpio::GPIOE::take().unwrap());

    let pins = bsp::gpio::Pins {
        led: gpiob.pin(13),
        index: gpiob.pin(2),
        trk0: gpioa.pin(3),
        wrprot: gpioa.pin(1),
        dir: gpioc.pin(4),
        step: gpioa.pin(7),
        wgate: gpioa.pin(6),
        head: gpioc.pin(3),
        wdata: gpioa.pin(2),
        rdata: gpioa.pin(0),
        trk0_disable: gpioc.pin(1),
        pin34: gpioc.pin(2),
        user_pins: [
            bsp::gpio::UserPin { pin_id: 2, pin: gpiob.pin(12) },
            bsp::gpio::UserPin { pin_id: 4, pin: gpioe.pin(15) },
            bsp::gpio::UserPin { pin_id: 6, pin: gpioe.pin(14) },
            bsp::gpio::UserPin { pin_id: 10, pin: gpiob.pin(1) },
            bsp::gpio::UserPin { pin_id: 12, pin: gpiob.pin(0) },
            bsp::gpio::UserPin { pin_id: 14, pin: gpiob.pin(11) },
            bsp::gpio::UserPin { pin_id: 16, pin: gpiob.pin(10) },
        ],
    };
    pins.setup();

    let dma = bsp::dma::DMA::new(stm32ral::dma::DMA1::take().unwrap());
    dma.setup();

    let mut tim = bsp::tim::SampleTimer::new(stm32ral::tim2::TIM2::take().unwrap());
    tim.set_base_clock(&clocks);

    let exti = bsp::exti::Exti::new(
        stm32ral::exti::EXTI::take().unwrap(),
        stm32ral::syscfg::SYSCFG::take().unwrap(),
    );
    index::setup(&exti);

    let flash = bsp::flash::Flash::new(stm32ral::flash::FLASH::take().unwrap());

    let mut usb = usb::USB::new(
        stm32ral::usbphyc::USBPHYC::take().unwrap(),
        stm32ral::otg_hs_global::OTG_HS_GLOBAL::take().unwrap(),
        stm32ral::otg_hs_device::OTG_HS_DEVICE::take().unwrap(),
        stm32ral::otg_hs_pwrclk::OTG_HS_PWRCLK::take().unwrap(),
    );
    let serial = stm32_device_signature::device_id_hex();
    usb.setup(&clocks, serial);

    let mut floppy = floppy::Floppy::new(
        &pins,
        &delay,
        &clock,
        &dma,
        &tim,
        &flash,
        unsafe { &mut U_BUF },
        unsafe { &mut DMA_RING },
    );

    rprintln!("** Flux Probe v{}.{} ({})", FW_MAJOR, FW_MINOR, GIT_VERSION);

    loop {
        // The two workers alternate, one bounded slice of work each.
        match usb.poll() {
            Some(usb::Event::Configured) => floppy.on_usb_configured(),
            Some(usb::Event::Deconfigured) => floppy.on_usb_reset(),
            None => {}
        }
        floppy.process(&mut usb);
    }
}
