use stm32ral::gpio;
use stm32ral::{modify_reg, read_reg, write_reg};

pub struct GPIO {
    p: gpio::Instance,
}

impl<'a> GPIO {
    pub fn new(p: gpio::Instance) -> Self {
        GPIO { p }
    }

    pub fn pin(&'a self, n: u8) -> Pin<'a> {
        assert!(n < 16);
        Pin { n, port: self }
    }

    #[inline(always)]
    pub fn set_high(&'a self, n: u8) -> &Self {
        write_reg!(gpio, self.p, BSRR, 1 << n);
        self
    }

    #[inline(always)]
    pub fn set_low(&'a self, n: u8) -> &Self {
        write_reg!(gpio, self.p, BSRR, 1 << (n + 16));
        self
    }

    #[inline]
    pub fn toggle(&'a self, n: u8) -> &Self {
        let pin = (read_reg!(gpio, self.p, IDR) >> n) & 1;
        if pin == 1 {
            self.set_low(n)
        } else {
            self.set_high(n)
        }
    }

    #[inline]
    pub fn set_mode(&'a self, n: u8, mode: u32) -> &Self {
        let offset = n * 2;
        let mask = 0b11 << offset;
        let val = (mode << offset) & mask;
        modify_reg!(gpio, self.p, MODER, |r| (r & !mask) | val);
        self
    }

    pub const fn memoise_mode(n: u8, mode: u32) -> MemoisedMode {
        let n = n & 0xF;
        let offset = n * 2;
        let mask = 0b11 << offset;
        let value = (mode << offset) & mask;
        MemoisedMode { mask: !mask, value }
    }

    #[inline]
    pub fn apply_memoised_mode(&'a self, mode: MemoisedMode) -> &Self {
        modify_reg!(gpio, self.p, MODER, |r| (r & mode.mask) | mode.value);
        self
    }

    #[inline]
    pub fn set_mode_input(&'a self, n: u8) -> &Self {
        self.set_mode(n, gpio::MODER::MODER0::RW::Input)
    }

    #[inline]
    pub fn set_mode_output(&'a self, n: u8) -> &Self {
        self.set_mode(n, gpio::MODER::MODER0::RW::Output)
    }

    pub const fn memoise_mode_output(n: u8) -> MemoisedMode {
        Self::memoise_mode(n, gpio::MODER::MODER0::RW::Output)
    }

    #[inline]
    pub fn set_mode_alternate(&'a self, n: u8) -> &Self {
        self.set_mode(n, gpio::MODER::MODER0::RW::Alternate)
    }

    pub const fn memoise_mode_alternate(n: u8) -> MemoisedMode {
        Self::memoise_mode(n, gpio::MODER::MODER0::RW::Alternate)
    }

    #[inline]
    pub fn set_otype(&'a self, n: u8, otype: u32) -> &Self {
        let offset = n;
        let mask = 0b1 << offset;
        let val = (otype << offset) & mask;
        modify_reg!(gpio, self.p, OTYPER, |r| (r & !mask) | val);
        self
    }

    #[inline]
    pub fn set_otype_opendrain(&'a self, n: u8) -> &Self {
        self.set_otype(n, gpio::OTYPER::OT0::RW::OpenDrain)
    }

    #[inline]
    pub fn set_otype_pushpull(&'a self, n: u8) -> &Self {
        self.set_otype(n, gpio::OTYPER::OT0::RW::PushPull)
    }

    #[inline]
    pub fn set_ospeed(&'a self, n: u8, ospeed: u32) -> &Self {
        let offset = n * 2;
        let mask = 0b11 << offset;
        let val = (ospeed << offset) & mask;
        modify_reg!(gpio, self.p, OSPEEDR, |r| (r & !mask) | val);
        self
    }

    #[inline]
    pub fn set_ospeed_low(&'a self, n: u8) -> &Self {
        self.set_ospeed(n, gpio::OSPEEDR::OSPEEDR0::RW::LowSpeed)
    }

    #[inline]
    pub fn set_ospeed_veryhigh(&'a self, n: u8) -> &Self {
        self.set_ospeed(n, gpio::OSPEEDR::OSPEEDR0::RW::VeryHighSpeed)
    }

    #[inline]
    pub fn set_af(&'a self, n: u8, af: u32) -> &Self {
        if n < 8 {
            let offset = n * 4;
            let mask = 0b1111 << offset;
            let val = (af << offset) & mask;
            modify_reg!(gpio, self.p, AFRL, |r| (r & !mask) | val);
        } else {
            let offset = (n - 8) * 4;
            let mask = 0b1111 << offset;
            let val = (af << offset) & mask;
            modify_reg!(gpio, self.p, AFRH, |r| (r & !mask) | val);
        }
        self
    }

    #[inline]
    pub fn set_pull(&'a self, n: u8, pull: u32) -> &Self {
        let offset = n * 2;
        let mask = 0b11 << offset;
        let val = (pull << offset) & mask;
        modify_reg!(gpio, self.p, PUPDR, |r| (r & !mask) | val);
        self
    }

    #[inline]
    pub fn set_pull_floating(&'a self, n: u8) -> &Self {
        self.set_pull(n, gpio::PUPDR::PUPDR0::RW::Floating)
    }

    #[inline]
    pub fn set_pull_up(&'a self, n: u8) -> &Self {
        self.set_pull(n, gpio::PUPDR::PUPDR0::RW::PullUp)
    }

    #[inline]
    pub fn get_pin_idr(&'a self, n: u8) -> u32 {
        (read_reg!(gpio, self.p, IDR) >> n) & 1
    }
}

/// Stores a pre-computed mask and value for quickly changing pin mode
#[derive(Copy, Clone)]
pub struct MemoisedMode {
    mask: u32,
    value: u32,
}

pub struct Pin<'a> {
    n: u8,
    port: &'a GPIO,
}

impl<'a> Pin<'a> {
    #[inline(always)]
    pub fn set_high(&self) -> &Self {
        self.port.set_high(self.n);
        self
    }

    #[inline(always)]
    pub fn set_low(&self) -> &Self {
        self.port.set_low(self.n);
        self
    }

    #[inline(always)]
    pub fn set_bool(&self, state: bool) {
        match state {
            false => self.set_low(),
            true => self.set_high(),
        };
    }

    #[inline(always)]
    pub fn is_high(&self) -> bool {
        self.port.get_pin_idr(self.n) == 1
    }

    #[inline(always)]
    pub fn is_low(&self) -> bool {
        !self.is_high()
    }

    #[inline(always)]
    pub fn toggle(&'a self) -> &Self {
        self.port.toggle(self.n);
        self
    }

    #[inline]
    pub fn set_mode_input(&'a self) -> &Self {
        self.port.set_mode_input(self.n);
        self
    }

    #[inline]
    pub fn set_mode_output(&'a self) -> &Self {
        self.port.set_mode_output(self.n);
        self
    }

    #[inline]
    pub fn set_mode_alternate(&'a self) -> &Self {
        self.port.set_mode_alternate(self.n);
        self
    }

    pub fn memoise_mode_output(&'a self) -> MemoisedMode {
        GPIO::memoise_mode_output(self.n)
    }

    pub fn memoise_mode_alternate(&'a self) -> MemoisedMode {
        GPIO::memoise_mode_alternate(self.n)
    }

    #[inline]
    pub fn apply_memoised_mode(&'a self, mode: MemoisedMode) -> &Self {
        self.port.apply_memoised_mode(mode);
        self
    }

    #[inline]
    pub fn set_otype_opendrain(&'a self) -> &Self {
        self.port.set_otype_opendrain(self.n);
        self
    }

    #[inline]
    pub fn set_otype_pushpull(&'a self) -> &Self {
        self.port.set_otype_pushpull(self.n);
        self
    }

    #[inline]
    pub fn set_ospeed_low(&'a self) -> &Self {
        self.port.set_ospeed_low(self.n);
        self
    }

    #[inline]
    pub fn set_ospeed_veryhigh(&'a self) -> &Self {
        self.port.set_ospeed_veryhigh(self.n);
        self
    }

    #[inline]
    pub fn set_af(&'a self, af: u32) -> &Self {
        self.port.set_af(self.n, af);
        self
    }

    #[inline]
    pub fn set_pull_floating(&'a self) -> &Self {
        self.port.set_pull_floating(self.n);
        self
    }

    #[inline]
    pub fn set_pull_up(&'a self) -> &Self {
        self.port.set_pull_up(self.n);
        self
    }
}

/// A bus-number-to-GPIO mapping for one host-controllable output line.
///
/// The floppy bus's select and motor lines are plain outputs driven by
/// command, so they are listed by their bus pin number rather than wired
/// into the drive logic.
pub struct UserPin<'a> {
    pub pin_id: u8,
    pub pin: Pin<'a>,
}

/// All floppy-interface and board pins.
///
/// The floppy bus is active-low: a signal is asserted by driving its pin
/// low. The raw level accessors below return electrical state; callers that
/// care about logical assertion invert.
pub struct Pins<'a> {
    /// Activity LED, active low.
    pub led: Pin<'a>,

    // Bus inputs.
    pub index: Pin<'a>,
    pub trk0: Pin<'a>,
    pub wrprot: Pin<'a>,

    // Bus outputs.
    pub dir: Pin<'a>,
    pub step: Pin<'a>,
    pub wgate: Pin<'a>,
    pub head: Pin<'a>,

    /// WDATA: timer output during writes, plain deasserted output otherwise.
    pub wdata: Pin<'a>,
    /// RDATA: timer capture input.
    pub rdata: Pin<'a>,

    /// Drives the flippy-drive TRK0 sensor disable line.
    pub trk0_disable: Pin<'a>,

    /// Pin 34 input line, externally pulled up on this board.
    pub pin34: Pin<'a>,

    /// Host-controllable bus lines (selects, motors, densel etc.),
    /// terminated by the board's table order.
    pub user_pins: [UserPin<'a>; 7],
}

impl<'a> Pins<'a> {
    /// Configure I/O pins
    pub fn setup(&self) {
        // Open-drain output to LED (active low).
        self.led
            .set_high()
            .set_otype_opendrain()
            .set_ospeed_low()
            .set_mode_output();

        // Bus inputs float; the bus has its own terminations.
        self.index.set_pull_floating().set_mode_input();
        self.trk0.set_pull_floating().set_mode_input();
        self.wrprot.set_pull_floating().set_mode_input();
        self.pin34.set_pull_floating().set_mode_input();

        // Bus outputs idle deasserted (high).
        for pin in [&self.dir, &self.step, &self.wgate, &self.head].iter() {
            pin.set_high()
                .set_otype_pushpull()
                .set_ospeed_low()
                .set_mode_output();
        }

        // WDATA idles as a deasserted plain output; the write path flips it
        // to the timer's alternate function for the duration of a write.
        self.wdata
            .set_high()
            .set_otype_pushpull()
            .set_ospeed_low()
            .set_af(1)
            .set_mode_output();

        // RDATA feeds the capture timer.
        self.rdata.set_af(1).set_pull_floating().set_mode_input();

        // Flippy TRK0-sensor disable: inactive (low).
        self.trk0_disable
            .set_low()
            .set_otype_pushpull()
            .set_ospeed_low()
            .set_mode_output();

        for upin in self.user_pins.iter() {
            upin.pin
                .set_high()
                .set_otype_pushpull()
                .set_ospeed_low()
                .set_mode_output();
        }
    }

    /// Look up a host-controllable line by bus pin number.
    pub fn user_pin(&self, pin_id: u8) -> Option<&Pin<'a>> {
        self.user_pins
            .iter()
            .find(|u| u.pin_id == pin_id)
            .map(|u| &u.pin)
    }

    /// Deassert every host-controllable line.
    pub fn reset_user_pins(&self) {
        for upin in self.user_pins.iter() {
            upin.pin.set_high();
        }
    }
}
