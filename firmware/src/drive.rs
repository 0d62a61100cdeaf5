//! Drive selection, motor control and head positioning.
//!
//! The bus is active-low: asserting a signal drives its pin low. Output
//! levels are shadowed here so decisions (head already set, write gate
//! open) never need to read back a pin.

use flux_probe_bsp::delay::Delay;
use flux_probe_bsp::gpio::Pins;
use flux_probe_core::opdelay::{OpDelay, DELAY_READ, DELAY_SEEK, DELAY_WRITE};
use flux_probe_core::protocol::{
    Ack, BusType, DelayParams, DriveInfo, DF_CYL_VALID, DF_IS_FLIPPY, DF_MOTOR_ON,
};

pub const NR_UNITS: usize = 3;

#[derive(Copy, Clone, Default)]
pub struct Unit {
    pub cyl: i16,
    pub initialised: bool,
    pub is_flippy: bool,
    pub motor: bool,
}

pub struct Drive<'a> {
    pins: &'a Pins<'a>,
    delay: &'a Delay,
    clock: &'a flux_probe_bsp::clock::Clock,

    pub bus_type: BusType,
    pub unit_nr: i8,
    pub units: [Unit; NR_UNITS],

    // Shadow state of the bus output pins.
    pub dir: bool,
    pub step: bool,
    pub wgate: bool,
    pub head: bool,
}

/// Drive a bus output: asserted == electrically low.
fn write_bus(pin: &flux_probe_bsp::gpio::Pin, assert: bool) {
    pin.set_bool(!assert);
}

impl<'a> Drive<'a> {
    pub fn new(
        pins: &'a Pins<'a>,
        delay: &'a Delay,
        clock: &'a flux_probe_bsp::clock::Clock,
    ) -> Self {
        Drive {
            pins,
            delay,
            clock,
            bus_type: BusType::None,
            unit_nr: -1,
            units: [Unit::default(); NR_UNITS],
            dir: false,
            step: false,
            wgate: false,
            head: false,
        }
    }

    fn select_pin_id(&self, nr: u8) -> Option<u8> {
        match self.bus_type {
            BusType::Ibmpc => match nr {
                0 => Some(14),
                1 => Some(12),
                _ => None,
            },
            BusType::Shugart => match nr {
                0 => Some(10),
                1 => Some(12),
                2 => Some(14),
                _ => None,
            },
            BusType::None => None,
        }
    }

    pub fn deselect(&mut self) {
        if self.unit_nr < 0 {
            return;
        }
        if let Some(id) = self.select_pin_id(self.unit_nr as u8) {
            if let Some(pin) = self.pins.user_pin(id) {
                write_bus(pin, false);
            }
        }
        self.unit_nr = -1;
    }

    pub fn select(&mut self, nr: u8, dp: &DelayParams) -> Ack {
        if nr as i8 == self.unit_nr {
            return Ack::Okay;
        }

        self.deselect();

        if self.bus_type == BusType::None {
            return Ack::NoBus;
        }
        let pin = match self.select_pin_id(nr).and_then(|id| self.pins.user_pin(id)) {
            Some(pin) => pin,
            None => return Ack::BadUnit,
        };

        write_bus(pin, true);
        self.unit_nr = nr as i8;
        self.delay.delay_us(dp.select_delay as u32);

        Ack::Okay
    }

    pub fn motor(&mut self, mut nr: u8, on: bool, dp: &DelayParams) -> Ack {
        let pin_id;
        match self.bus_type {
            BusType::Ibmpc => {
                if nr >= 2 {
                    return Ack::BadUnit;
                }
                if self.units[nr as usize].motor == on {
                    return Ack::Okay;
                }
                pin_id = if nr == 0 { 10 } else { 16 };
            }
            BusType::Shugart => {
                if nr >= 3 {
                    return Ack::BadUnit;
                }
                // All shugart units share one motor line. Alias them all to
                // unit 0.
                nr = 0;
                if self.units[0].motor == on {
                    return Ack::Okay;
                }
                pin_id = 16;
            }
            BusType::None => return Ack::NoBus,
        }

        let pin = match self.pins.user_pin(pin_id) {
            Some(pin) => pin,
            None => return Ack::BadUnit,
        };
        write_bus(pin, on);

        self.units[nr as usize].motor = on;
        if on {
            self.delay.delay_ms(dp.motor_delay as u32);
        }

        Ack::Okay
    }

    /// Per-unit status for GET_INFO. A negative `nr` means the selected
    /// unit. The reported state always comes from the selected unit; the
    /// explicit `nr` only widens validation, matching long-standing host
    /// expectations.
    pub fn get_info(&self, nr: i16) -> Result<DriveInfo, Ack> {
        match self.bus_type {
            BusType::Ibmpc if nr >= 2 => return Err(Ack::BadUnit),
            BusType::Shugart if nr >= 3 => return Err(Ack::BadUnit),
            BusType::None => return Err(Ack::NoBus),
            _ => {}
        }
        if self.unit_nr < 0 {
            return Err(Ack::NoUnit);
        }

        let u = &self.units[self.unit_nr as usize];
        let mut flags = 0;
        if u.initialised {
            flags |= DF_CYL_VALID;
        }
        if u.motor {
            flags |= DF_MOTOR_ON;
        }
        if u.is_flippy {
            flags |= DF_IS_FLIPPY;
        }

        Ok(DriveInfo { flags, cyl: u.cyl })
    }

    pub fn trk0_asserted(&self) -> bool {
        self.pins.trk0.is_low()
    }

    pub fn wrprot_asserted(&self) -> bool {
        self.pins.wrprot.is_low()
    }

    pub fn set_wgate(&mut self, assert: bool) {
        write_bus(&self.pins.wgate, assert);
        self.wgate = assert;
    }

    pub fn set_head(&mut self, head: u8) {
        write_bus(&self.pins.head, head != 0);
        self.head = head != 0;
    }

    fn flippy_trk0_sensor(&self, disable: bool) {
        self.pins.trk0_disable.set_bool(disable);
        self.delay.delay_us(10);
    }

    fn flippy_detect(&self) -> bool {
        // With the sensor disabled a flippy-modified drive reads TRK0 high.
        self.flippy_trk0_sensor(true);
        let is_flippy = !self.trk0_asserted();
        self.flippy_trk0_sensor(false);
        is_flippy
    }

    fn step_dir_set(&mut self, inwards: bool) {
        write_bus(&self.pins.dir, inwards);
        self.dir = inwards;
        self.delay.delay_us(10);
    }

    fn step_once(&mut self, dp: &DelayParams) {
        write_bus(&self.pins.step, true);
        self.step = true;
        self.delay.delay_us(15);
        write_bus(&self.pins.step, false);
        self.step = false;
        self.delay.delay_us(dp.step_delay as u32);
    }

    /// Track-0 calibration: step outwards until TRK0 asserts, then, on a
    /// flippy drive, find real cylinder 1 with the sensor masked so the
    /// negative-cylinder region doesn't fool us.
    fn seek_initialise(&mut self, dp: &DelayParams) -> Ack {
        let unit = self.unit_nr as usize;

        self.step_dir_set(false);
        let mut found = false;
        for _ in 0..256 {
            if self.trk0_asserted() {
                found = true;
                break;
            }
            self.step_once(dp);
        }

        let rc = if !found {
            Ack::NoTrk0
        } else {
            self.units[unit].cyl = 0;
            self.units[unit].is_flippy = self.flippy_detect();

            if self.units[unit].is_flippy {
                // Trk0 sensor can be asserted at negative cylinder offsets.
                // Seek inwards until the sensor is deasserted.
                self.delay.delay_ms(dp.seek_settle as u32); // change of direction
                self.step_dir_set(true);
                for _ in 0..10 {
                    self.step_once(dp);
                    if !self.trk0_asserted() {
                        // We are now at real cylinder 1.
                        self.units[unit].cyl = 1;
                        break;
                    }
                }
            }

            if self.units[unit].is_flippy && self.units[unit].cyl != 1 {
                Ack::NoTrk0
            } else {
                self.units[unit].initialised = true;
                Ack::Okay
            }
        };

        self.delay.delay_ms(dp.seek_settle as u32);
        rc
    }

    pub fn seek(&mut self, cyl: i16, dp: &DelayParams, od: &mut OpDelay) -> Ack {
        if self.unit_nr < 0 {
            return Ack::NoUnit;
        }

        crate::floppy::op_delay_wait(od, self.clock, DELAY_SEEK);

        if !self.units[self.unit_nr as usize].initialised {
            let rc = self.seek_initialise(dp);
            if rc != Ack::Okay {
                return rc;
            }
        }

        let unit = self.unit_nr as usize;
        let u = self.units[unit];

        if cyl < if u.is_flippy { -8 } else { 0 } {
            return Ack::BadCylinder;
        }

        let nr;
        if u.cyl < cyl {
            nr = cyl - u.cyl;
            self.step_dir_set(true);
        } else if u.cyl > cyl {
            if cyl < 0 {
                self.flippy_trk0_sensor(true);
            }
            nr = u.cyl - cyl;
            self.step_dir_set(false);
        } else {
            return Ack::Okay;
        }

        for _ in 0..nr {
            self.step_once(dp);
        }

        self.flippy_trk0_sensor(false);

        crate::floppy::op_delay_async(
            od,
            self.clock,
            self.delay,
            DELAY_READ | DELAY_WRITE | DELAY_SEEK,
            dp.seek_settle as u32 * 1000,
        );
        self.units[unit].cyl = cyl;

        Ack::Okay
    }

    /// Reset the Disk Change flag without audible head movement: from
    /// cylinder 0, issue one outward step, which a drive at track 0 should
    /// ignore.
    pub fn noclick_step(&mut self, dp: &DelayParams, od: &mut OpDelay) -> Ack {
        let rc = self.seek(0, dp, od);
        if rc != Ack::Okay {
            return rc;
        }

        self.step_dir_set(false);
        self.step_once(dp);

        // Does it look like we actually stepped? Get back to cylinder 0 if
        // so, and discourage further use of this command.
        if !self.trk0_asserted() {
            self.delay.delay_ms(dp.seek_settle as u32); // change of direction
            self.step_dir_set(true);
            self.step_once(dp);
            self.delay.delay_ms(dp.seek_settle as u32);
            return Ack::BadCylinder;
        }

        Ack::Okay
    }
}
