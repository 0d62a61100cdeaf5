//! Host-facing USB command protocol: opcodes, status codes and the wire
//! layout of command payloads and info blocks.
//!
//! Every command frame is `[cmd, len, payload...]` with `len` counting the
//! whole frame; every response starts `[cmd, status]`. Fixed-size commands
//! validate their length exactly; the variadic ones accept a bounded range
//! so later firmware can grow a payload without breaking older hosts.

use core::convert::TryInto;

use crc::{Crc, CRC_16_IBM_3740};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Copy, Clone, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    GetInfo = 0,
    Update = 1,
    Seek = 2,
    Head = 3,
    SetParams = 4,
    GetParams = 5,
    Motor = 6,
    ReadFlux = 7,
    WriteFlux = 8,
    GetFluxStatus = 9,
    // 10 is retired and never reissued.
    SwitchFwMode = 11,
    Select = 12,
    Deselect = 13,
    SetBusType = 14,
    SetPin = 15,
    Reset = 16,
    EraseFlux = 17,
    SourceBytes = 18,
    SinkBytes = 19,
    GetPin = 20,
    TestMode = 21,
    NoclickStep = 22,
}

pub const CMD_MAX: u8 = Command::NoclickStep as u8;

#[derive(Copy, Clone, PartialEq, Debug, IntoPrimitive)]
#[repr(u8)]
pub enum Ack {
    Okay = 0,
    BadCommand = 1,
    NoIndex = 2,
    NoTrk0 = 3,
    FluxOverflow = 4,
    FluxUnderflow = 5,
    Wrprot = 6,
    NoUnit = 7,
    NoBus = 8,
    BadUnit = 9,
    BadPin = 10,
    BadCylinder = 11,
    OutOfSram = 12,
}

#[derive(Copy, Clone, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum BusType {
    None = 0,
    Ibmpc = 1,
    Shugart = 2,
}

/// GET_INFO sub-index values.
pub const GETINFO_FIRMWARE: u8 = 0;
pub const GETINFO_BW_STATS: u8 = 1;
pub const GETINFO_CURRENT_DRIVE: u8 = 7;
pub const GETINFO_DRIVE0: u8 = 8;

/// SET_PARAMS / GET_PARAMS sub-index values.
pub const PARAMS_DELAYS: u8 = 0;

/// CMD_SWITCH_FW_MODE argument.
pub const FW_MODE_BOOTLOADER: u8 = 0;

/// CMD_UPDATE signature word.
pub const UPDATE_SIGNATURE: u32 = 0xdeaf_bee3;

/// CMD_TEST_MODE signature words.
pub const TESTMODE_SIGNATURE: (u32, u32) = (0x6e50_4b4e, 0x3829_10d3);

/// Drive-info flag bits.
pub const DF_CYL_VALID: u32 = 1 << 0;
pub const DF_MOTOR_ON: u32 = 1 << 1;
pub const DF_IS_FLIPPY: u32 = 1 << 2;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC over a bootloader image. An image with its trailing CRC intact
/// yields 0.
pub fn image_crc(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Mechanical timing parameters, all host-configurable.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DelayParams {
    /// Microseconds from drive select to first command.
    pub select_delay: u16,
    /// Microseconds between head step pulses.
    pub step_delay: u16,
    /// Milliseconds of head settling after a seek.
    pub seek_settle: u16,
    /// Milliseconds of spin-up wait after motor on.
    pub motor_delay: u16,
    /// Milliseconds before an unfinished command is forcibly reset.
    pub watchdog: u16,
    /// Microseconds of delay before starting a write.
    pub pre_write: u16,
    /// Microseconds of write-inhibit after a write.
    pub post_write: u16,
    /// Microseconds after an index edge during which further edges are
    /// ignored as glitches.
    pub index_mask: u16,
}

impl DelayParams {
    pub const WIRE_SIZE: usize = 16;

    pub const fn factory() -> Self {
        DelayParams {
            select_delay: 10,
            step_delay: 10_000,
            seek_settle: 15,
            motor_delay: 750,
            watchdog: 10_000,
            pre_write: 100,
            post_write: 1000,
            index_mask: 200,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut b = [0u8; Self::WIRE_SIZE];
        for (slot, v) in b.chunks_exact_mut(2).zip(
            [
                self.select_delay,
                self.step_delay,
                self.seek_settle,
                self.motor_delay,
                self.watchdog,
                self.pre_write,
                self.post_write,
                self.index_mask,
            ]
            .iter(),
        ) {
            slot.copy_from_slice(&v.to_le_bytes());
        }
        b
    }

    /// Overwrite a byte prefix of the parameter block, leaving the tail
    /// unchanged. Hosts may send any prefix length up to the full block.
    pub fn update_prefix(&mut self, bytes: &[u8]) {
        let mut b = self.to_bytes();
        b[..bytes.len()].copy_from_slice(bytes);
        let w = |i: usize| u16::from_le_bytes(b[2 * i..2 * i + 2].try_into().unwrap());
        *self = DelayParams {
            select_delay: w(0),
            step_delay: w(1),
            seek_settle: w(2),
            motor_delay: w(3),
            watchdog: w(4),
            pre_write: w(5),
            post_write: w(6),
            index_mask: w(7),
        };
    }
}

impl Default for DelayParams {
    fn default() -> Self {
        Self::factory()
    }
}

/// CMD_READ_FLUX payload. `ticks` and `max_index` are mandatory on the
/// wire; `max_index_linger` may be omitted.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ReadFluxParams {
    /// Duration bound in sample ticks; 0 means unbounded.
    pub ticks: u32,
    /// Index-pulse budget; 0 means unbounded.
    pub max_index: u16,
    /// Sample ticks to keep reading after the index budget is reached.
    pub max_index_linger: u32,
}

impl ReadFluxParams {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 6 || payload.len() > 10 {
            return None;
        }
        // Any prefix beyond the mandatory fields overlays the defaults.
        let mut b = [0u8; 10];
        b[6..10].copy_from_slice(&crate::time::sample_us(500).to_le_bytes());
        b[..payload.len()].copy_from_slice(payload);
        Some(ReadFluxParams {
            ticks: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            max_index: u16::from_le_bytes(b[4..6].try_into().unwrap()),
            max_index_linger: u32::from_le_bytes(b[6..10].try_into().unwrap()),
        })
    }
}

/// CMD_WRITE_FLUX payload. `hard_sector_ticks` may be omitted.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WriteFluxParams {
    pub cue_at_index: bool,
    pub terminate_at_index: bool,
    /// Non-zero arms hard-sector index detection with this hole-to-hole
    /// spacing in sample ticks.
    pub hard_sector_ticks: u32,
}

impl WriteFluxParams {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 || payload.len() > 6 {
            return None;
        }
        let mut b = [0u8; 6];
        b[..payload.len()].copy_from_slice(payload);
        Some(WriteFluxParams {
            cue_at_index: b[0] != 0,
            terminate_at_index: b[1] != 0,
            hard_sector_ticks: u32::from_le_bytes(b[2..6].try_into().unwrap()),
        })
    }
}

/// CMD_ERASE_FLUX payload: erase duration in sample ticks.
pub struct EraseFluxParams {
    pub ticks: u32,
}

impl EraseFluxParams {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != 4 {
            return None;
        }
        Some(EraseFluxParams {
            ticks: u32::from_le_bytes(payload.try_into().unwrap()),
        })
    }
}

/// CMD_SOURCE_BYTES / CMD_SINK_BYTES payload.
pub struct SinkSourceParams {
    pub nr_bytes: u32,
    pub seed: u32,
}

impl SinkSourceParams {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != 8 {
            return None;
        }
        Some(SinkSourceParams {
            nr_bytes: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            seed: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
        })
    }
}

/// The 32-byte GET_INFO.FIRMWARE record.
#[derive(Copy, Clone, Debug)]
pub struct GwInfo {
    pub fw_major: u8,
    pub fw_minor: u8,
    pub is_main_firmware: u8,
    pub max_cmd: u8,
    pub sample_freq: u32,
    pub hw_model: u8,
    pub hw_submodel: u8,
    pub usb_buf_kb: u8,
    pub mcu_mhz: u16,
    pub mcu_sram_kb: u16,
}

impl GwInfo {
    pub const WIRE_SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut b = [0u8; Self::WIRE_SIZE];
        b[0] = self.fw_major;
        b[1] = self.fw_minor;
        b[2] = self.is_main_firmware;
        b[3] = self.max_cmd;
        b[4..8].copy_from_slice(&self.sample_freq.to_le_bytes());
        b[8] = self.hw_model;
        b[9] = self.hw_submodel;
        b[10] = self.usb_buf_kb;
        b[11..13].copy_from_slice(&self.mcu_mhz.to_le_bytes());
        b[13..15].copy_from_slice(&self.mcu_sram_kb.to_le_bytes());
        b
    }
}

/// The GET_INFO drive record (padded to the 32-byte info window).
#[derive(Copy, Clone, Debug, Default)]
pub struct DriveInfo {
    pub flags: u32,
    pub cyl: i16,
}

impl DriveInfo {
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&self.flags.to_le_bytes());
        b[4..6].copy_from_slice(&self.cyl.to_le_bytes());
        b
    }
}

/// Bandwidth record pair for GET_INFO.BW_STATS: `(bytes, usecs)` for the
/// slowest and fastest full-buffer turnarounds seen by SINK/SOURCE_BYTES.
#[derive(Copy, Clone, Debug, Default)]
pub struct BwStats {
    pub min_bw: (u32, u32),
    pub max_bw: (u32, u32),
}

impl BwStats {
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&self.min_bw.0.to_le_bytes());
        b[4..8].copy_from_slice(&self.min_bw.1.to_le_bytes());
        b[8..12].copy_from_slice(&self.max_bw.0.to_le_bytes());
        b[12..16].copy_from_slice(&self.max_bw.1.to_le_bytes());
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn command_numbering_is_stable() {
        assert_eq!(Command::try_from(7).unwrap(), Command::ReadFlux);
        assert_eq!(Command::try_from(14).unwrap(), Command::SetBusType);
        assert_eq!(Command::try_from(22).unwrap(), Command::NoclickStep);
        assert!(Command::try_from(10).is_err());
        assert!(Command::try_from(0xfe).is_err());
        assert_eq!(CMD_MAX, 22);
    }

    #[test]
    fn ack_values_match_the_wire() {
        assert_eq!(u8::from(Ack::Okay), 0);
        assert_eq!(u8::from(Ack::FluxUnderflow), 5);
        assert_eq!(u8::from(Ack::NoUnit), 7);
        assert_eq!(u8::from(Ack::OutOfSram), 12);
    }

    #[test]
    fn delay_params_round_trip_and_prefix_update() {
        let mut p = DelayParams::factory();
        let bytes = p.to_bytes();
        assert_eq!(&bytes[0..2], &10u16.to_le_bytes());
        assert_eq!(&bytes[8..10], &10_000u16.to_le_bytes());

        // A 4-byte prefix update touches only the first two fields.
        p.update_prefix(&[5, 0, 0x10, 0x27]);
        assert_eq!(p.select_delay, 5);
        assert_eq!(p.step_delay, 10_000);
        assert_eq!(p.seek_settle, 15);
    }

    #[test]
    fn read_flux_linger_defaults_to_500us() {
        let mut payload = [0u8; 6];
        payload[4..6].copy_from_slice(&3u16.to_le_bytes());
        let p = ReadFluxParams::parse(&payload).unwrap();
        assert_eq!(p.max_index, 3);
        assert_eq!(p.max_index_linger, crate::time::sample_us(500));

        let mut long = [0u8; 10];
        long[6..10].copy_from_slice(&1234u32.to_le_bytes());
        assert_eq!(ReadFluxParams::parse(&long).unwrap().max_index_linger, 1234);

        assert!(ReadFluxParams::parse(&[0; 5]).is_none());
        assert!(ReadFluxParams::parse(&[0; 11]).is_none());
        // A partial tail overlays the default linger bytes in place.
        assert!(ReadFluxParams::parse(&[0; 8]).is_some());
    }

    #[test]
    fn write_flux_hard_sector_is_optional() {
        let p = WriteFluxParams::parse(&[1, 0]).unwrap();
        assert!(p.cue_at_index);
        assert!(!p.terminate_at_index);
        assert_eq!(p.hard_sector_ticks, 0);

        let mut long = [0u8; 6];
        long[1] = 1;
        long[2..6].copy_from_slice(&720_000u32.to_le_bytes());
        let p = WriteFluxParams::parse(&long).unwrap();
        assert!(p.terminate_at_index);
        assert_eq!(p.hard_sector_ticks, 720_000);

        assert!(WriteFluxParams::parse(&[0]).is_none());
    }

    #[test]
    fn info_block_layout() {
        let info = GwInfo {
            fw_major: 1,
            fw_minor: 3,
            is_main_firmware: 1,
            max_cmd: CMD_MAX,
            sample_freq: 72_000_000,
            hw_model: 7,
            hw_submodel: 0,
            usb_buf_kb: 128,
            mcu_mhz: 72,
            mcu_sram_kb: 256,
        };
        let b = info.to_bytes();
        assert_eq!(b.len(), 32);
        assert_eq!(b[2], 1);
        assert_eq!(u32::from_le_bytes(b[4..8].try_into().unwrap()), 72_000_000);
        assert_eq!(b[10], 128);
    }

    #[test]
    fn image_crc_residual_is_zero() {
        let mut image = b"bootloader image body".to_vec();
        let crc = image_crc(&image);
        image.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(image_crc(&image), 0);
    }
}
