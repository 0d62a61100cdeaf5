//! The flux I/O engine: a command-driven state machine owning the device
//! between host interactions.
//!
//! Reads pull capture samples out of the DMA ring, encode them into the
//! host ring and stream USB bulk packets; writes run the same pipeline in
//! reverse, decoding host bytes into timer reload values. Both directions
//! are bounded by deadlines and watchdogged, and every error path drains
//! cleanly so the host always sees a well-framed stream end.

use core::convert::TryFrom;
use core::sync::atomic::{compiler_fence, Ordering};

use rtt_target::rprintln;

use flux_probe_bsp::clock::Clock;
use flux_probe_bsp::delay::Delay;
use flux_probe_bsp::dma::DMA;
use flux_probe_bsp::flash::{Flash, BOOTLOADER_SIZE, FLASH_BASE};
use flux_probe_bsp::gpio::{MemoisedMode, Pins};
use flux_probe_bsp::tim::SampleTimer;

use flux_probe_core::flux::{FluxDecoder, FluxEncoder};
use flux_probe_core::opdelay::{OpDelay, DELAY_HEAD, DELAY_READ, DELAY_SEEK, DELAY_WRITE};
use flux_probe_core::protocol::*;
use flux_probe_core::ring::HostRing;
use flux_probe_core::time::{time_diff, time_from_samples, time_ms, time_us};
use flux_probe_core::timer::Timer;
use flux_probe_core::TimCnt;

use crate::drive::{Drive, NR_UNITS};
use crate::index;
use crate::testmode::TestMode;
use crate::usb::USB;
use crate::{DMA_RING_LEN, USB_HS_MPS, U_BUF_SZ};

const DMA_RING_MASK: usize = DMA_RING_LEN - 1;
const MPS: usize = USB_HS_MPS as usize;

/// Bandwidth-measurement slot spacing for SINK/SOURCE_BYTES: one timestamp
/// per this many transferred bytes.
const SS_STRIDE: u32 = U_BUF_SZ / SS_SLOTS as u32;
const SS_SLOTS: usize = 256;

#[derive(Copy, Clone, PartialEq, Debug)]
enum State {
    Inactive,
    CommandWait,
    Zlp,
    ReadFlux,
    ReadFluxDrain,
    WriteFluxWaitData,
    WriteFluxWaitIndex,
    WriteFlux,
    WriteFluxDrain,
    EraseFlux,
    SourceBytes,
    SinkBytes,
    UpdateBootloader,
    TestMode,
}

/// One-deep packet queue between the bulk endpoints and the host ring.
struct UsbPacket {
    data: [u8; MPS],
    len: usize,
    ready: bool,
}

struct ReadState {
    nr_index: u32,
    max_index: u32,
    max_index_linger: u32,
    deadline: u32,
}

struct WriteState {
    decoder: FluxDecoder,
    cue_at_index: bool,
    terminate_at_index: bool,
    /// Pre-start stall bound: a host that stops sending before the
    /// end-of-stream marker must not hang the pipeline with a clean status.
    data_deadline: u32,
}

struct SinkSource {
    todo: u32,
    min_delta: u32,
    max_delta: u32,
    status: Ack,
    rand: u32,
    prod: u32,
    times: [u32; SS_SLOTS],
}

fn ss_rand_next(x: u32) -> u32 {
    if x & 1 != 0 {
        (x >> 1) ^ 0x8000_0062
    } else {
        x >> 1
    }
}

/// Busy-yield until no operation in `mask` is pending. The poll drives the
/// expiry, so this cannot deadlock on a quiet system.
pub fn op_delay_wait(od: &mut OpDelay, clock: &Clock, mask: u8) {
    while od.pending(mask) {
        od.poll(clock.now());
        cortex_m::asm::nop();
    }
}

/// Delay the operations in `mask` by `usec`. Very long delays fall back to
/// a synchronous wait rather than stretching the deadline timer.
pub fn op_delay_async(od: &mut OpDelay, clock: &Clock, delay: &Delay, mask: u8, usec: u32) {
    if usec > 1_000_000 {
        delay.delay_us(usec);
        return;
    }
    od.schedule(mask, clock.now().wrapping_add(time_us(usec)));
}

pub struct Floppy<'a> {
    pins: &'a Pins<'a>,
    delay: &'a Delay,
    clock: &'a Clock,
    dma: &'a DMA,
    tim: &'a SampleTimer,
    flash: &'a Flash,

    state: State,
    ring: HostRing<'static>,
    dma_ring: &'static mut [TimCnt; DMA_RING_LEN],
    dma_cons: usize,
    dma_prod: usize,

    encoder: FluxEncoder,
    packet: UsbPacket,
    read: ReadState,
    write: WriteState,
    /// Read/write start time, or erase end time.
    op_time: u32,
    flux_status: Ack,
    ss: SinkSource,
    update_len: u32,

    watchdog_deadline: u32,
    watchdog_armed: bool,
    opdelay: OpDelay,
    index_timer: Timer,
    pub delay_params: DelayParams,

    pub drive: Drive<'a>,
    testmode: TestMode,

    // WDATA flips between plain output and the timer function per write.
    wdata_out: MemoisedMode,
    wdata_af: MemoisedMode,

    cmd: [u8; 512],
    cmd_len: usize,
    resp: [u8; MPS],
}

impl<'a> Floppy<'a> {
    pub fn new(
        pins: &'a Pins<'a>,
        delay: &'a Delay,
        clock: &'a Clock,
        dma: &'a DMA,
        tim: &'a SampleTimer,
        flash: &'a Flash,
        u_buf: &'static mut [u8],
        dma_ring: &'static mut [TimCnt; DMA_RING_LEN],
    ) -> Self {
        let mut floppy = Floppy {
            pins,
            delay,
            clock,
            dma,
            tim,
            flash,
            state: State::Inactive,
            ring: HostRing::new(u_buf),
            dma_ring,
            dma_cons: 0,
            dma_prod: 0,
            encoder: FluxEncoder::new(0),
            packet: UsbPacket {
                data: [0; MPS],
                len: 0,
                ready: false,
            },
            read: ReadState {
                nr_index: 0,
                max_index: 0,
                max_index_linger: 0,
                deadline: 0,
            },
            write: WriteState {
                decoder: FluxDecoder::new(),
                cue_at_index: false,
                terminate_at_index: false,
                data_deadline: 0,
            },
            op_time: 0,
            flux_status: Ack::Okay,
            ss: SinkSource {
                todo: 0,
                min_delta: u32::max_value(),
                max_delta: 0,
                status: Ack::Okay,
                rand: 0,
                prod: 0,
                times: [0; SS_SLOTS],
            },
            update_len: 0,
            watchdog_deadline: 0,
            watchdog_armed: false,
            opdelay: OpDelay::new(),
            index_timer: Timer::new(),
            delay_params: DelayParams::factory(),
            drive: Drive::new(pins, delay, clock),
            testmode: TestMode::new(),
            wdata_out: pins.wdata.memoise_mode_output(),
            wdata_af: pins.wdata.memoise_mode_alternate(),
            cmd: [0; 512],
            cmd_len: 0,
            resp: [0; MPS],
        };

        let now = clock.now();
        index::refresh(now);
        floppy.index_timer.set(now.wrapping_add(index::REFRESH_PERIOD));
        index::set_mask_us(floppy.delay_params.index_mask as u32);
        floppy
    }

    fn act_led(&self, on: bool) {
        // Active low.
        self.pins.led.set_bool(!on);
    }

    fn watchdog_kick(&mut self) {
        self.watchdog_deadline = self
            .clock
            .now()
            .wrapping_add(time_ms(self.delay_params.watchdog as u32));
    }

    fn watchdog_arm(&mut self) {
        self.watchdog_armed = true;
        self.watchdog_kick();
    }

    fn op_delay_async(&mut self, mask: u8, usec: u32) {
        op_delay_async(&mut self.opdelay, self.clock, self.delay, mask, usec);
    }

    /// Host configured the device: enter command processing.
    pub fn on_usb_configured(&mut self) {
        self.watchdog_arm();
        self.flux_end();
        self.state = State::CommandWait;
        self.ring.reset();
        self.cmd_len = 0;
        self.act_led(false);
    }

    /// Bus reset: stop everything and park the drives.
    pub fn on_usb_reset(&mut self) {
        self.state = State::Inactive;
        self.quiesce_drives();
        self.act_led(false);
    }

    /// Stop flux generation/capture and release the bus write lines.
    fn flux_end(&mut self) {
        if self.drive.wgate {
            self.drive.set_wgate(false);
            self.pins.wdata.apply_memoised_mode(self.wdata_out);
            self.op_delay_async(
                DELAY_WRITE | DELAY_SEEK | DELAY_HEAD,
                self.delay_params.post_write as u32,
            );
        }

        self.tim.stop();
        self.dma.stop();

        index::set_hard_sector_ticks(0);
    }

    fn quiesce_drives(&mut self) {
        self.flux_end();

        for i in 0..NR_UNITS {
            let u = self.drive.units[i];

            // A flippy drive parked at a negative cylinder must be walked
            // back before deselection.
            if u.initialised && u.cyl < 0 {
                let _ = self.drive.select(i as u8, &self.delay_params);
                let _ = self.drive.seek(0, &self.delay_params, &mut self.opdelay);
            }

            if u.motor {
                let _ = self.drive.motor(i as u8, false, &self.delay_params);
            }
        }

        self.drive.deselect();
        self.watchdog_armed = false;
    }

    fn set_bus_type(&mut self, ty: u8) -> bool {
        if ty == self.drive.bus_type as u8 {
            return true;
        }
        match BusType::try_from(ty) {
            Ok(bus) => {
                self.reset_bus(bus);
                true
            }
            Err(_) => false,
        }
    }

    fn reset_bus(&mut self, bus: BusType) {
        self.quiesce_drives();
        self.drive.bus_type = bus;
        self.drive.unit_nr = -1;
        self.drive.units = Default::default();
    }

    fn get_floppy_pin(&self, pin: u8) -> Result<u8, Ack> {
        match pin {
            8 => Ok(self.pins.index.is_high() as u8),
            26 => Ok(self.pins.trk0.is_high() as u8),
            28 => Ok(self.pins.wrprot.is_high() as u8),
            34 => Ok(self.pins.pin34.is_high() as u8),
            _ => self
                .pins
                .user_pin(pin)
                .map(|p| p.is_high() as u8)
                .ok_or(Ack::BadPin),
        }
    }

    /// Send `len` bytes of `resp` and return to command accumulation. A
    /// response that exactly fills a packet gets a trailing ZLP so the host
    /// sees the transfer end.
    fn end_command(&mut self, usb: &mut USB, len: usize) {
        self.watchdog_arm();
        usb.write_packet(&self.resp[..len]);
        self.ring.reset();
        self.cmd_len = 0;
        if self.state == State::CommandWait {
            self.act_led(false);
        }
        if len == MPS {
            self.state = State::Zlp;
        }
    }

    /*
     * READ PATH
     */

    fn read_prep(&mut self, p: &ReadFluxParams) -> Ack {
        op_delay_wait(&mut self.opdelay, self.clock, DELAY_READ);

        self.tim.rdata_prep();
        self.dma.rdata_start(&mut self.dma_ring[..]);
        self.tim.rdata_enable_capture();

        self.dma_cons = 0;
        self.encoder = FluxEncoder::new(self.tim.cnt() as TimCnt);

        self.tim.start();

        index::reset_count();
        self.packet.ready = false;

        self.state = State::ReadFlux;
        let now = self.clock.now();
        self.op_time = now;
        self.flux_status = Ack::Okay;
        self.read = ReadState {
            nr_index: 0,
            max_index: if p.max_index == 0 {
                u32::max_value()
            } else {
                p.max_index as u32
            },
            max_index_linger: time_from_samples(p.max_index_linger),
            deadline: now.wrapping_add(if p.ticks != 0 {
                time_from_samples(p.ticks)
            } else {
                i32::max_value() as u32
            }),
        };

        Ack::Okay
    }

    fn rdata_encode_flux(&mut self) {
        // Consistent index snapshot, then the opcode goes out before any
        // samples captured after the pulse.
        let (count, rdata_cnt) = index::snapshot();
        if self.read.nr_index != count {
            // Just passed the index mark: report the just-completed
            // revolution, and defer the watchdog while revolutions are
            // still arriving.
            self.read.nr_index = count;
            self.encoder.index(&mut self.ring, rdata_cnt as TimCnt);
            self.watchdog_kick();
        }

        // Drain whatever the capture DMA has produced.
        let prod = (DMA_RING_LEN - self.dma.rdata_ndtr()) & DMA_RING_MASK;
        while self.dma_cons != prod {
            let sample =
                unsafe { core::ptr::read_volatile(&self.dma_ring[self.dma_cons]) };
            self.encoder.sample(&mut self.ring, sample);
            self.dma_cons = (self.dma_cons + 1) & DMA_RING_MASK;
        }

        // Long quiet stretches are flushed as explicit gaps so the capture
        // counter cannot silently overflow.
        self.encoder
            .pad_idle(&mut self.ring, self.tim.cnt() as TimCnt);
    }

    fn make_read_packet(&mut self, n: usize) {
        self.ring.read_into(&mut self.packet.data[..n]);
        self.packet.len = n;
        self.packet.ready = true;
    }

    fn floppy_read(&mut self, usb: &mut USB) {
        let mut avail = self.ring.used();

        if self.state == State::ReadFlux {
            self.rdata_encode_flux();
            avail = self.ring.used();
            let now = self.clock.now();

            if avail > U_BUF_SZ {
                rprintln!("READ_FLUX overflow: {} buffered", avail);
                self.flux_end();
                self.flux_status = Ack::FluxOverflow;
                self.state = State::ReadFluxDrain;
                self.ring.reset();
                avail = 0;
            } else if self.read.nr_index >= self.read.max_index {
                // Index budget reached: convert the remaining run time into
                // a linger deadline and stop checking the budget, so the
                // stream tail keeps wrap-continuity for the host.
                let deadline = now.wrapping_add(self.read.max_index_linger);
                if time_diff(deadline, self.read.deadline) > 0 {
                    self.read.deadline = deadline;
                }
                self.read.max_index = u32::max_value();
            } else if time_diff(self.read.deadline, now) >= 0 {
                self.flux_end();
                self.state = State::ReadFluxDrain;
            } else if self.read.nr_index == 0
                && self.read.max_index != u32::max_value()
                && time_diff(self.op_time, now) > time_ms(2000) as i32
            {
                // Index-terminated read with no index in two seconds.
                self.flux_end();
                self.flux_status = Ack::NoIndex;
                self.state = State::ReadFluxDrain;
                self.ring.reset();
                avail = 0;
            }
        } else if avail < MPS as u32 && !self.packet.ready && usb.tx_ready() {
            // Final packet, terminated by a NUL.
            let n = avail as usize;
            self.resp = [0; MPS];
            self.ring.read_into(&mut self.resp[..n]);
            self.state = State::CommandWait;
            self.end_command(usb, n + 1);
            return; /* FINISHED */
        }

        if !self.packet.ready && avail >= MPS as u32 {
            self.make_read_packet(MPS);
        }

        if self.packet.ready && usb.tx_ready() {
            usb.write_packet(&self.packet.data[..self.packet.len]);
            self.packet.ready = false;
        }
    }

    /*
     * WRITE PATH
     */

    fn write_prep(&mut self, p: &WriteFluxParams) -> Ack {
        if self.drive.wrprot_asserted() {
            return Ack::Wrprot;
        }

        self.tim.wdata_prep();
        self.dma_prod = 0;
        self.packet.ready = false;

        self.state = State::WriteFluxWaitData;
        self.flux_status = Ack::Okay;
        self.write = WriteState {
            decoder: FluxDecoder::new(),
            cue_at_index: p.cue_at_index,
            terminate_at_index: p.terminate_at_index,
            data_deadline: self.clock.now().wrapping_add(time_ms(2000)),
        };

        index::set_hard_sector_ticks(p.hard_sector_ticks);

        Ack::Okay
    }

    /// Shift one bulk OUT packet into the host ring, one packet in flight.
    /// Returns true if new bytes were buffered.
    fn process_write_packet(&mut self, usb: &mut USB) -> bool {
        if !self.packet.ready {
            if let Some(n) = usb.read_packet(&mut self.packet.data) {
                self.packet.len = n;
                self.packet.ready = true;
            }
        }

        if self.packet.ready && self.ring.free() >= self.packet.len as u32 {
            self.ring.append(&self.packet.data[..self.packet.len]);
            self.packet.ready = false;
            return true;
        }
        false
    }

    /// Decode buffered stream bytes into the largest contiguous stretch of
    /// the DMA ring we can fill without catching the hardware consumer.
    fn wdata_decode_flux(&mut self) {
        let dmacons = (DMA_RING_LEN - self.dma.wdata_ndtr()) & DMA_RING_MASK;
        let nr_to_wrap = DMA_RING_LEN - self.dma_prod;
        let nr_to_cons = dmacons.wrapping_sub(self.dma_prod + 1) & DMA_RING_MASK;
        let nr = nr_to_wrap.min(nr_to_cons);

        let prod = self.dma_prod;
        match self
            .write
            .decoder
            .decode(&mut self.ring, &mut self.dma_ring[prod..prod + nr])
        {
            Ok(n) => self.dma_prod = (self.dma_prod + n) & DMA_RING_MASK,
            Err(_) => {
                self.flux_end();
                self.flux_status = Ack::BadCommand;
                self.state = State::WriteFluxDrain;
            }
        }
    }

    fn write_wait_data(&mut self, usb: &mut USB) {
        let now = self.clock.now();
        if self.process_write_packet(usb) {
            self.write.data_deadline = now.wrapping_add(time_ms(2000));
        }
        self.wdata_decode_flux();
        if self.flux_status != Ack::Okay {
            return;
        }

        // Don't wait for the whole of the large buffer at full speed.
        let threshold = if U_BUF_SZ > 16384 && !usb.is_highspeed() {
            16384 - 512
        } else {
            U_BUF_SZ - 512
        };

        // Wait for the DMA and input buffers to fill, or the stream to end.
        // The DMA ring isn't draining yet, so the stream may already have
        // ended without the decoder reaching the NUL; peek for it.
        let write_finished = if self.ring.is_empty() {
            self.write.decoder.is_finished()
        } else {
            self.ring.last_byte() == 0
        };
        if (self.dma_prod != DMA_RING_LEN - 1 || self.ring.used() < threshold) && !write_finished
        {
            // A host that went quiet without ever sending the terminator
            // must surface as an underflow, not a clean-status hang.
            if time_diff(self.write.data_deadline, now) >= 0 {
                rprintln!("WRITE_FLUX underflow: stream stalled before start");
                self.flux_end();
                self.flux_status = Ack::FluxUnderflow;
                self.state = State::WriteFluxDrain;
            }
            return;
        }

        op_delay_wait(&mut self.opdelay, self.clock, DELAY_WRITE);

        self.state = State::WriteFluxWaitIndex;
        self.op_time = self.clock.now();

        // Enable DMA only after flux values are generated, and preload the
        // timer with the first period.
        self.dma.wdata_start(&self.dma_ring[..]);
        self.tim.force_update();

        // Trigger the timer update, then start watching for index.
        compiler_fence(Ordering::SeqCst);
        index::reset_count();
    }

    fn write_wait_index(&mut self) {
        if self.write.cue_at_index && index::count() == 0 {
            if time_diff(self.op_time, self.clock.now()) > time_ms(2000) as i32 {
                // Timeout
                self.flux_end();
                self.flux_status = Ack::NoIndex;
                self.state = State::WriteFluxDrain;
            }
            return;
        }

        self.tim.start();

        // Connect WDATA to the timer and open the write gate.
        self.pins.wdata.apply_memoised_mode(self.wdata_af);
        self.drive.set_wgate(true);

        index::reset_count();
        self.state = State::WriteFlux;
    }

    fn write_check_underflow(&mut self) {
        let avail = self.ring.used();

        // Dry, or nearly dry with no end-of-stream in sight.
        if avail == 0 || (avail < 16 && self.ring.last_byte() != 0) {
            rprintln!("WRITE_FLUX underflow: {} buffered", avail);
            self.flux_end();
            self.flux_status = Ack::FluxUnderflow;
            self.state = State::WriteFluxDrain;
        }
    }

    fn floppy_write(&mut self, usb: &mut USB) {
        self.process_write_packet(usb);
        self.wdata_decode_flux();
        if self.flux_status != Ack::Okay {
            return;
        }

        'terminate: loop {
            // Early termination on index pulse?
            if self.write.terminate_at_index && index::count() != 0 {
                break 'terminate;
            }

            if !self.write.decoder.is_finished() {
                self.write_check_underflow();
                return;
            }

            // Wait for the DMA ring to drain.
            let mut todo = usize::max_value();
            loop {
                // Still watching for early termination while draining.
                if self.write.terminate_at_index && index::count() != 0 {
                    break 'terminate;
                }
                let prev_todo = todo;
                let dmacons = (DMA_RING_LEN - self.dma.wdata_ndtr()) & DMA_RING_MASK;
                todo = self.dma_prod.wrapping_sub(dmacons) & DMA_RING_MASK;
                if todo == 0 || todo > prev_todo {
                    break 'terminate;
                }
            }
        }

        self.flux_end();
        self.state = State::WriteFluxDrain;
    }

    fn write_drain(&mut self, usb: &mut USB) {
        // Drain the remainder of the stream.
        if !self.write.decoder.is_finished() {
            self.process_write_packet(usb);
            let _ = self
                .write
                .decoder
                .decode(&mut self.ring, &mut self.dma_ring[..]);
            return;
        }

        // Wait for space to write the single status byte.
        if !usb.tx_ready() {
            return;
        }

        self.resp[0] = self.flux_status.into();
        self.state = State::CommandWait;
        self.end_command(usb, 1);
    }

    /*
     * ERASE PATH
     */

    fn erase_prep(&mut self, p: &EraseFluxParams) -> Ack {
        op_delay_wait(&mut self.opdelay, self.clock, DELAY_WRITE);

        if self.drive.wrprot_asserted() {
            return Ack::Wrprot;
        }

        self.drive.set_wgate(true);

        self.state = State::EraseFlux;
        self.flux_status = Ack::Okay;
        self.op_time = self
            .clock
            .now()
            .wrapping_add(time_from_samples(p.ticks));

        Ack::Okay
    }

    fn floppy_erase(&mut self, usb: &mut USB) {
        if time_diff(self.op_time, self.clock.now()) < 0 {
            return;
        }

        self.flux_end();

        self.resp[0] = self.flux_status.into();
        self.state = State::CommandWait;
        self.end_command(usb, 1);
    }

    /*
     * SINK/SOURCE
     */

    fn sink_source_prep(&mut self, p: &SinkSourceParams) {
        self.ss.todo = p.nr_bytes;
        self.ss.min_delta = u32::max_value();
        self.ss.max_delta = 0;
        self.ss.status = Ack::Okay;
        self.ss.rand = p.seed;
        self.ss.prod = 0;
        self.packet.ready = false;
    }

    /// Timestamp every stride of transferred bytes into a rotating slot
    /// table; once a whole buffer's worth has passed, each overwrite delta
    /// is the time taken to move `U_BUF_SZ` bytes.
    fn ss_update_deltas(&mut self, len: usize) {
        let now = self.clock.now();
        let mut p = self.ss.prod;

        for _ in 0..len {
            p = p.wrapping_add(1);
            if p % SS_STRIDE != 0 {
                continue;
            }
            let slot = ((p / SS_STRIDE) as usize) % SS_SLOTS;
            let delta = time_diff(self.ss.times[slot], now) as u32;
            self.ss.times[slot] = now;
            if p >= U_BUF_SZ {
                if delta > self.ss.max_delta {
                    self.ss.max_delta = delta;
                }
                if delta < self.ss.min_delta {
                    self.ss.min_delta = delta;
                }
            }
        }

        self.ss.prod = p;
    }

    fn source_bytes(&mut self, usb: &mut USB) {
        if !self.packet.ready {
            for i in 0..MPS {
                self.packet.data[i] = self.ss.rand as u8;
                self.ss.rand = ss_rand_next(self.ss.rand);
            }
            self.packet.ready = true;
        }

        if !usb.tx_ready() {
            return;
        }

        self.packet.ready = false;

        if self.ss.todo < MPS as u32 {
            let n = self.ss.todo as usize;
            self.resp[..n].copy_from_slice(&self.packet.data[..n]);
            self.state = State::CommandWait;
            self.end_command(usb, n);
            return; /* FINISHED */
        }

        usb.write_packet(&self.packet.data[..MPS]);
        self.ss.todo -= MPS as u32;
        self.ss_update_deltas(MPS);
    }

    fn sink_bytes(&mut self, usb: &mut USB) {
        if self.ss.todo == 0 {
            // Done: wait for space to write the status byte.
            if !usb.tx_ready() {
                return;
            }
            self.resp[0] = self.ss.status.into();
            self.state = State::CommandWait;
            self.end_command(usb, 1);
            return; /* FINISHED */
        }

        let len = match usb.read_packet(&mut self.packet.data) {
            Some(len) => len,
            None => return,
        };

        self.ss.todo = if self.ss.todo <= len as u32 {
            0
        } else {
            self.ss.todo - len as u32
        };
        self.ss_update_deltas(len);

        // Check data.
        for i in 0..len {
            if self.packet.data[i] != self.ss.rand as u8 {
                self.ss.status = Ack::BadCommand;
            }
            self.ss.rand = ss_rand_next(self.ss.rand);
        }
    }

    /*
     * BOOTLOADER UPDATE
     */

    fn update_prep(&mut self, len: u32) -> Ack {
        // A bad-sized payload shouldn't even have got here.
        if len & 3 != 0 || len > BOOTLOADER_SIZE {
            return Ack::BadCommand;
        }

        // Doesn't fit in our staging buffer? Return a special error code.
        if len > U_BUF_SZ {
            return Ack::OutOfSram;
        }

        self.state = State::UpdateBootloader;
        self.update_len = len;

        rprintln!("Update Bootloader: {} bytes", len);

        Ack::Okay
    }

    fn update_continue(&mut self, usb: &mut USB) {
        // Stage the entire new bootloader into the host ring.
        if let Some(n) = usb.read_packet(&mut self.packet.data) {
            let n = n.min((self.update_len - self.ring.used()) as usize);
            self.ring.append(&self.packet.data[..n]);
        }

        // Keep going until we have all of it.
        if self.ring.used() < self.update_len || !usb.tx_ready() {
            return;
        }

        let len = self.update_len as usize;

        // Validate the new bootloader before erasing the existing one!
        let mut crc = image_crc(&self.ring.storage()[..len]);
        if crc == 0 {
            // We are now committed. Try really hard to write the new
            // bootloader, including retries.
            self.flash.unlock();
            for _ in 0..3 {
                self.flash.erase_sector(0);
                self.flash.program(FLASH_BASE, &self.ring.storage()[..len]);
                crc = image_crc(Flash::read(FLASH_BASE, len));
                if crc == 0 {
                    break;
                }
            }
            self.flash.lock();
        }

        rprintln!(
            "Final CRC: {:04x} ({})",
            crc,
            if crc != 0 { "FAIL" } else { "OK" }
        );
        self.resp[0] = (crc != 0) as u8;
        self.state = State::CommandWait;
        self.end_command(usb, 1);
    }

    /*
     * COMMAND DISPATCH
     */

    fn process_command(&mut self, usb: &mut USB) {
        let cmd_byte = self.cmd[0];
        let len = self.cmd[1] as usize;
        let mut resp_sz = 2usize;

        self.watchdog_arm();
        self.act_led(true);

        self.resp[0] = cmd_byte;
        let payload_len = len.saturating_sub(2);
        let mut payload = [0u8; 253];
        payload[..payload_len].copy_from_slice(&self.cmd[2..2 + payload_len]);
        let payload = &payload[..payload_len];

        let status = match Command::try_from(cmd_byte) {
            Ok(Command::GetInfo) if len == 3 => {
                let idx = payload[0];
                self.resp[2..34].iter_mut().for_each(|b| *b = 0);
                let status = match idx {
                    GETINFO_FIRMWARE => {
                        self.resp[2..34].copy_from_slice(&self.gw_info().to_bytes());
                        Ack::Okay
                    }
                    GETINFO_BW_STATS => {
                        let bw = BwStats {
                            min_bw: (U_BUF_SZ, self.ss.max_delta / time_us(1)),
                            max_bw: (U_BUF_SZ, self.ss.min_delta / time_us(1)),
                        };
                        self.resp[2..18].copy_from_slice(&bw.to_bytes());
                        Ack::Okay
                    }
                    GETINFO_CURRENT_DRIVE | GETINFO_DRIVE0..=10 => {
                        let nr = if idx == GETINFO_CURRENT_DRIVE {
                            -1
                        } else {
                            (idx - GETINFO_DRIVE0) as i16
                        };
                        match self.drive.get_info(nr) {
                            Ok(d) => {
                                self.resp[2..10].copy_from_slice(&d.to_bytes());
                                Ack::Okay
                            }
                            Err(e) => e,
                        }
                    }
                    _ => Ack::BadCommand,
                };
                if status == Ack::Okay {
                    resp_sz += 32;
                }
                status
            }
            Ok(Command::Update) if len == 10 => {
                let u_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let signature =
                    u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
                if signature != UPDATE_SIGNATURE {
                    Ack::BadCommand
                } else {
                    self.update_prep(u_len)
                }
            }
            Ok(Command::Seek) if len == 3 || len == 4 => {
                let cyl = if len == 3 {
                    payload[0] as i8 as i16
                } else {
                    i16::from_le_bytes([payload[0], payload[1]])
                };
                self.drive.seek(cyl, &self.delay_params, &mut self.opdelay)
            }
            Ok(Command::Head) if len == 3 && payload[0] <= 1 => {
                let head = payload[0];
                if self.drive.head as u8 != head {
                    op_delay_wait(&mut self.opdelay, self.clock, DELAY_HEAD);
                    self.drive.set_head(head);
                    self.op_delay_async(DELAY_WRITE, self.delay_params.pre_write as u32);
                }
                Ack::Okay
            }
            Ok(Command::SetParams)
                if len >= 3
                    && len <= 3 + DelayParams::WIRE_SIZE
                    && payload[0] == PARAMS_DELAYS =>
            {
                self.delay_params.update_prefix(&payload[1..]);
                index::set_mask_us(self.delay_params.index_mask as u32);
                Ack::Okay
            }
            Ok(Command::GetParams)
                if len == 4
                    && payload[0] == PARAMS_DELAYS
                    && payload[1] as usize <= DelayParams::WIRE_SIZE =>
            {
                let nr = payload[1] as usize;
                self.resp[2..2 + nr].copy_from_slice(&self.delay_params.to_bytes()[..nr]);
                resp_sz += nr;
                Ack::Okay
            }
            Ok(Command::Motor) if len == 4 && payload[1] & !1 == 0 => {
                self.drive
                    .motor(payload[0], payload[1] & 1 != 0, &self.delay_params)
            }
            Ok(Command::ReadFlux) => match ReadFluxParams::parse(payload) {
                Some(p) => self.read_prep(&p),
                None => Ack::BadCommand,
            },
            Ok(Command::WriteFlux) => match WriteFluxParams::parse(payload) {
                Some(p) => self.write_prep(&p),
                None => Ack::BadCommand,
            },
            Ok(Command::GetFluxStatus) if len == 2 => self.flux_status,
            Ok(Command::Select) if len == 3 => self.drive.select(payload[0], &self.delay_params),
            Ok(Command::Deselect) if len == 2 => {
                self.drive.deselect();
                Ack::Okay
            }
            Ok(Command::SetBusType) if len == 3 => {
                if self.set_bus_type(payload[0]) {
                    Ack::Okay
                } else {
                    Ack::BadCommand
                }
            }
            Ok(Command::SetPin) if len == 4 && payload[1] & !1 == 0 => {
                match self.pins.user_pin(payload[0]) {
                    Some(pin) => {
                        pin.set_bool(payload[1] & 1 != 0);
                        Ack::Okay
                    }
                    None => Ack::BadPin,
                }
            }
            Ok(Command::GetPin) if len == 3 => match self.get_floppy_pin(payload[0]) {
                Ok(level) => {
                    self.resp[2] = level;
                    resp_sz += 1;
                    Ack::Okay
                }
                Err(e) => e,
            },
            Ok(Command::Reset) if len == 2 => {
                self.delay_params = DelayParams::factory();
                index::set_mask_us(self.delay_params.index_mask as u32);
                self.reset_bus(BusType::None);
                self.pins.reset_user_pins();
                Ack::Okay
            }
            Ok(Command::EraseFlux) => match EraseFluxParams::parse(payload) {
                Some(p) => self.erase_prep(&p),
                None => Ack::BadCommand,
            },
            Ok(cmd @ Command::SourceBytes) | Ok(cmd @ Command::SinkBytes) => {
                match SinkSourceParams::parse(payload) {
                    Some(p) => {
                        self.state = if cmd == Command::SourceBytes {
                            State::SourceBytes
                        } else {
                            State::SinkBytes
                        };
                        self.sink_source_prep(&p);
                        Ack::Okay
                    }
                    None => Ack::BadCommand,
                }
            }
            Ok(Command::SwitchFwMode) if len == 3 && payload[0] & !1 == 0 => {
                if payload[0] == FW_MODE_BOOTLOADER {
                    self.delay.delay_us(100);
                    flux_probe_bsp::bootload::bootload();
                }
                Ack::Okay
            }
            Ok(Command::TestMode) if len == 10 => {
                let sig1 = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let sig2 = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
                if (sig1, sig2) != TESTMODE_SIGNATURE {
                    Ack::BadCommand
                } else {
                    let status = self.testmode.init();
                    if status == Ack::Okay {
                        self.state = State::TestMode;
                    }
                    status
                }
            }
            Ok(Command::NoclickStep) if len == 2 => {
                self.drive.noclick_step(&self.delay_params, &mut self.opdelay)
            }
            _ => Ack::BadCommand,
        };

        self.resp[1] = status.into();
        self.end_command(usb, resp_sz);
    }

    fn command_wait(&mut self, usb: &mut USB) {
        let mut buf = [0u8; MPS];
        if let Some(n) = usb.read_packet(&mut buf) {
            if self.cmd_len + n <= self.cmd.len() {
                self.cmd[self.cmd_len..self.cmd_len + n].copy_from_slice(&buf[..n]);
                self.cmd_len += n;
            }
        }

        if self.cmd_len >= 2 && self.cmd_len >= self.cmd[1] as usize && usb.tx_ready() {
            self.process_command(usb);
        }
    }

    fn gw_info(&self) -> GwInfo {
        GwInfo {
            fw_major: crate::FW_MAJOR,
            fw_minor: crate::FW_MINOR,
            is_main_firmware: 1,
            max_cmd: CMD_MAX,
            sample_freq: flux_probe_core::time::SAMPLE_MHZ * 1_000_000,
            hw_model: 7,
            hw_submodel: 5,
            usb_buf_kb: (U_BUF_SZ >> 10) as u8,
            mcu_mhz: 72,
            mcu_sram_kb: 256,
        }
    }

    /// One main-loop iteration of the floppy worker.
    pub fn process(&mut self, usb: &mut USB) {
        let now = self.clock.now();
        self.opdelay.poll(now);
        if self.index_timer.poll(now) {
            index::refresh(now);
            self.index_timer.set(now.wrapping_add(index::REFRESH_PERIOD));
        }

        if self.watchdog_armed && time_diff(self.watchdog_deadline, now) >= 0 {
            rprintln!("Watchdog timeout: resetting pipeline");
            self.on_usb_configured();
            self.quiesce_drives();
        }

        match self.state {
            State::Inactive => {}

            State::CommandWait => self.command_wait(usb),

            State::Zlp => {
                if usb.tx_ready() {
                    usb.write_packet(&[]);
                    self.state = State::CommandWait;
                }
            }

            State::ReadFlux | State::ReadFluxDrain => self.floppy_read(usb),

            State::WriteFluxWaitData => self.write_wait_data(usb),
            State::WriteFluxWaitIndex => self.write_wait_index(),
            State::WriteFlux => self.floppy_write(usb),
            State::WriteFluxDrain => self.write_drain(usb),

            State::EraseFlux => self.floppy_erase(usb),

            State::SourceBytes => self.source_bytes(usb),
            State::SinkBytes => self.sink_bytes(usb),

            State::UpdateBootloader => self.update_continue(usb),

            State::TestMode => {
                self.watchdog_armed = false;
                self.testmode.process(self.clock, usb);
            }
        }
    }
}
