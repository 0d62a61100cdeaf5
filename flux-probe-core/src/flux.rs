//! Variable-length flux wire codec.
//!
//! The stream describes inter-transition intervals in sample ticks. Byte 0
//! terminates a host-to-device stream; 1-249 is a literal interval; 250-254
//! opens a two-byte interval (250-1524 ticks); 255 escapes to an opcode.
//! Opcode arguments are 28-bit values packed LSB-first into four bytes of
//! seven payload bits each, with bit 0 always set so no argument byte can be
//! mistaken for the stream terminator.

use crate::ring::HostRing;
use crate::time::{sample_ns, sample_us};
use crate::TimCnt;

pub const FLUXOP_INDEX: u8 = 1;
pub const FLUXOP_SPACE: u8 = 2;
pub const FLUXOP_ASTABLE: u8 = 3;

/// Shortest interval the write path will emit. Anything shorter is folded
/// into the following sample, preserving total elapsed time.
pub const MIN_PULSE: u32 = sample_ns(800);

fn write_28bit(ring: &mut HostRing, x: u32) {
    ring.push(1 | (x << 1) as u8);
    ring.push(1 | (x >> 6) as u8);
    ring.push(1 | (x >> 13) as u8);
    ring.push(1 | (x >> 20) as u8);
}

fn read_28bit(ring: &mut HostRing) -> u32 {
    let mut x = (ring.pop() >> 1) as u32;
    x |= ((ring.pop() & 0xfe) as u32) << 6;
    x |= ((ring.pop() & 0xfe) as u32) << 13;
    x |= ((ring.pop() & 0xfe) as u32) << 20;
    x
}

/// Read-path encoder: timer capture samples in, wire bytes out.
///
/// Tracks the previous capture value so each sample is emitted as a delta.
/// The producer side of the ring is unchecked; the caller watches the fill
/// level for overflow.
pub struct FluxEncoder {
    prev: TimCnt,
}

impl FluxEncoder {
    /// `start` is the capture counter's value when the operation began.
    pub fn new(start: TimCnt) -> Self {
        FluxEncoder { prev: start }
    }

    pub fn prev_sample(&self) -> TimCnt {
        self.prev
    }

    /// Record an index pulse observed at capture-counter value `rdata_cnt`,
    /// timestamped as a delta from the previous emitted sample.
    pub fn index(&mut self, ring: &mut HostRing, rdata_cnt: TimCnt) {
        let ticks = rdata_cnt.wrapping_sub(self.prev) as u32;
        ring.push(0xff);
        ring.push(FLUXOP_INDEX);
        write_28bit(ring, ticks);
    }

    /// Encode one capture sample.
    pub fn sample(&mut self, ring: &mut HostRing, sample: TimCnt) {
        let ticks = sample.wrapping_sub(self.prev) as u32;
        self.prev = sample;

        if ticks == 0 {
            // Skip.
        } else if ticks < 250 {
            ring.push(ticks as u8);
        } else {
            let high = (ticks - 250) / 255;
            if high < 5 {
                ring.push((250 + high) as u8);
                ring.push((1 + (ticks - 250) % 255) as u8);
            } else {
                ring.push(0xff);
                ring.push(FLUXOP_SPACE);
                write_28bit(ring, ticks - 249);
                ring.push(249);
            }
        }
    }

    /// If no transition has arrived for a long time, transfer part of the
    /// accumulated gap to the host as a long-gap sample. Keeping `prev` well
    /// behind the capture counter means this cannot race a real sample.
    pub fn pad_idle(&mut self, ring: &mut HostRing, cnt: TimCnt) {
        let gap = cnt.wrapping_sub(self.prev) as u32;
        if gap > sample_us(400) {
            let ticks = sample_us(200);
            ring.push(0xff);
            ring.push(FLUXOP_SPACE);
            write_28bit(ring, ticks);
            self.prev = self.prev.wrapping_add(ticks as TimCnt);
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum FluxMode {
    /// Generating no flux, awaiting the next command in the stream.
    Idle,
    /// Generating a single flux, split across counter-width chunks.
    Oneshot,
    /// Generating a region of oscillating flux.
    Astable,
}

/// The host stream carried an opcode the decoder does not recognise, or an
/// argument outside its legal range.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BadOpcode;

/// Write-path decoder: wire bytes in, timer auto-reload periods out.
///
/// Output values are `interval - 1` since the PWM timer counts 0..=ARR.
pub struct FluxDecoder {
    ticks: u32,
    mode: FluxMode,
    astable_period: u32,
    finished: bool,
}

impl FluxDecoder {
    pub fn new() -> Self {
        FluxDecoder {
            ticks: 0,
            mode: FluxMode::Idle,
            astable_period: 0,
            finished: false,
        }
    }

    /// True once the stream's terminating NUL has been consumed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode as many samples as are available into `out`. Returns the
    /// number of samples produced; stops early when the ring runs out of
    /// complete sequences, the stream terminates, or `out` fills up.
    pub fn decode(&mut self, ring: &mut HostRing, out: &mut [TimCnt]) -> Result<usize, BadOpcode> {
        let mut n = 0;
        let mut ticks = self.ticks;

        if out.is_empty() {
            return Ok(0);
        }

        match self.mode {
            FluxMode::Astable => {
                // Produce flux transitions at the specified period.
                let pulse = self.astable_period;
                while ticks >= pulse {
                    out[n] = (pulse - 1) as TimCnt;
                    n += 1;
                    ticks -= pulse;
                    if n == out.len() {
                        self.ticks = ticks;
                        return Ok(n);
                    }
                }
                self.mode = FluxMode::Idle;
            }

            FluxMode::Oneshot => {
                // If the gap to the next flux overflows the hardware counter,
                // insert full-period dummy fluxes until the residue fits.
                while ticks != ticks as TimCnt as u32 {
                    out[n] = TimCnt::max_value();
                    n += 1;
                    ticks = ticks.wrapping_sub((TimCnt::max_value() as u32).wrapping_add(1));
                    if n == out.len() {
                        self.ticks = ticks;
                        return Ok(n);
                    }
                }

                // Emit the residue unless it is too short, in which case it
                // merges into the next region.
                if ticks > MIN_PULSE {
                    out[n] = (ticks - 1) as TimCnt;
                    n += 1;
                    ticks = 0;
                    if n == out.len() {
                        self.ticks = ticks;
                        return Ok(n);
                    }
                }

                self.mode = FluxMode::Idle;
            }

            FluxMode::Idle => {}
        }

        while !ring.is_empty() {
            let x = ring.peek(0) as u32;
            let val;

            if x == 0 {
                ring.drain(1);
                self.finished = true;
                break;
            } else if x < 250 {
                ring.drain(1);
                val = x;
            } else if x < 255 {
                if ring.used() < 2 {
                    break;
                }
                ring.drain(1);
                val = 250 + (x - 250) * 255 + (ring.pop() as u32 - 1);
            } else {
                if ring.used() < 6 {
                    break;
                }
                let op = ring.peek(1);
                ring.drain(2);
                match op {
                    FLUXOP_SPACE => {
                        ticks = ticks.wrapping_add(read_28bit(ring));
                        continue;
                    }
                    FLUXOP_ASTABLE => {
                        let period = read_28bit(ring);
                        if period < MIN_PULSE || period != period as TimCnt as u32 {
                            self.ticks = ticks;
                            return Err(BadOpcode);
                        }
                        self.astable_period = period;
                        self.mode = FluxMode::Astable;
                        break;
                    }
                    _ => {
                        ring.drain(4);
                        self.ticks = ticks;
                        return Err(BadOpcode);
                    }
                }
            }

            ticks += val;

            // Too small: fold this transition into the next one.
            if ticks < MIN_PULSE {
                continue;
            }

            // Overflows the counter width: switch to chunked emission.
            if ticks != ticks as TimCnt as u32 {
                self.mode = FluxMode::Oneshot;
                break;
            }

            out[n] = (ticks - 1) as TimCnt;
            n += 1;
            ticks = 0;
            if n == out.len() {
                break;
            }
        }

        self.ticks = ticks;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_intervals(intervals: &[u32]) -> Vec<u8> {
        let mut mem = vec![0u8; 1 << 16];
        let mut ring = HostRing::new(&mut mem);
        let mut enc = FluxEncoder::new(0);
        let mut cnt: TimCnt = 0;
        for &iv in intervals {
            cnt = cnt.wrapping_add(iv as TimCnt);
            enc.sample(&mut ring, cnt);
        }
        ring.push(0);
        let n = ring.used() as usize;
        let mut out = vec![0u8; n];
        ring.read_into(&mut out);
        out
    }

    fn decode_all(stream: &[u8]) -> Vec<u32> {
        let mut mem = vec![0u8; 1 << 16];
        let mut ring = HostRing::new(&mut mem);
        ring.append(stream);
        let mut dec = FluxDecoder::new();
        let mut out = [0 as TimCnt; 64];
        let mut periods = Vec::new();
        loop {
            let n = dec.decode(&mut ring, &mut out).unwrap();
            periods.extend(out[..n].iter().map(|&p| p as u32 + 1));
            if n == 0 && (dec.is_finished() || ring.is_empty()) {
                break;
            }
        }
        periods
    }

    #[test]
    fn round_trip_recovers_intervals() {
        let intervals = [100, 249, 250, 1524, 1525, 10_000, 300_000, 57, 58];
        let stream = encode_intervals(&intervals);
        assert_eq!(decode_all(&stream), intervals.to_vec());
    }

    #[test]
    fn arg_bytes_never_contain_a_terminator() {
        let samples = [0u32, 1, 249, 9751, 0x1234_567, (1 << 28) - 1];
        for &x in &samples {
            let mut mem = [0u8; 16];
            let mut ring = HostRing::new(&mut mem);
            write_28bit(&mut ring, x);
            let mut bytes = [0u8; 4];
            ring.read_into(&mut bytes);
            for &b in &bytes {
                assert_ne!(b, 0);
                assert_eq!(b & 1, 1);
            }
        }
    }

    #[test]
    fn twenty_eight_bit_round_trip() {
        for &x in &[0u32, 1, 0x7f, 0x80, 9751, (1 << 28) - 1] {
            let mut mem = [0u8; 16];
            let mut ring = HostRing::new(&mut mem);
            write_28bit(&mut ring, x);
            assert_eq!(read_28bit(&mut ring), x);
        }
    }

    #[test]
    fn long_gap_becomes_space_plus_literal() {
        // A 10000-tick interval is sent as SPACE(9751) followed by a
        // literal 249.
        let stream = encode_intervals(&[10_000]);
        assert_eq!(stream[0], 0xff);
        assert_eq!(stream[1], FLUXOP_SPACE);
        assert_eq!(stream[6], 249);
        assert_eq!(stream[7], 0);
        let mut mem = [0u8; 16];
        let mut ring = HostRing::new(&mut mem);
        write_28bit(&mut ring, 9751);
        let mut arg = [0u8; 4];
        ring.read_into(&mut arg);
        assert_eq!(&stream[2..6], &arg);
        assert_eq!(decode_all(&stream), vec![10_000]);
    }

    #[test]
    fn index_opcode_carries_delta_from_previous_sample() {
        let mut mem = vec![0u8; 4096];
        let mut ring = HostRing::new(&mut mem);
        let mut enc = FluxEncoder::new(1000);
        enc.sample(&mut ring, 1100);
        enc.index(&mut ring, 1175);
        let mut bytes = [0u8; 7];
        ring.read_into(&mut bytes);
        assert_eq!(bytes[0], 100);
        assert_eq!(bytes[1], 0xff);
        assert_eq!(bytes[2], FLUXOP_INDEX);
        let mut mem2 = [0u8; 16];
        let mut r2 = HostRing::new(&mut mem2);
        r2.append(&bytes[3..7]);
        assert_eq!(read_28bit(&mut r2), 75);
    }

    #[test]
    fn idle_padding_emits_partial_space() {
        let mut mem = vec![0u8; 4096];
        let mut ring = HostRing::new(&mut mem);
        let mut enc = FluxEncoder::new(0);
        enc.pad_idle(&mut ring, sample_us(300) as TimCnt);
        assert!(ring.is_empty());
        enc.pad_idle(&mut ring, sample_us(401) as TimCnt);
        assert_eq!(ring.used(), 6);
        assert_eq!(enc.prev_sample(), sample_us(200) as TimCnt);
        // The next real sample still round-trips to the correct total.
        let mut bytes = [0u8; 6];
        ring.read_into(&mut bytes);
        assert_eq!(bytes[1], FLUXOP_SPACE);
    }

    #[test]
    fn sub_minimum_pulses_fold_into_the_next_sample() {
        assert_eq!(decode_all(&[30, 40, 100, 0]), vec![70, 100]);
    }

    #[test]
    fn astable_generates_a_pulse_train() {
        let mut mem = vec![0u8; 4096];
        let mut ring = HostRing::new(&mut mem);
        // Accumulate 1000 ticks of space, then oscillate at 100 ticks.
        ring.push(0xff);
        ring.push(FLUXOP_SPACE);
        write_28bit(&mut ring, 1000);
        ring.push(0xff);
        ring.push(FLUXOP_ASTABLE);
        write_28bit(&mut ring, 100);
        ring.push(200);
        ring.push(0);

        let mut dec = FluxDecoder::new();
        let mut out = [0 as TimCnt; 32];
        let mut periods = Vec::new();
        loop {
            let n = dec.decode(&mut ring, &mut out).unwrap();
            periods.extend(out[..n].iter().map(|&p| p as u32 + 1));
            if n == 0 && dec.is_finished() {
                break;
            }
        }
        assert_eq!(&periods[..10], &[100; 10]);
        // 1000 % 100 == 0, so the trailing literal stands alone.
        assert_eq!(periods[10], 200);
        assert_eq!(periods.len(), 11);
    }

    #[test]
    fn astable_below_min_pulse_is_rejected() {
        let mut mem = vec![0u8; 64];
        let mut ring = HostRing::new(&mut mem);
        ring.push(0xff);
        ring.push(FLUXOP_ASTABLE);
        write_28bit(&mut ring, MIN_PULSE - 1);
        let mut out = [0 as TimCnt; 4];
        assert_eq!(
            FluxDecoder::new().decode(&mut ring, &mut out),
            Err(BadOpcode)
        );
    }

    #[test]
    fn unknown_opcode_is_rejected_after_consuming_its_bytes() {
        let mut mem = vec![0u8; 64];
        let mut ring = HostRing::new(&mut mem);
        ring.push(0xff);
        ring.push(0x77);
        write_28bit(&mut ring, 1);
        ring.push(100);
        let mut dec = FluxDecoder::new();
        let mut out = [0 as TimCnt; 4];
        assert_eq!(dec.decode(&mut ring, &mut out), Err(BadOpcode));
        // The bad sequence was consumed; the stream can keep draining.
        assert_eq!(ring.used(), 1);
    }

    #[test]
    fn decoder_waits_for_complete_sequences() {
        let mut mem = vec![0u8; 64];
        let mut ring = HostRing::new(&mut mem);
        ring.push(250);
        let mut dec = FluxDecoder::new();
        let mut out = [0 as TimCnt; 4];
        assert_eq!(dec.decode(&mut ring, &mut out), Ok(0));
        ring.push(1);
        assert_eq!(dec.decode(&mut ring, &mut out), Ok(1));
        assert_eq!(out[0] as u32 + 1, 250);
    }

    #[test]
    fn terminator_finishes_the_stream() {
        let mut mem = vec![0u8; 64];
        let mut ring = HostRing::new(&mut mem);
        ring.append(&[100, 0]);
        let mut dec = FluxDecoder::new();
        let mut out = [0 as TimCnt; 4];
        assert_eq!(dec.decode(&mut ring, &mut out), Ok(1));
        assert!(dec.is_finished());
        assert!(ring.is_empty());
    }
}
