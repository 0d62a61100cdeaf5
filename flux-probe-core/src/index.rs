//! Index-pulse recognition.
//!
//! The IRQ wiring lives in the firmware crate; this is the decision logic,
//! fed with the monotonic time of each falling edge and the capture
//! counter's value at that instant.
//!
//! Soft-sector media has one hole per revolution and every accepted edge is
//! an index. Hard-sector media punches one hole per sector plus an extra
//! hole close to the true index; two short hole-to-hole gaps in a row mark
//! it. The detector primes on the first short gap (the extra hole), fires on
//! the second (the first sector hole) and unprimes on any long gap.

use crate::time::{time_diff, time_from_samples, time_us};
use crate::TimCnt;

pub struct IndexDetector {
    /// Free-running pulse counter. The owner resets it at will.
    pub count: u32,
    /// Capture counter at the last accepted index, for timestamping index
    /// pulses inside the flux stream.
    pub rdata_cnt: TimCnt,
    hard_sector_thresh: u32,
    hard_sector_primed: bool,
    trigger_time: u32,
}

impl IndexDetector {
    pub const fn new() -> Self {
        IndexDetector {
            count: 0,
            rdata_cnt: 0,
            hard_sector_thresh: 0,
            hard_sector_primed: false,
            trigger_time: 0,
        }
    }

    /// Arm hard-sector detection with the expected hole-to-hole spacing in
    /// sample ticks, or disarm with 0.
    pub fn set_hard_sector_ticks(&mut self, ticks: u32) {
        self.hard_sector_thresh = time_from_samples(ticks) * 3 / 4;
        self.hard_sector_primed = false;
    }

    /// Process one falling edge. Returns true if it counted as an index.
    pub fn pulse(&mut self, now: u32, cnt: TimCnt, mask_us: u32) -> bool {
        let delta = time_diff(self.trigger_time, now);
        if delta < time_us(mask_us) as i32 {
            // Glitch: too soon after the previous accepted edge.
            return false;
        }
        self.trigger_time = now;

        if self.hard_sector_thresh != 0 {
            if delta as u32 > self.hard_sector_thresh {
                // Long gap: an ordinary sector hole. Unprime.
                self.hard_sector_primed = false;
                return false;
            }
            self.hard_sector_primed = !self.hard_sector_primed;
            if self.hard_sector_primed {
                // First short gap: the extra hole itself. Don't count it.
                return false;
            }
        }

        self.count += 1;
        self.rdata_cnt = cnt;
        true
    }

    /// Periodic refresh: keeps `trigger_time` recent enough that the glitch
    /// test's signed difference cannot be wrecked by 32-bit wrap during long
    /// idle spells. Called every `period` ticks.
    pub fn refresh(&mut self, now: u32, period: u32) {
        if time_diff(self.trigger_time, now) > period as i32 {
            self.trigger_time = now.wrapping_sub(period);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{time_ms, time_us};

    const MASK_US: u32 = 200;

    #[test]
    fn soft_sector_counts_every_pulse() {
        let mut d = IndexDetector::new();
        let mut now = time_ms(10);
        for n in 1..=5 {
            assert!(d.pulse(now, now as TimCnt, MASK_US));
            assert_eq!(d.count, n);
            now = now.wrapping_add(time_ms(200));
        }
    }

    #[test]
    fn glitches_inside_the_mask_are_ignored() {
        let mut d = IndexDetector::new();
        let t0 = time_ms(10);
        assert!(d.pulse(t0, 1, MASK_US));
        assert!(!d.pulse(t0 + time_us(50), 2, MASK_US));
        assert_eq!(d.count, 1);
        assert_eq!(d.rdata_cnt, 1);
        // And the glitch did not refresh the trigger time.
        assert!(d.pulse(t0 + time_us(MASK_US), 3, MASK_US));
    }

    #[test]
    fn hard_sector_counts_second_short_pulse_of_each_pair() {
        let mut d = IndexDetector::new();
        // 10 ms hole-to-hole: threshold is 7.5 ms.
        d.set_hard_sector_ticks(crate::time::sample_us(10_000));
        let mut now = time_ms(100);

        // Sector holes arriving every 10 ms: long gaps, never counted.
        for _ in 0..4 {
            assert!(!d.pulse(now, 0, MASK_US));
            now = now.wrapping_add(time_ms(10));
        }

        // The extra hole 5 ms after a sector hole primes, the next sector
        // hole 5 ms later fires.
        now = now.wrapping_add(time_ms(5)).wrapping_sub(time_ms(10));
        assert!(!d.pulse(now, 7, MASK_US));
        now = now.wrapping_add(time_ms(5));
        assert!(d.pulse(now, 8, MASK_US));
        assert_eq!(d.count, 1);
        assert_eq!(d.rdata_cnt, 8);

        // Back to plain sector holes.
        now = now.wrapping_add(time_ms(10));
        assert!(!d.pulse(now, 9, MASK_US));
    }

    #[test]
    fn all_short_pulses_count_every_second_one() {
        let mut d = IndexDetector::new();
        d.set_hard_sector_ticks(crate::time::sample_us(10_000));
        let mut now = time_ms(100);
        let mut counted = 0;
        for _ in 0..8 {
            if d.pulse(now, 0, MASK_US) {
                counted += 1;
            }
            now = now.wrapping_add(time_ms(5));
        }
        assert_eq!(counted, 4);
        assert_eq!(d.count, 4);
    }

    #[test]
    fn long_gap_cancels_priming() {
        let mut d = IndexDetector::new();
        d.set_hard_sector_ticks(crate::time::sample_us(10_000));
        let mut now = time_ms(100);
        assert!(!d.pulse(now, 0, MASK_US));
        now = now.wrapping_add(time_ms(5));
        assert!(!d.pulse(now, 0, MASK_US)); // primes
        now = now.wrapping_add(time_ms(10)); // long gap unprimes
        assert!(!d.pulse(now, 0, MASK_US));
        now = now.wrapping_add(time_ms(5)); // short again: primes only
        assert!(!d.pulse(now, 0, MASK_US));
        assert_eq!(d.count, 0);
    }

    #[test]
    fn refresh_bounds_trigger_age() {
        let mut d = IndexDetector::new();
        let period = time_ms(5000);
        d.pulse(time_ms(10), 0, MASK_US);
        let later = time_ms(10).wrapping_add(period * 3);
        d.refresh(later, period);
        // An edge just after the refresh is still outside the glitch mask.
        assert!(d.pulse(later.wrapping_add(time_us(MASK_US)), 0, MASK_US));
    }
}
