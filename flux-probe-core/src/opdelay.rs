//! Post-operation settling delays.
//!
//! Mechanical operations impose settling time on later, conflicting ones: a
//! seek must not start while the previous seek settles, a write must not
//! start inside the post-write window, and so on. Rather than blocking at
//! the point that imposes the delay, the affected operation classes are
//! recorded in a mask with a deadline; the next conflicting operation waits.
//!
//! Overlapping schedules keep the later deadline, so no pending class is
//! ever released early; the expiry clears the whole mask at once.

use crate::time::time_diff;
use crate::timer::Timer;

pub const DELAY_READ: u8 = 1 << 0;
pub const DELAY_WRITE: u8 = 1 << 1;
pub const DELAY_SEEK: u8 = 1 << 2;
pub const DELAY_HEAD: u8 = 1 << 3;

pub struct OpDelay {
    mask: u8,
    timer: Timer,
}

impl OpDelay {
    pub const fn new() -> Self {
        OpDelay {
            mask: 0,
            timer: Timer::new(),
        }
    }

    /// Require the operations in `mask` to wait until `deadline`.
    pub fn schedule(&mut self, mask: u8, deadline: u32) {
        let mut deadline = deadline;
        if self.mask != 0 && time_diff(self.timer.deadline(), deadline) < 0 {
            deadline = self.timer.deadline();
        }
        self.mask |= mask;
        self.timer.set(deadline);
    }

    /// True while any operation in `mask` must still wait.
    pub fn pending(&self, mask: u8) -> bool {
        self.mask & mask != 0
    }

    pub fn poll(&mut self, now: u32) {
        if self.timer.poll(now) {
            self.mask = 0;
        }
    }

    pub fn reset(&mut self) {
        self.mask = 0;
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_at_deadline() {
        let mut od = OpDelay::new();
        od.schedule(DELAY_SEEK, 1000);
        assert!(od.pending(DELAY_SEEK));
        assert!(!od.pending(DELAY_READ));
        od.poll(999);
        assert!(od.pending(DELAY_SEEK));
        od.poll(1000);
        assert!(!od.pending(DELAY_SEEK));
    }

    #[test]
    fn overlapping_schedules_keep_the_later_deadline() {
        let mut od = OpDelay::new();
        od.schedule(DELAY_READ, 1000);
        od.schedule(DELAY_WRITE, 500);
        // The earlier request must not release the pending read early.
        od.poll(500);
        assert!(od.pending(DELAY_READ));
        assert!(od.pending(DELAY_WRITE));
        od.poll(1000);
        assert!(!od.pending(DELAY_READ | DELAY_WRITE));
    }

    #[test]
    fn rescheduling_extends_the_deadline() {
        let mut od = OpDelay::new();
        od.schedule(DELAY_WRITE, 500);
        od.schedule(DELAY_WRITE, 2000);
        od.poll(600);
        assert!(od.pending(DELAY_WRITE));
        od.poll(2000);
        assert!(!od.pending(DELAY_WRITE));
    }

    #[test]
    fn expiry_clears_all_classes_together() {
        let mut od = OpDelay::new();
        od.schedule(DELAY_READ | DELAY_WRITE | DELAY_SEEK, 300);
        od.poll(300);
        assert!(!od.pending(DELAY_READ | DELAY_WRITE | DELAY_SEEK | DELAY_HEAD));
    }
}
