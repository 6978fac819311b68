//! Microsecond time base shared by the scheduler, the channels and the task queue.
//!
//! All timepoints count microseconds since a process-wide epoch captured on first
//! use, so logical fiber time and wall-clock time are directly comparable.

use lazy_static::lazy_static;
use std::time::Instant;

/// Microseconds since the process-wide epoch.
pub type Timepoint = u64;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Current wall-clock time in microseconds.
pub fn now() -> Timepoint {
    EPOCH.elapsed().as_micros() as Timepoint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now();
        std::thread::sleep(std::time::Duration::from_micros(200));
        let b = now();
        assert!(b >= a + 200);
    }
}
