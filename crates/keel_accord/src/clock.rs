//! Hybrid logical clock.
//!
//! Each node owns one clock. Samples are strictly increasing; observing a
//! remote timestamp pulls the local clock past it so causally-later samples
//! sort later everywhere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical counter within an HLC sample.
/// Wall-clock microseconds occupy the remaining high bits.
pub const LOGICAL_BITS: u32 = 16;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX >> LOGICAL_BITS)) as u64
}

/// Hybrid logical clock: `(wall_micros << LOGICAL_BITS) | logical`.
///
/// A single CAS loop serves both `next` and `observe`, so concurrent callers
/// on one node never draw equal samples.
#[derive(Debug)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(wall_micros() << LOGICAL_BITS),
        }
    }

    /// Produce a strictly increasing sample.
    pub fn next(&self) -> u64 {
        self.advance_past(0)
    }

    /// Fold a remote sample into the clock and return a sample strictly
    /// greater than both the remote and anything previously issued locally.
    pub fn observe(&self, remote: u64) -> u64 {
        self.advance_past(remote)
    }

    /// Read the latest issued sample without advancing.
    pub fn peek(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    fn advance_past(&self, floor: u64) -> u64 {
        let physical = wall_micros() << LOGICAL_BITS;
        loop {
            let last = self.last.load(Ordering::Acquire);
            let next = physical.max(last + 1).max(floor + 1);
            if self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a sample into `(wall_micros, logical)`, for logging.
pub fn decompose(hlc: u64) -> (u64, u64) {
    (hlc >> LOGICAL_BITS, hlc & LOGICAL_MASK)
}
