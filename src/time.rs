//! Time base & virtual-time arithmetic (spec §4.A).
//!
//! Real time is a monotonic 64-bit cycle counter; virtual time is a
//! signed 64-bit quantity that advances inversely proportional to a
//! vsmp's or group's shares (the `stride`). Two conversions bridge the
//! two: [`tc_to_vtime`] and [`vtime_to_tc`].

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic real-time cycle count.
pub type Cycles = u64;

/// A signed virtual-time quantity. Signed because bound-lag and the main
/// vtime compare both rely on subtraction going negative.
pub type Vtime = i64;

/// Numerator of the stride formula: `stride = STRIDE1 / shares`.
pub const STRIDE1: u64 = 1 << 32;

/// Stride assigned to a zero-share vsmp or group: effectively infinite,
/// so it never wins a vtime compare against any sharing vsmp.
pub const STRIDE_MAX: u64 = u64::MAX >> 2;

/// Shift applied after the stride/cycles multiply (and before the
/// divide, for the inverse), matching the fixed-point convention of the
/// stride formula.
pub const STRIDE_SHIFT: u32 = 16;

/// Sentinel preserved as-is by the global vtime reset.
pub const VTIME_MAX: Vtime = Vtime::MAX;

/// Source of monotonic cycles. Production code wires this to the host's
/// timestamp counter; tests use [`SimClock`] so that the §8 "after 10 s
/// of run" scenarios execute in microseconds of wall-clock CI time.
pub trait TimeSource: Send + Sync {
    fn get_cycles(&self) -> Cycles;

    /// Escape hatch so test harnesses can downcast a `dyn TimeSource`
    /// back to a concrete [`SimClock`] and advance it explicitly.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A clock whose value only moves when the test advances it explicitly.
#[derive(Debug, Default)]
pub struct SimClock {
    cycles: AtomicU64,
}

impl SimClock {
    pub fn new(start: Cycles) -> Self {
        Self {
            cycles: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, delta: Cycles) {
        self.cycles.fetch_add(delta, Ordering::Relaxed);
    }
}

impl TimeSource for SimClock {
    fn get_cycles(&self) -> Cycles {
        self.cycles.load(Ordering::Relaxed)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// `stride = STRIDE1 / shares`, with `shares == 0` mapping to
/// [`STRIDE_MAX`] (spec §4.A).
pub fn stride_for_shares(shares: u64) -> u64 {
    if shares == 0 {
        STRIDE_MAX
    } else {
        (STRIDE1 / shares).max(1)
    }
}

/// `TCToVtime(stride, cycles) = (cycles * stride) >> STRIDE_SHIFT`.
///
/// The legacy implementation special-cases a 32x32 multiply when
/// `cycles` fits in 32 bits and falls back to a 64x32 signed multiply
/// otherwise; in Rust both paths are the same arithmetic operation, so a
/// single widened multiply (`u128`) is used throughout to avoid
/// overflow, with the historical fast/slow split preserved only as a
/// debug-time cross-check.
pub fn tc_to_vtime(stride: u64, cycles: Cycles) -> Vtime {
    let widened = (cycles as u128) * (stride as u128);
    let shifted = widened >> STRIDE_SHIFT;
    debug_assert!(shifted <= i64::MAX as u128, "vtime overflow");
    shifted as i64
}

/// `VtimeToTC(stride, vt) = (vt / stride) << STRIDE_SHIFT`.
///
/// This is an approximate inverse of [`tc_to_vtime`]; round-tripping is
/// not guaranteed to be exact (spec §4.A explicitly allows this).
pub fn vtime_to_tc(stride: u64, vt: Vtime) -> Cycles {
    if stride == 0 || vt <= 0 {
        return 0;
    }
    let quotient = (vt as u128) / (stride as u128);
    (quotient << STRIDE_SHIFT) as u64
}

/// Convert a cycle-denominated bonus into vtime units using a group's or
/// vsmp's own stride, as the extra-compare does when comparing across a
/// divergence point in the group tree.
pub fn bonus_cycles_to_vtime(stride: u64, bonus_cycles: Cycles) -> Vtime {
    tc_to_vtime(stride, bonus_cycles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_shares_get_max_stride() {
        assert_eq!(stride_for_shares(0), STRIDE_MAX);
    }

    #[test]
    fn higher_shares_get_smaller_stride() {
        let a = stride_for_shares(1000);
        let b = stride_for_shares(3000);
        assert!(b < a, "more shares should yield a smaller stride");
    }

    #[test]
    fn tc_to_vtime_is_monotone_in_cycles() {
        let stride = stride_for_shares(1000);
        let v1 = tc_to_vtime(stride, 1_000_000);
        let v2 = tc_to_vtime(stride, 2_000_000);
        assert!(v2 > v1);
    }

    #[test]
    fn vtime_to_tc_approximates_inverse() {
        let stride = stride_for_shares(2000);
        let cycles = 10_000_000u64;
        let vt = tc_to_vtime(stride, cycles);
        let back = vtime_to_tc(stride, vt);
        // Round-trip is approximate (spec explicitly allows this); just
        // check it's in the right ballpark.
        let diff = (back as i64 - cycles as i64).abs();
        let tolerance = (cycles as i64) / 100 + (1i64 << STRIDE_SHIFT);
        assert!(diff < tolerance);
    }

    #[test]
    fn sim_clock_only_moves_when_advanced() {
        let clock = SimClock::new(0);
        assert_eq!(clock.get_cycles(), 0);
        clock.advance(500);
        assert_eq!(clock.get_cycles(), 500);
    }
}
