//! Hyperthread machine-clear quarantine (spec §4.I).
//!
//! A vcpu whose recent machine-clear rate is abnormally high is presumed
//! to be thrashing its HT partner via shared execution-unit contention,
//! and is quarantined onto whole packages until its rate recovers.

use crate::vcpu::HtInterference;

/// Sampling cadence: a rate sample is taken roughly once per this many
/// cycles of run time, bounding the per-vcpu sampling overhead to about
/// the spec's "~1ms of run time" budget.
pub const SAMPLE_INTERVAL_CYCLES: u64 = 1_000_000;

/// Enter quarantine once the fast EWMA exceeds this many machine clears
/// per sampled interval.
pub const QUARANTINE_ENTER_THRESHOLD: f64 = 500.0;

/// Leave quarantine once the slow EWMA drops below this.
pub const QUARANTINE_EXIT_THRESHOLD: f64 = 100.0;

/// Feed one sample (cleared count observed over `cycles` of run time)
/// into a vcpu's interference tracker and decide whether its quarantine
/// state should flip.
///
/// Returns `Some(true)` to enter quarantine, `Some(false)` to leave it,
/// or `None` if the state shouldn't change.
pub fn sample(
    interference: &mut HtInterference,
    currently_quarantined: bool,
    clears: u32,
    cycles: u64,
) -> Option<bool> {
    interference.sample(clears, cycles);
    if !currently_quarantined && interference.fast_avg >= QUARANTINE_ENTER_THRESHOLD {
        log::info!(
            "ht_quarantine: entering quarantine, fast_avg={:.1}",
            interference.fast_avg
        );
        Some(true)
    } else if currently_quarantined && interference.slow_avg < QUARANTINE_EXIT_THRESHOLD {
        log::info!(
            "ht_quarantine: exiting quarantine, slow_avg={:.1}",
            interference.slow_avg
        );
        Some(false)
    } else {
        None
    }
}

/// Whether it's time to take another sample, given cycles charged to the
/// vcpu since the last one (spec §4.I sampling cadence).
pub fn due(cycles_since_last_sample: u64) -> bool {
    cycles_since_last_sample >= SAMPLE_INTERVAL_CYCLES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sustained_high_clear_rate_enters_quarantine() {
        let mut interference = HtInterference::default();
        let mut quarantined = false;
        for _ in 0..20 {
            if let Some(new_state) = sample(&mut interference, quarantined, 600, SAMPLE_INTERVAL_CYCLES) {
                quarantined = new_state;
            }
        }
        assert!(quarantined);
    }

    #[test]
    fn recovery_exits_quarantine() {
        let mut interference = HtInterference::default();
        let mut quarantined = false;
        for _ in 0..20 {
            if let Some(s) = sample(&mut interference, quarantined, 600, SAMPLE_INTERVAL_CYCLES) {
                quarantined = s;
            }
        }
        assert!(quarantined);
        for _ in 0..50 {
            if let Some(s) = sample(&mut interference, quarantined, 0, SAMPLE_INTERVAL_CYCLES) {
                quarantined = s;
            }
        }
        assert!(!quarantined);
    }

    #[test]
    fn occasional_spike_does_not_trip_quarantine() {
        let mut interference = HtInterference::default();
        let mut quarantined = false;
        for i in 0..20 {
            let clears = if i == 5 { 2000 } else { 10 };
            if let Some(s) = sample(&mut interference, quarantined, clears, SAMPLE_INTERVAL_CYCLES) {
                quarantined = s;
            }
        }
        assert!(!quarantined);
    }
}
