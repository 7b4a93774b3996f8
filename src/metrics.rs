//! Per-state meters (spec §3: "count, elapsed-cycles, optional
//! vtime-start, optional histogram").

use crate::time::{Cycles, Vtime};

/// A coarse log2-bucketed histogram of elapsed-cycle durations.
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: [u64; 64],
}

impl Default for Histogram {
    fn default() -> Self {
        Self { buckets: [0; 64] }
    }
}

impl Histogram {
    pub fn record(&mut self, value: u64) {
        let bucket = if value == 0 {
            0
        } else {
            (64 - value.leading_zeros()) as usize
        };
        self.buckets[bucket.min(63)] += 1;
    }

    pub fn total_samples(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn buckets(&self) -> &[u64; 64] {
        &self.buckets
    }
}

/// One meter: entered on a state transition, exited when the state is
/// left. Tracks both a real-time view (elapsed cycles, histogram) and,
/// optionally, the virtual-time instant the state was entered at (used
/// by wait-state accounting to credit the owning vsmp).
#[derive(Debug, Clone, Default)]
pub struct Meter {
    pub count: u64,
    pub elapsed_cycles: u64,
    pub vtime_start: Option<Vtime>,
    pub histogram: Histogram,
    entry_cycles: Option<Cycles>,
}

impl Meter {
    pub fn enter(&mut self, now_cycles: Cycles, vtime_start: Option<Vtime>) {
        self.entry_cycles = Some(now_cycles);
        self.vtime_start = vtime_start;
    }

    /// Leave the state, folding the elapsed duration into the running
    /// total and the histogram. Returns the elapsed cycles so callers
    /// can also charge it elsewhere (e.g. onto `chargeCyclesTotal`).
    pub fn exit(&mut self, now_cycles: Cycles) -> Cycles {
        let elapsed = match self.entry_cycles.take() {
            Some(start) => now_cycles.saturating_sub(start),
            None => 0,
        };
        self.count += 1;
        self.elapsed_cycles += elapsed;
        self.histogram.record(elapsed);
        self.vtime_start = None;
        elapsed
    }

    pub fn is_active(&self) -> bool {
        self.entry_cycles.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_accumulates_elapsed_time() {
        let mut m = Meter::default();
        m.enter(100, None);
        let elapsed = m.exit(150);
        assert_eq!(elapsed, 50);
        assert_eq!(m.count, 1);
        assert_eq!(m.elapsed_cycles, 50);
    }

    #[test]
    fn histogram_buckets_by_log2() {
        let mut h = Histogram::default();
        h.record(1);
        h.record(1023);
        h.record(1024);
        assert_eq!(h.total_samples(), 3);
    }
}
