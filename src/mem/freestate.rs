//! Host free-memory state machine (spec §4.J).
//!
//! Four states, entered and left at different (hysteretic) thresholds
//! so the machine doesn't chatter back and forth across a single
//! percentage boundary under normal noise. Thresholds come from
//! [`crate::config::SchedConfig`] rather than being hardcoded here, so an
//! operator can retune them the same way every other scheduler knob is
//! retuned.

use crate::config::SchedConfig;

/// Host-wide free-memory pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FreeState {
    High,
    Soft,
    Hard,
    Low,
}

struct Thresholds {
    soft_enter: u8,
    hard_enter: u8,
    low_enter: u8,
    soft_exit: u8,
    hard_exit: u8,
    low_exit: u8,
}

impl Thresholds {
    fn from_config(config: &SchedConfig) -> Self {
        let margin = config.mem_free_hysteresis_percent;
        let soft_enter = config.mem_min_free_percent;
        let hard_enter = config.mem_ctl_hard_free_percent;
        let low_enter = config.mem_ctl_low_free_percent;
        Self {
            soft_enter,
            hard_enter,
            low_enter,
            soft_exit: soft_enter.saturating_add(margin),
            hard_exit: hard_enter.saturating_add(margin),
            low_exit: low_enter.saturating_add(margin),
        }
    }

    fn below_enter(&self, free_percent: u8) -> FreeState {
        if free_percent < self.low_enter {
            FreeState::Low
        } else if free_percent < self.hard_enter {
            FreeState::Hard
        } else {
            FreeState::Soft
        }
    }
}

impl FreeState {
    /// Advance the state machine given the current free-memory percent
    /// and the previous state, applying hysteresis so state changes
    /// require crossing the exit threshold of the state being left, not
    /// merely re-crossing the enter threshold (spec §4.J free-state
    /// machine).
    pub fn update(previous: FreeState, free_percent: u8, config: &SchedConfig) -> FreeState {
        let t = Thresholds::from_config(config);
        match previous {
            FreeState::High => {
                if free_percent < t.soft_enter {
                    t.below_enter(free_percent)
                } else {
                    FreeState::High
                }
            }
            FreeState::Soft => {
                if free_percent >= t.soft_exit {
                    FreeState::High
                } else if free_percent < t.hard_enter {
                    t.below_enter(free_percent)
                } else {
                    FreeState::Soft
                }
            }
            FreeState::Hard => {
                if free_percent >= t.hard_exit {
                    FreeState::Soft
                } else if free_percent < t.low_enter {
                    FreeState::Low
                } else {
                    FreeState::Hard
                }
            }
            FreeState::Low => {
                if free_percent >= t.low_exit {
                    FreeState::Hard
                } else {
                    FreeState::Low
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SchedConfig {
        SchedConfig::default()
    }

    #[test]
    fn falls_through_levels_as_memory_drops() {
        let cfg = cfg();
        let mut state = FreeState::High;
        state = FreeState::update(state, 20, &cfg);
        assert_eq!(state, FreeState::High);
        state = FreeState::update(state, 5, &cfg);
        assert_eq!(state, FreeState::Soft);
        state = FreeState::update(state, 3, &cfg);
        assert_eq!(state, FreeState::Hard);
        state = FreeState::update(state, 1, &cfg);
        assert_eq!(state, FreeState::Low);
    }

    #[test]
    fn hysteresis_prevents_chatter_at_the_boundary() {
        let cfg = cfg();
        let state = FreeState::Soft;
        // 6 is the enter threshold but below the 7 exit threshold: a
        // Soft state should not bounce back to High here.
        assert_eq!(FreeState::update(state, 6, &cfg), FreeState::Soft);
        assert_eq!(FreeState::update(state, 7, &cfg), FreeState::High);
    }

    #[test]
    fn recovers_one_level_at_a_time() {
        let cfg = cfg();
        let state = FreeState::Low;
        assert_eq!(FreeState::update(state, 2, &cfg), FreeState::Low);
        assert_eq!(FreeState::update(state, 3, &cfg), FreeState::Hard);
    }

    #[test]
    fn thresholds_are_driven_by_config_not_hardcoded() {
        let mut cfg = cfg();
        cfg.mem_min_free_percent = 50;
        cfg.mem_ctl_hard_free_percent = 30;
        cfg.mem_ctl_low_free_percent = 10;
        cfg.mem_free_hysteresis_percent = 5;
        let state = FreeState::update(FreeState::High, 49, &cfg);
        assert_eq!(state, FreeState::Soft);
        let state = FreeState::update(state, 29, &cfg);
        assert_eq!(state, FreeState::Hard);
    }
}
