//! One memory client (a guest) tracked by the memory scheduler (spec
//! §3 Group/Client data model, §4.J).

use crate::config::SchedConfig;
use crate::ids::ClientId;
use crate::time::Cycles;

/// Guest operating system family, selecting which `mem_ctl_max_*`
/// ceiling bounds this client's balloon target (spec §4.J commit step,
/// §6 `MemCtlMax{NT4,NT5,Linux,BSD}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOs {
    Nt4,
    Nt5,
    Linux,
    Bsd,
}

/// A guest's memory footprint and entitlement, as seen by the memory
/// scheduler.
#[derive(Debug, Clone)]
pub struct MemClient {
    pub id: ClientId,
    pub guest_os: GuestOs,
    /// Pages actually mapped in by the guest.
    pub allocated_pages: u64,
    /// Estimated pages the guest is actually touching, from the idle
    /// page sampler (spec §4.J step 1).
    pub active_pages: u64,
    /// Administrator min/max, in pages.
    pub min_pages: u64,
    pub max_pages: u64,
    pub shares: u32,
    /// Target computed by the last balance pass.
    pub target_pages: u64,
    /// What the balloon driver was last asked to inflate to.
    pub balloon_target_pages: u64,
    /// What the swap subsystem was last asked to page out to, when the
    /// balloon driver can't keep up, or when the balloon target alone
    /// would exceed `balloon_max_pages` (spec §4.J step 4).
    pub swap_target_pages: u64,
    /// The balloon driver hasn't acknowledged a size change within the
    /// expected window; the scheduler must fall back to swap for the
    /// whole shortfall (spec §4.J "non-responsive client"). Derived
    /// automatically by [`Self::update_nonresponsive`] from
    /// `last_ack_cycles`; `None` means no ack has ever been observed and
    /// the client is assumed responsive.
    pub balloon_unresponsive: bool,
    last_ack_cycles: Option<Cycles>,
    /// Number of consecutive sample periods this client could have used
    /// more memory than its target (spec §4.J share-scan histeresis).
    pub share_scan_count: u32,
}

impl MemClient {
    pub fn new(id: ClientId, min_pages: u64, max_pages: u64, shares: u32) -> Self {
        Self {
            id,
            guest_os: GuestOs::Linux,
            allocated_pages: 0,
            active_pages: 0,
            min_pages,
            max_pages,
            shares,
            target_pages: min_pages,
            balloon_target_pages: 0,
            swap_target_pages: 0,
            balloon_unresponsive: false,
            last_ack_cycles: None,
            share_scan_count: 0,
        }
    }

    pub fn with_guest_os(mut self, guest_os: GuestOs) -> Self {
        self.guest_os = guest_os;
        self
    }

    /// Pages this client is "charged" for once idle pages are taxed at
    /// `idle_cost` (spec §4.J step 3): active pages cost their full
    /// weight, idle pages cost more, so a client hoarding idle memory
    /// looks more expensive and loses ground in the proportional split.
    pub fn charged_pages(&self, idle_cost: f64) -> f64 {
        let idle = self.allocated_pages.saturating_sub(self.active_pages) as f64;
        self.active_pages as f64 + idle * idle_cost
    }

    /// How many pages above target this client must shed, given its
    /// current target. Zero if it's at or below target.
    pub fn shortfall(&self) -> u64 {
        self.allocated_pages.saturating_sub(self.target_pages)
    }

    /// The largest balloon target this client may be given: the lower of
    /// its guest-OS-specific ceiling and `max_pages` scaled by
    /// `mem_ctl_max_percent` (spec §4.J commit step, SPEC_FULL.md's
    /// guest-type-aware balloon ceilings resolution).
    pub fn balloon_max_pages(&self, config: &SchedConfig) -> u64 {
        let guest_ceiling_mb = match self.guest_os {
            GuestOs::Nt4 => config.mem_ctl_max_nt4_mb,
            GuestOs::Nt5 => config.mem_ctl_max_nt5_mb,
            GuestOs::Linux => config.mem_ctl_max_linux_mb,
            GuestOs::Bsd => config.mem_ctl_max_bsd_mb,
        };
        let guest_ceiling_pages = crate::mem::mb_to_pages(guest_ceiling_mb);
        let percent_ceiling_pages = self.max_pages * config.mem_ctl_max_percent as u64 / 100;
        guest_ceiling_pages.min(percent_ceiling_pages)
    }

    /// Record that the balloon driver acknowledged a size change at
    /// `now`, resetting the non-responsiveness window.
    pub fn record_balloon_ack(&mut self, now: Cycles) {
        self.last_ack_cycles = Some(now);
        self.balloon_unresponsive = false;
    }

    /// Recompute `balloon_unresponsive` from how long it's been since the
    /// last acknowledged balloon size change (spec §4.J "non-responsive
    /// client", ≈15s default window). A client that has never acked is
    /// treated as responsive until the window actually elapses from its
    /// creation, so call this once with `now` at client creation to seed
    /// `last_ack_cycles` if immediate detection matters.
    pub fn update_nonresponsive(&mut self, now: Cycles, timeout_cycles: u64) {
        self.balloon_unresponsive = match self.last_ack_cycles {
            Some(last) => now.saturating_sub(last) > timeout_cycles,
            None => {
                self.last_ack_cycles = Some(now);
                false
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn client_id() -> ClientId {
        let mut sm: SlotMap<ClientId, ()> = SlotMap::with_key();
        sm.insert(())
    }

    #[test]
    fn idle_pages_cost_more_than_active() {
        let mut client = MemClient::new(client_id(), 0, 1_000_000, 1000);
        client.allocated_pages = 1000;
        client.active_pages = 1000;
        let all_active = client.charged_pages(4.0);

        client.active_pages = 0;
        let all_idle = client.charged_pages(4.0);
        assert!(all_idle > all_active);
    }

    #[test]
    fn shortfall_is_zero_when_under_target() {
        let mut client = MemClient::new(client_id(), 0, 1_000_000, 1000);
        client.allocated_pages = 100;
        client.target_pages = 200;
        assert_eq!(client.shortfall(), 0);
    }
}
