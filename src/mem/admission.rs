//! Memory admission control: reserve/unreserve host pages against a
//! managed total (spec §4.K).

use crate::error::{Result, ScheduleError};

/// Attempt to reserve `pages` against `available_pages` (the managed
/// pool minus everything already reserved). Fails with `NoMemory` if
/// the reservation would exceed what's available, or `LimitExceeded` if
/// `pages` alone is above `max_single_reservation`.
pub fn reserve(pages: u64, available_pages: u64, max_single_reservation: u64) -> Result<u64> {
    if pages > max_single_reservation {
        log::warn!("mem::reserve: {pages} pages above configured maximum {max_single_reservation}");
        return Err(ScheduleError::LimitExceeded);
    }
    if pages > available_pages {
        log::warn!("mem::reserve: {pages} pages requested, only {available_pages} available");
        return Err(ScheduleError::NoMemory);
    }
    Ok(available_pages - pages)
}

/// Release a prior reservation back into the available pool.
pub fn unreserve(pages: u64, available_pages: u64, managed_pages: u64) -> u64 {
    (available_pages + pages).min(managed_pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_refuses_past_availability() {
        assert_eq!(
            reserve(1000, 500, 10_000),
            Err(ScheduleError::NoMemory)
        );
    }

    #[test]
    fn reserve_refuses_above_per_client_ceiling() {
        assert_eq!(
            reserve(20_000, 50_000, 10_000),
            Err(ScheduleError::LimitExceeded)
        );
    }

    #[test]
    fn reserve_then_unreserve_roundtrips() {
        let after_reserve = reserve(1000, 5000, 10_000).unwrap();
        assert_eq!(after_reserve, 4000);
        let after_unreserve = unreserve(1000, after_reserve, 5000);
        assert_eq!(after_unreserve, 5000);
    }
}
