//! Address-claim timing and state, grounded directly on `isobus_claim_addr`'s
//! constants and arbitration rules.

use std::time::Duration;

use rand::Rng;

use crate::id;

/// How long a node waits for contention before considering an address its
/// own, once no higher-priority claim has appeared.
pub const ADDR_CLAIM_TIMEOUT: Duration = Duration::from_millis(250);

/// Upper bound of the randomised transmit delay added to the first wait, so
/// that nodes powering up together do not all announce in lock-step.
const RTXD_MULTIPLIER_MICROS: u64 = 600;

/// Draw a randomised transmit delay uniform over `[0, 153ms]`.
#[must_use]
pub fn rtxd() -> Duration {
    let l: u64 = rand::thread_rng().gen_range(0..=255);
    Duration::from_micros(l * RTXD_MULTIPLIER_MICROS)
}

/// States of the per-endpoint address-claim machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Idle,
    WaitAddr,
    WaitHaveAddr,
    HaveAddr,
    LostAddr,
}

/// Tracks which addresses in the self-configurable range (128..=247) are
/// believed free, as observed from address-claimed traffic during a claim
/// attempt.
#[derive(Debug, Clone)]
pub struct ScAddrTable {
    free: [bool; (id::MAX_SC_ADDR - id::MIN_SC_ADDR + 1) as usize],
}

impl ScAddrTable {
    #[must_use]
    pub fn all_free() -> Self {
        Self {
            free: [true; (id::MAX_SC_ADDR - id::MIN_SC_ADDR + 1) as usize],
        }
    }

    fn index(addr: u8) -> Option<usize> {
        if (id::MIN_SC_ADDR..=id::MAX_SC_ADDR).contains(&addr) {
            Some((addr - id::MIN_SC_ADDR) as usize)
        } else {
            None
        }
    }

    pub fn mark_taken(&mut self, addr: u8) {
        if let Some(i) = Self::index(addr) {
            self.free[i] = false;
        }
    }

    #[must_use]
    pub fn is_free(&self, addr: u8) -> bool {
        Self::index(addr).is_some_and(|i| self.free[i])
    }

    /// The lowest self-configurable address still believed free, if any.
    #[must_use]
    pub fn lowest_free(&self) -> Option<u8> {
        self.free
            .iter()
            .position(|&f| f)
            .map(|i| id::MIN_SC_ADDR + i as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtxd_stays_within_bound() {
        for _ in 0..1000 {
            let d = rtxd();
            assert!(d <= Duration::from_micros(255 * RTXD_MULTIPLIER_MICROS));
        }
    }

    #[test]
    fn sc_addr_table_starts_all_free() {
        let t = ScAddrTable::all_free();
        assert!(t.is_free(128));
        assert!(t.is_free(247));
        assert_eq!(t.lowest_free(), Some(128));
    }

    #[test]
    fn marking_taken_advances_lowest_free() {
        let mut t = ScAddrTable::all_free();
        t.mark_taken(128);
        t.mark_taken(129);
        assert_eq!(t.lowest_free(), Some(130));
    }

    #[test]
    fn out_of_range_addresses_are_ignored() {
        let mut t = ScAddrTable::all_free();
        t.mark_taken(0);
        t.mark_taken(254);
        assert_eq!(t.lowest_free(), Some(128));
    }
}
