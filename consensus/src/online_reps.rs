//! Online representative tracking.
//!
//! Quorum is computed against *online* stake, not total delegated stake. A
//! representative counts as online if it has voted within the sampling
//! window. The stake total is recomputed periodically, never mid-tally, so a
//! tally in progress always sees a stable denominator.

use std::collections::HashMap;

use lattice_ledger::Ledger;
use lattice_types::{Account, Amount, Timestamp};

/// Representatives heard within this many seconds count as online.
pub const ONLINE_WINDOW_SECS: u64 = 300;

pub struct OnlineReps {
    /// Representative -> last time a vote from it was seen.
    reps: HashMap<Account, Timestamp>,
    /// Cached sum of online representatives' weight.
    online_stake_total: Amount,
    /// Configured floor for the quorum denominator.
    online_weight_minimum: Amount,
}

impl OnlineReps {
    pub fn new(online_weight_minimum: Amount) -> Self {
        Self {
            reps: HashMap::new(),
            online_stake_total: Amount::ZERO,
            online_weight_minimum,
        }
    }

    /// Record that a vote from `rep` was observed at `now`.
    pub fn observe(&mut self, rep: Account, now: Timestamp) {
        let entry = self.reps.entry(rep).or_insert(now);
        if now > *entry {
            *entry = now;
        }
    }

    /// Recompute the cached online stake: prune representatives outside the
    /// window and sum the ledger weight of the rest.
    pub fn recalculate_stake(&mut self, ledger: &Ledger, now: Timestamp) {
        let cutoff = now.as_secs().saturating_sub(ONLINE_WINDOW_SECS);
        self.reps.retain(|_, heard| heard.as_secs() >= cutoff);
        self.online_stake_total = self
            .reps
            .keys()
            .map(|rep| ledger.weight(rep))
            .sum();
    }

    /// The quorum denominator: cached online stake, floored at the
    /// configured minimum.
    pub fn online_stake(&self) -> Amount {
        self.online_stake_total.max(self.online_weight_minimum)
    }

    /// Representatives currently considered online.
    pub fn list(&self) -> Vec<Account> {
        self.reps.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.reps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_ledger::{MemoryStore, Store};
    use std::sync::Arc;

    fn ledger_with_weights(weights: &[(Account, u128)]) -> Ledger {
        let store = Arc::new(MemoryStore::new());
        for (rep, weight) in weights {
            store.add_rep_weight(rep, Amount::new(*weight));
        }
        Ledger::new(store, 0)
    }

    fn rep(byte: u8) -> Account {
        Account::new([byte; 32])
    }

    fn ts(secs: u64) -> Timestamp {
        Timestamp::new(secs)
    }

    #[test]
    fn observe_and_recalculate() {
        let ledger = ledger_with_weights(&[(rep(1), 100), (rep(2), 200)]);
        let mut online = OnlineReps::new(Amount::ZERO);
        online.observe(rep(1), ts(1000));
        online.observe(rep(2), ts(1000));
        online.recalculate_stake(&ledger, ts(1100));
        assert_eq!(online.online_stake(), Amount::new(300));
    }

    #[test]
    fn stale_reps_pruned() {
        let ledger = ledger_with_weights(&[(rep(1), 100), (rep(2), 200)]);
        let mut online = OnlineReps::new(Amount::ZERO);
        online.observe(rep(1), ts(100));
        online.observe(rep(2), ts(1000));
        // Window is 300 s; at t=1100 only rep 2 qualifies.
        online.recalculate_stake(&ledger, ts(1100));
        assert_eq!(online.online_stake(), Amount::new(200));
        assert_eq!(online.len(), 1);
    }

    #[test]
    fn minimum_floor_applies() {
        let ledger = ledger_with_weights(&[]);
        let mut online = OnlineReps::new(Amount::new(5000));
        online.recalculate_stake(&ledger, ts(1000));
        assert_eq!(online.online_stake(), Amount::new(5000));
    }

    #[test]
    fn newer_observation_wins() {
        let ledger = ledger_with_weights(&[(rep(1), 100)]);
        let mut online = OnlineReps::new(Amount::ZERO);
        online.observe(rep(1), ts(1000));
        online.observe(rep(1), ts(500)); // older, ignored
        online.recalculate_stake(&ledger, ts(1250));
        assert_eq!(online.online_stake(), Amount::new(100));
    }

    #[test]
    fn cached_total_stable_until_recalculated() {
        let ledger = ledger_with_weights(&[(rep(1), 100)]);
        let mut online = OnlineReps::new(Amount::ZERO);
        online.observe(rep(1), ts(1000));
        online.recalculate_stake(&ledger, ts(1000));
        assert_eq!(online.online_stake(), Amount::new(100));

        // More weight lands in the ledger; the cached total is unchanged
        // until the next periodic recomputation.
        ledger.store().add_rep_weight(&rep(1), Amount::new(900));
        assert_eq!(online.online_stake(), Amount::new(100));
        online.recalculate_stake(&ledger, ts(1001));
        assert_eq!(online.online_stake(), Amount::new(1000));
    }
}
