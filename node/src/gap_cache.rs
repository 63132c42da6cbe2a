//! Gap cache: blocks whose predecessor has not arrived yet.
//!
//! A gapped block waits here while votes for it accumulate. Once the voting
//! weight behind a waiting block crosses the bootstrap threshold, the
//! network evidently considers the chain it extends real, and fetching the
//! missing predecessor is worth a bootstrap. The cache is small and bounded;
//! the oldest entry is dropped when full.

use std::collections::{HashMap, HashSet, VecDeque};

use lattice_consensus::Vote;
use lattice_ledger::{Block, Ledger};
use lattice_types::{Account, Amount, BlockHash, Timestamp};
use tracing::debug;

/// Maximum entries held.
pub const GAP_CACHE_MAX: usize = 256;
/// Entries older than this are purged.
pub const GAP_PURGE_AGE_SECS: u64 = 10;

struct GapInfo {
    arrival: Timestamp,
    block: Block,
    voters: HashSet<Account>,
}

/// Bounded cache of blocks with missing predecessors, indexed by hash with
/// arrival-ordered eviction.
pub struct GapCache {
    blocks: HashMap<BlockHash, GapInfo>,
    order: VecDeque<BlockHash>,
    bootstrap_fraction_numerator: u128,
}

impl GapCache {
    pub fn new(bootstrap_fraction_numerator: u128) -> Self {
        Self {
            blocks: HashMap::new(),
            order: VecDeque::new(),
            bootstrap_fraction_numerator,
        }
    }

    /// Remember a gapped block. Oldest entries give way when full.
    pub fn add(&mut self, block: Block, now: Timestamp) {
        if self.blocks.contains_key(&block.hash) {
            return;
        }
        while self.blocks.len() >= GAP_CACHE_MAX {
            if let Some(oldest) = self.order.pop_front() {
                self.blocks.remove(&oldest);
            } else {
                break;
            }
        }
        self.order.push_back(block.hash);
        self.blocks.insert(
            block.hash,
            GapInfo {
                arrival: now,
                block,
                voters: HashSet::new(),
            },
        );
    }

    /// The weight at which a gapped block triggers a bootstrap: a slice of
    /// online stake scaled by the configured numerator.
    pub fn bootstrap_threshold(&self, online_stake: Amount) -> Amount {
        Amount::new(online_stake.raw() / 256 * self.bootstrap_fraction_numerator)
    }

    /// Record the vote's account against any waiting blocks it names.
    ///
    /// Returns the `previous` hashes that now deserve a bootstrap; their
    /// entries are removed.
    pub fn vote(
        &mut self,
        vote: &Vote,
        ledger: &Ledger,
        online_stake: Amount,
    ) -> Vec<BlockHash> {
        let threshold = self.bootstrap_threshold(online_stake);
        let mut triggered = Vec::new();
        for hash in &vote.hashes {
            let Some(info) = self.blocks.get_mut(hash) else {
                continue;
            };
            if !info.voters.insert(vote.account) {
                continue;
            }
            let tally: Amount = info.voters.iter().map(|voter| ledger.weight(voter)).sum();
            if tally >= threshold {
                debug!(block = %hash, tally = %tally, "gap block crossed bootstrap threshold");
                triggered.push(info.block.previous);
                self.remove(hash);
            }
        }
        triggered
    }

    /// Blocks waiting on `hash` as their predecessor, removed from the
    /// cache for re-processing.
    pub fn dependents_of(&mut self, hash: &BlockHash) -> Vec<Block> {
        let waiting: Vec<BlockHash> = self
            .blocks
            .values()
            .filter(|info| info.block.previous == *hash || info.block.link == *hash)
            .map(|info| info.block.hash)
            .collect();
        waiting
            .iter()
            .filter_map(|waiting_hash| {
                let info = self.blocks.remove(waiting_hash)?;
                self.order.retain(|h| h != waiting_hash);
                Some(info.block)
            })
            .collect()
    }

    /// Drop entries older than [`GAP_PURGE_AGE_SECS`].
    pub fn purge_old(&mut self, now: Timestamp) {
        let stale: Vec<BlockHash> = self
            .blocks
            .iter()
            .filter(|(_, info)| info.arrival.saturating_elapsed(now) > GAP_PURGE_AGE_SECS)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in stale {
            self.remove(&hash);
        }
    }

    fn remove(&mut self, hash: &BlockHash) {
        if self.blocks.remove(hash).is_some() {
            self.order.retain(|h| h != hash);
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_crypto::keypair_from_seed;
    use lattice_ledger::{BlockBuilder, BlockKind, MemoryStore, Store};
    use lattice_types::KeyPair;
    use std::sync::Arc;

    fn keys(seed: u8) -> KeyPair {
        keypair_from_seed(&[seed; 32])
    }

    fn gapped_block(seed: u8, previous: u8) -> Block {
        let kp = keys(seed);
        BlockBuilder::new(BlockKind::State, Account::from(kp.public))
            .previous(BlockHash::new([previous; 32]))
            .representative(Account::from(kp.public))
            .balance(Amount::new(1))
            .sign(&kp.private)
    }

    fn ledger_with_rep(seed: u8, weight: u128) -> (Ledger, Account) {
        let store = Arc::new(MemoryStore::new());
        let account = Account::from(keys(seed).public);
        store.add_rep_weight(&account, Amount::new(weight));
        (Ledger::new(store, 0), account)
    }

    fn ts(secs: u64) -> Timestamp {
        Timestamp::new(secs)
    }

    #[test]
    fn add_is_deduplicated_and_bounded() {
        let mut cache = GapCache::new(1);
        let block = gapped_block(1, 9);
        cache.add(block.clone(), ts(100));
        cache.add(block, ts(101));
        assert_eq!(cache.len(), 1);

        for seed in 2..=255u8 {
            cache.add(gapped_block(seed, 9), ts(102));
            cache.add(gapped_block(seed, 10), ts(102));
        }
        assert!(cache.len() <= GAP_CACHE_MAX);
    }

    #[test]
    fn votes_accumulate_to_bootstrap_trigger() {
        let (ledger, rep) = ledger_with_rep(40, 512_000);
        let mut cache = GapCache::new(1);
        let block = gapped_block(1, 9);
        let hash = block.hash;
        let previous = block.previous;
        cache.add(block, ts(100));

        // online stake 1_024_000 -> threshold 4_000; rep weight crosses it.
        let vote = Vote::new(rep, 1, vec![hash], &keys(40).private);
        let triggered = cache.vote(&vote, &ledger, Amount::new(1_024_000));
        assert_eq!(triggered, vec![previous]);
        assert!(cache.is_empty());
    }

    #[test]
    fn weightless_votes_do_not_trigger() {
        let (ledger, _) = ledger_with_rep(40, 1000);
        let mut cache = GapCache::new(1);
        let block = gapped_block(1, 9);
        let hash = block.hash;
        cache.add(block, ts(100));

        let nobody = keys(41);
        let vote = Vote::new(Account::from(nobody.public), 1, vec![hash], &nobody.private);
        let triggered = cache.vote(&vote, &ledger, Amount::new(1_024_000));
        assert!(triggered.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn duplicate_voter_counted_once() {
        let (ledger, rep) = ledger_with_rep(40, 100);
        let mut cache = GapCache::new(1);
        let block = gapped_block(1, 9);
        let hash = block.hash;
        cache.add(block, ts(100));

        let vote1 = Vote::new(rep, 1, vec![hash], &keys(40).private);
        let vote2 = Vote::new(rep, 2, vec![hash], &keys(40).private);
        cache.vote(&vote1, &ledger, Amount::new(1_000_000_000));
        let triggered = cache.vote(&vote2, &ledger, Amount::new(1_000_000_000));
        assert!(triggered.is_empty());
    }

    #[test]
    fn dependents_drained_when_predecessor_arrives() {
        let mut cache = GapCache::new(1);
        let block = gapped_block(1, 9);
        let previous = block.previous;
        cache.add(block.clone(), ts(100));
        cache.add(gapped_block(2, 8), ts(100));

        let ready = cache.dependents_of(&previous);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].hash, block.hash);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn purge_removes_aged_entries() {
        let mut cache = GapCache::new(1);
        cache.add(gapped_block(1, 9), ts(100));
        cache.add(gapped_block(2, 9), ts(108));
        cache.purge_old(ts(112));
        assert_eq!(cache.len(), 1);
    }
}
