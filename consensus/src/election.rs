//! Per-root election state.
//!
//! An election exists for every root currently contested or awaiting its
//! first confirmation. It tracks the latest vote per representative (by
//! sequence number), tallies stake behind each candidate block, and confirms
//! the leader exactly once when quorum is reached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use lattice_ledger::{Block, Ledger};
use lattice_types::{Account, Amount, BlockHash, Root, Timestamp};
use tracing::debug;

/// The latest vote recorded for one representative within an election.
#[derive(Clone, Debug)]
pub struct VoteInfo {
    pub time: Timestamp,
    pub sequence: u64,
    pub hash: BlockHash,
}

/// Result of feeding one (account, sequence, hash) into an election.
///
/// `replay` means the sequence did not supersede the recorded vote.
/// `processed` means the vote was recorded (even when the hash names a block
/// this election has not seen yet; such votes score the block once it is
/// published).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionVoteResult {
    pub replay: bool,
    pub processed: bool,
}

/// Snapshot of a confirmed election.
#[derive(Clone, Debug)]
pub struct ElectionStatus {
    pub winner: Block,
    pub tally: Amount,
    /// Whether confirmation came from an aggregate vote staple rather than
    /// individual votes.
    pub stapled: bool,
}

/// State for one contested root.
pub struct Election {
    pub root: Root,
    /// Candidate blocks for this root, by hash.
    blocks: HashMap<BlockHash, Block>,
    /// Latest vote per representative.
    last_votes: HashMap<Account, VoteInfo>,
    /// Tally snapshot from the previous round, for logging and debouncing.
    last_tally: HashMap<BlockHash, Amount>,
    /// Current leader.
    winner: BlockHash,
    confirmed: AtomicBool,
    aborted: bool,
}

impl Election {
    /// Open an election with `block` as the initial (and leading) candidate.
    pub fn new(block: Block) -> Self {
        let root = block.root();
        let winner = block.hash;
        let mut blocks = HashMap::new();
        blocks.insert(block.hash, block);
        Self {
            root,
            blocks,
            last_votes: HashMap::new(),
            last_tally: HashMap::new(),
            winner,
            confirmed: AtomicBool::new(false),
            aborted: false,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Stop the election: no further confirmation can occur.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn winner_hash(&self) -> BlockHash {
        self.winner
    }

    pub fn winner_block(&self) -> Option<&Block> {
        self.blocks.get(&self.winner)
    }

    pub fn candidate(&self, hash: &BlockHash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn candidate_hashes(&self) -> Vec<BlockHash> {
        self.blocks.keys().copied().collect()
    }

    pub fn last_vote(&self, account: &Account) -> Option<&VoteInfo> {
        self.last_votes.get(account)
    }

    pub fn last_tally(&self) -> &HashMap<BlockHash, Amount> {
        &self.last_tally
    }

    /// Record a representative's vote.
    ///
    /// Sequences are monotonic per account: an incoming sequence at or below
    /// the recorded one is a replay and changes nothing. A vote naming a hash
    /// this election has not seen is still retained; it scores the block if
    /// it is published later.
    pub fn vote(
        &mut self,
        account: Account,
        sequence: u64,
        hash: BlockHash,
        now: Timestamp,
    ) -> ElectionVoteResult {
        if self.is_confirmed() || self.aborted {
            return ElectionVoteResult {
                replay: false,
                processed: false,
            };
        }
        if let Some(existing) = self.last_votes.get(&account) {
            if existing.sequence >= sequence {
                return ElectionVoteResult {
                    replay: true,
                    processed: false,
                };
            }
        }
        self.last_votes.insert(
            account,
            VoteInfo {
                time: now,
                sequence,
                hash,
            },
        );
        ElectionVoteResult {
            replay: false,
            processed: true,
        }
    }

    /// Add a candidate block. Returns `true` when this hash is new for the
    /// election; votes already cast for it begin counting immediately.
    pub fn publish(&mut self, block: Block) -> bool {
        if block.root() != self.root {
            return false;
        }
        if self.blocks.contains_key(&block.hash) {
            return false;
        }
        self.blocks.insert(block.hash, block);
        true
    }

    /// Whether the leading candidate meets quorum against the larger of the
    /// observed online stake and the configured minimum.
    pub fn have_quorum(
        tally: &HashMap<BlockHash, Amount>,
        online_stake: Amount,
        online_weight_minimum: Amount,
        quorum_percent: u128,
    ) -> Option<(BlockHash, Amount)> {
        let (winner, weight) = tally
            .iter()
            .max_by_key(|(hash, weight)| (**weight, std::cmp::Reverse(**hash)))
            .map(|(hash, weight)| (*hash, *weight))?;
        let denominator = online_stake.max(online_weight_minimum);
        if weight >= denominator.percent(quorum_percent) {
            Some((winner, weight))
        } else {
            None
        }
    }

    /// Tally, adopt the network's leader, and confirm if quorum is met and
    /// the leader is a known candidate.
    ///
    /// On confirmation this rolls back a conflicting ledger block occupying
    /// the root and returns the status; the caller force-processes the winner
    /// and fires observers. Runs at most once per election.
    pub fn confirm_if_quorum(
        &mut self,
        ledger: &Ledger,
        online_stake: Amount,
        online_weight_minimum: Amount,
        quorum_percent: u128,
    ) -> Option<ElectionStatus> {
        if self.aborted || self.is_confirmed() {
            return None;
        }
        let tally = self.tally_weights(ledger);
        if tally != self.last_tally {
            self.log_votes(&tally);
        }

        let quorum = Self::have_quorum(
            &tally,
            online_stake,
            online_weight_minimum,
            quorum_percent,
        );
        // Adopt the network's current leader even without quorum.
        if let Some((leader, _)) = tally
            .iter()
            .max_by_key(|(hash, weight)| (**weight, std::cmp::Reverse(**hash)))
            .map(|(hash, weight)| (*hash, *weight))
        {
            if self.blocks.contains_key(&leader) {
                self.winner = leader;
            }
        }
        self.last_tally = tally;

        let (winner_hash, winner_weight) = quorum?;
        let winner = self.blocks.get(&winner_hash)?.clone();
        self.confirm_once(ledger, winner, winner_weight, false)
    }

    /// Confirm on behalf of an aggregate vote staple whose stake already met
    /// quorum. Bypasses per-representative tallying.
    pub fn confirm_stapled(
        &mut self,
        ledger: &Ledger,
        winner_hash: BlockHash,
        staple_stake: Amount,
    ) -> Option<ElectionStatus> {
        if self.aborted || self.is_confirmed() {
            return None;
        }
        let winner = self.blocks.get(&winner_hash)?.clone();
        self.confirm_once(ledger, winner, staple_stake, true)
    }

    fn confirm_once(
        &mut self,
        ledger: &Ledger,
        winner: Block,
        tally: Amount,
        stapled: bool,
    ) -> Option<ElectionStatus> {
        // Exactly-once: the flag flips before any side effect runs.
        if self
            .confirmed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.winner = winner.hash;

        // A different block occupying this root in the ledger loses.
        if let Some(existing) = ledger.store().block_by_root(&self.root) {
            if existing.hash != winner.hash {
                match ledger.rollback(&existing.hash) {
                    Ok(removed) => {
                        debug!(root = %self.root, loser = %existing.hash,
                               removed = removed.len(), "rolled back fork loser");
                    }
                    Err(err) => {
                        debug!(root = %self.root, error = %err, "fork rollback failed");
                    }
                }
            }
        }

        Some(ElectionStatus {
            winner,
            tally,
            stapled,
        })
    }

    /// Sum current rep weight behind each voted-for hash.
    pub fn tally_weights(&self, ledger: &Ledger) -> HashMap<BlockHash, Amount> {
        let mut totals: HashMap<BlockHash, Amount> = HashMap::new();
        for (account, info) in &self.last_votes {
            *totals.entry(info.hash).or_insert(Amount::ZERO) += ledger.weight(account);
        }
        totals
    }

    fn log_votes(&self, tally: &HashMap<BlockHash, Amount>) {
        for (hash, weight) in tally {
            debug!(root = %self.root, candidate = %hash, weight = %weight, "tally");
        }
    }
}
