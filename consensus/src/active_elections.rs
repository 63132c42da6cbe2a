//! Registry of in-flight elections.
//!
//! Elections are keyed uniquely by root; a `successors` index maps candidate
//! block hashes back to their root so votes naming any candidate find the
//! right election. Confirmed results land in a bounded history deque. The
//! announcement loop walks elections in root order each interval, first
//! rebroadcasting young elections' blocks and then soliciting votes with
//! confirm_req, and checks quorum after every round.

use std::collections::{BTreeMap, HashMap, VecDeque};

use lattice_ledger::{Block, Ledger};
use lattice_types::{Amount, BlockHash, Root, Timestamp};
use tracing::{debug, warn};

use crate::election::{Election, ElectionStatus};
use crate::vote::Vote;

/// Maximum number of elections announced per interval, lowest root first.
pub const ANNOUNCEMENTS_PER_INTERVAL: usize = 32;
/// Below this many announcements an election only rebroadcasts its block.
pub const ANNOUNCEMENT_MIN: u32 = 2;
/// Announcement count at which a stuck election is logged.
pub const ANNOUNCEMENT_LONG: u32 = 20;
/// Bounded length of the confirmed-election history.
pub const ELECTION_HISTORY_SIZE: usize = 2048;

/// Per-root bookkeeping around an [`Election`].
struct ConflictInfo {
    election: Election,
    /// Announcement rounds this election has been through.
    announcements: u32,
    /// For fork elections: the ledger's block first, the contender second.
    /// Announced inside confirm_req so peers can vote on the pair.
    confirm_req_options: Option<(Block, Block)>,
    on_confirm: Option<Box<dyn FnOnce(&Block) + Send>>,
}

/// One action the announcement round asks the owner to perform.
pub enum AnnounceAction {
    /// Flood the block to peers (election is young).
    Rebroadcast(Block),
    /// Solicit votes; `pair` carries fork alternatives for old elections.
    ConfirmReq {
        block: Block,
        pair: Option<(Block, Block)>,
    },
}

/// Result of one announcement round.
pub struct AnnounceRound {
    pub actions: Vec<AnnounceAction>,
    pub confirmed: Vec<ElectionStatus>,
}

/// Quorum parameters threaded into every tally check.
#[derive(Clone, Copy, Debug)]
pub struct QuorumSettings {
    pub online_weight_minimum: Amount,
    pub quorum_percent: u128,
}

/// Registry of all in-flight elections.
pub struct ActiveElections {
    /// Root-ordered so announcement rounds are deterministic.
    roots: BTreeMap<Root, ConflictInfo>,
    /// Candidate hash -> owning root.
    successors: HashMap<BlockHash, Root>,
    /// Bounded history of confirmed elections, oldest dropped first.
    confirmed: VecDeque<ElectionStatus>,
    settings: QuorumSettings,
}

impl ActiveElections {
    pub fn new(settings: QuorumSettings) -> Self {
        Self {
            roots: BTreeMap::new(),
            successors: HashMap::new(),
            confirmed: VecDeque::with_capacity(ELECTION_HISTORY_SIZE),
            settings,
        }
    }

    /// Start an election for `block`. Returns `false` when its root is
    /// already contested (the block is published into the existing election
    /// instead).
    pub fn start(
        &mut self,
        block: Block,
        on_confirm: Option<Box<dyn FnOnce(&Block) + Send>>,
    ) -> bool {
        let root = block.root();
        if let Some(info) = self.roots.get_mut(&root) {
            let hash = block.hash;
            if info.election.publish(block) {
                self.successors.insert(hash, root);
            }
            return false;
        }
        self.successors.insert(block.hash, root);
        self.roots.insert(
            root,
            ConflictInfo {
                election: Election::new(block),
                announcements: 0,
                confirm_req_options: None,
                on_confirm,
            },
        );
        true
    }

    /// Start an election over a detected fork. `existing` must be the block
    /// already in the ledger, `contender` the newly arrived rival.
    pub fn start_fork(
        &mut self,
        existing: Block,
        contender: Block,
        on_confirm: Option<Box<dyn FnOnce(&Block) + Send>>,
    ) -> bool {
        let root = existing.root();
        debug_assert_eq!(root, contender.root());
        let started = self.start(existing.clone(), on_confirm);
        let contender_hash = contender.hash;
        if let Some(info) = self.roots.get_mut(&root) {
            if info.election.publish(contender.clone()) {
                self.successors.insert(contender_hash, root);
            }
            info.confirm_req_options = Some((existing, contender));
        }
        started
    }

    /// Whether a root is currently under election.
    pub fn active(&self, root: &Root) -> bool {
        self.roots.contains_key(root)
    }

    /// Number of in-flight elections.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// The current winner of every in-flight election.
    pub fn list_blocks(&self) -> Vec<Block> {
        self.roots
            .values()
            .filter_map(|info| info.election.winner_block().cloned())
            .collect()
    }

    /// Confirmed-election history, newest last.
    pub fn confirmed_history(&self) -> &VecDeque<ElectionStatus> {
        &self.confirmed
    }

    /// Drop an election without confirming it. Votes for this root will no
    /// longer match anything.
    pub fn erase(&mut self, root: &Root) {
        if let Some(info) = self.roots.remove(root) {
            for hash in info.election.candidate_hashes() {
                self.successors.remove(&hash);
            }
        }
    }

    /// Abort the election on `root` (kept registered so late votes are
    /// swallowed until the next announce round erases it).
    pub fn abort(&mut self, root: &Root) {
        if let Some(info) = self.roots.get_mut(root) {
            info.election.abort();
            debug!(root = %root, "election aborted");
        }
    }

    /// Publish a late-arriving candidate into its root's election.
    /// Returns `true` when the block was a new candidate.
    pub fn publish(&mut self, block: Block) -> bool {
        let root = block.root();
        let hash = block.hash;
        match self.roots.get_mut(&root) {
            Some(info) => {
                let added = info.election.publish(block);
                if added {
                    self.successors.insert(hash, root);
                }
                added
            }
            None => false,
        }
    }

    /// Deliver a validated vote to every election one of its hashes touches.
    ///
    /// Returns `(replay, confirmed)` where `replay` is true when *any*
    /// election reported the vote's sequence as stale, and `confirmed`
    /// carries elections that reached quorum on this vote.
    pub fn vote(
        &mut self,
        vote: &Vote,
        ledger: &Ledger,
        online_stake: Amount,
        now: Timestamp,
    ) -> (bool, Vec<ElectionStatus>) {
        let mut replay = false;
        let mut touched: Vec<Root> = Vec::new();
        for hash in &vote.hashes {
            let Some(root) = self.successors.get(hash).copied() else {
                continue;
            };
            let Some(info) = self.roots.get_mut(&root) else {
                continue;
            };
            let result = info.election.vote(vote.account, vote.sequence, *hash, now);
            replay |= result.replay;
            if result.processed {
                touched.push(root);
            }
        }

        let mut confirmed = Vec::new();
        for root in touched {
            if let Some(status) = self.try_confirm(&root, ledger, online_stake) {
                confirmed.push(status);
            }
        }
        (replay, confirmed)
    }

    /// Confirm `root` via an already-validated vote staple's stake.
    pub fn confirm_stapled(
        &mut self,
        root: &Root,
        winner: BlockHash,
        staple_stake: Amount,
        ledger: &Ledger,
    ) -> Option<ElectionStatus> {
        let info = self.roots.get_mut(root)?;
        let status = info.election.confirm_stapled(ledger, winner, staple_stake)?;
        self.finish(root, status.clone());
        Some(status)
    }

    fn try_confirm(
        &mut self,
        root: &Root,
        ledger: &Ledger,
        online_stake: Amount,
    ) -> Option<ElectionStatus> {
        let info = self.roots.get_mut(root)?;
        let status = info.election.confirm_if_quorum(
            ledger,
            online_stake,
            self.settings.online_weight_minimum,
            self.settings.quorum_percent,
        )?;
        self.finish(root, status.clone());
        Some(status)
    }

    fn finish(&mut self, root: &Root, status: ElectionStatus) {
        if let Some(mut info) = self.roots.remove(root) {
            for hash in info.election.candidate_hashes() {
                self.successors.remove(&hash);
            }
            if let Some(on_confirm) = info.on_confirm.take() {
                on_confirm(&status.winner);
            }
        }
        if self.confirmed.len() >= ELECTION_HISTORY_SIZE {
            self.confirmed.pop_front();
        }
        debug!(winner = %status.winner.hash, tally = %status.tally, "election confirmed");
        self.confirmed.push_back(status);
    }

    /// One announcement round: walk elections in root order, emit the
    /// rebroadcast / confirm_req work list, and check quorum afterwards.
    pub fn announce_round(
        &mut self,
        ledger: &Ledger,
        online_stake: Amount,
    ) -> AnnounceRound {
        let mut actions = Vec::new();
        let mut visited: Vec<Root> = Vec::new();

        for (root, info) in self.roots.iter_mut() {
            if visited.len() >= ANNOUNCEMENTS_PER_INTERVAL {
                break;
            }
            visited.push(*root);
            if info.election.is_confirmed() || info.election.is_aborted() {
                continue;
            }
            let Some(winner) = info.election.winner_block().cloned() else {
                continue;
            };
            if info.announcements < ANNOUNCEMENT_MIN {
                actions.push(AnnounceAction::Rebroadcast(winner));
            } else {
                actions.push(AnnounceAction::ConfirmReq {
                    block: winner,
                    pair: info.confirm_req_options.clone(),
                });
            }
            info.announcements += 1;
            if info.announcements == ANNOUNCEMENT_LONG {
                warn!(root = %root, rounds = ANNOUNCEMENT_LONG,
                      "election has not reached quorum");
            }
        }

        let mut confirmed = Vec::new();
        for root in &visited {
            if let Some(status) = self.try_confirm(root, ledger, online_stake) {
                confirmed.push(status);
            }
        }
        // Aborted elections leave the registry at the end of the round.
        let aborted: Vec<Root> = self
            .roots
            .iter()
            .filter(|(_, info)| info.election.is_aborted())
            .map(|(root, _)| *root)
            .collect();
        for root in aborted {
            self.erase(&root);
        }

        AnnounceRound { actions, confirmed }
    }
}
