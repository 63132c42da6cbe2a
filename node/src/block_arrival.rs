//! Recent-arrival tracking.
//!
//! Blocks that arrived in a live datagram are probably new to the whole
//! network; blocks inserted by bootstrap are replays of history. This set
//! remembers recent live arrivals so the republish path can tell the two
//! apart, and carries staple metadata alongside so a rebroadcast can attach
//! the strongest proof seen so far.

use std::collections::{HashMap, VecDeque};

use lattice_types::{Amount, BlockHash, Signature, Timestamp};

/// Entries younger than this are never evicted.
pub const ARRIVAL_TIME_MIN_SECS: u64 = 300;
/// The set never shrinks below this many entries.
pub const ARRIVAL_SIZE_MIN: usize = 8 * 1024;

/// Aggregate-signature metadata attached to an arrival.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StapleInfo {
    pub reps_xor: [u8; 32],
    pub signature: Signature,
}

/// What the republish path needs to know about a hash.
#[derive(Clone, Debug)]
pub struct RebroadcastInfo {
    pub recent: bool,
    pub vote_staple: Option<StapleInfo>,
    pub confirmed: bool,
    pub staple_tally: Amount,
}

struct ArrivalInfo {
    arrival: Timestamp,
    vote_staple: Option<StapleInfo>,
    confirmed: bool,
    staple_tally: Amount,
}

/// Arrival-ordered, hash-unique set of recently seen live blocks.
pub struct BlockArrival {
    by_hash: HashMap<BlockHash, ArrivalInfo>,
    order: VecDeque<BlockHash>,
}

impl BlockArrival {
    pub fn new() -> Self {
        Self {
            by_hash: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an arrival. Returns `true` when the hash was already present
    /// (in which case stronger staple metadata still updates the entry).
    pub fn add(
        &mut self,
        hash: BlockHash,
        vote_staple: Option<StapleInfo>,
        confirmed: bool,
        staple_tally: Amount,
        now: Timestamp,
    ) -> bool {
        if let Some(info) = self.by_hash.get_mut(&hash) {
            if vote_staple.is_some() && staple_tally > info.staple_tally {
                info.vote_staple = vote_staple;
                info.staple_tally = staple_tally;
            }
            info.confirmed |= confirmed;
            return true;
        }

        // Evict from the front: only entries both old and beyond the size
        // floor go.
        while self.order.len() >= ARRIVAL_SIZE_MIN {
            let Some(oldest) = self.order.front() else {
                break;
            };
            let expired = self
                .by_hash
                .get(oldest)
                .map(|info| info.arrival.saturating_elapsed(now) >= ARRIVAL_TIME_MIN_SECS)
                .unwrap_or(true);
            if !expired {
                break;
            }
            let oldest = *oldest;
            self.order.pop_front();
            self.by_hash.remove(&oldest);
        }

        self.order.push_back(hash);
        self.by_hash.insert(
            hash,
            ArrivalInfo {
                arrival: now,
                vote_staple,
                confirmed,
                staple_tally,
            },
        );
        false
    }

    /// Whether `hash` arrived live recently.
    pub fn recent(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Mark a hash as confirmed (no-op if unknown).
    pub fn set_confirmed(&mut self, hash: &BlockHash) {
        if let Some(info) = self.by_hash.get_mut(hash) {
            info.confirmed = true;
        }
    }

    /// Everything the republish path wants to know about `hash`.
    pub fn rebroadcast_info(&self, hash: &BlockHash) -> RebroadcastInfo {
        match self.by_hash.get(hash) {
            Some(info) => RebroadcastInfo {
                recent: true,
                vote_staple: info.vote_staple.clone(),
                confirmed: info.confirmed,
                staple_tally: info.staple_tally,
            },
            None => RebroadcastInfo {
                recent: false,
                vote_staple: None,
                confirmed: false,
                staple_tally: Amount::ZERO,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

impl Default for BlockArrival {
    fn default() -> Self {
        Self::new()
    }
}
