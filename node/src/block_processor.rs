//! Serialized block admission.
//!
//! A single consumer thread drains the queue, so ledger writes are totally
//! ordered; this is where forks are detected. Forced blocks (fiat
//! resolutions from election confirmation) take a priority sub-queue, cancel
//! any election on their root, and overwrite whatever occupies it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use lattice_consensus::ActiveElections;
use lattice_ledger::{Block, Ledger, ProcessResult};
use lattice_types::{BlockHash, Timestamp};
use tracing::{debug, trace, warn};

use crate::gap_cache::GapCache;

/// Queue length at which backpressure sets in.
pub const QUEUE_MAX: usize = 16 * 1024;
/// Blocks admitted per drain batch.
const BATCH_MAX: usize = 256;

/// Observer invoked (on the worker thread) after each processed block.
pub type ProcessObserver = Box<dyn Fn(&Block, ProcessResult) + Send + Sync>;

struct State {
    blocks: VecDeque<(Block, Timestamp)>,
    /// Hashes currently queued, for dedup.
    hashes: HashSet<BlockHash>,
    forced: VecDeque<Block>,
    active: bool,
    stopped: bool,
}

/// Shared face of the processor: enqueue and flush from any thread.
pub struct BlockProcessorHandle {
    state: Mutex<State>,
    condition: Condvar,
    ledger: Arc<Ledger>,
    active_elections: Arc<Mutex<ActiveElections>>,
    gap_cache: Arc<Mutex<GapCache>>,
    observer: ProcessObserver,
}

impl BlockProcessorHandle {
    /// Enqueue unless already queued or the queue is full.
    pub fn add(&self, block: Block, arrival: Timestamp) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.stopped || state.blocks.len() >= QUEUE_MAX {
            return false;
        }
        if !state.hashes.insert(block.hash) {
            return false;
        }
        state.blocks.push_back((block, arrival));
        self.condition.notify_all();
        true
    }

    /// Push to the priority sub-queue: the block is admitted by fiat,
    /// cancelling any election on its root and rolling back a rival.
    pub fn force(&self, block: Block) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }
        state.forced.push_back(block);
        self.condition.notify_all();
    }

    /// Whether backpressure is active.
    pub fn full(&self) -> bool {
        self.state.lock().unwrap().blocks.len() >= QUEUE_MAX
    }

    pub fn have_blocks(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.blocks.is_empty() || !state.forced.is_empty()
    }

    /// Block until the queue is drained.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.stopped
            && (!state.blocks.is_empty() || !state.forced.is_empty() || state.active)
        {
            state = self.condition.wait(state).unwrap();
        }
    }

    fn process_one(&self, block: Block, forced: bool, now: Timestamp) {
        if forced {
            let root = block.root();
            self.active_elections.lock().unwrap().erase(&root);
            if let Some(existing) = self.ledger.store().block_by_root(&root) {
                if existing.hash != block.hash {
                    match self.ledger.rollback(&existing.hash) {
                        Ok(removed) => debug!(root = %root, removed = removed.len(),
                                              "forced block displaced rival chain"),
                        Err(err) => warn!(root = %root, error = %err,
                                          "rollback for forced block failed"),
                    }
                }
            }
        }

        let result = self.ledger.process(&block, now);
        trace!(hash = %block.hash, ?result, forced, "block processed");
        match result {
            ProcessResult::Progress => {
                // Anything gapped on this block can go around again.
                let dependents = self.gap_cache.lock().unwrap().dependents_of(&block.hash);
                for dependent in dependents {
                    self.add(dependent, now);
                }
            }
            ProcessResult::GapPrevious | ProcessResult::GapSource => {
                self.gap_cache.lock().unwrap().add(block.clone(), now);
            }
            ProcessResult::Fork => {
                let mut active = self.active_elections.lock().unwrap();
                if active.active(&block.root()) {
                    active.publish(block.clone());
                } else if let Some(existing) =
                    self.ledger.store().block_by_root(&block.root())
                {
                    debug!(root = %block.root(), ours = %existing.hash,
                           theirs = %block.hash, "fork detected; election started");
                    active.start_fork(existing, block.clone(), None);
                }
            }
            _ => {}
        }
        (self.observer)(&block, result);
    }

    fn process_loop(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                break;
            }
            if state.blocks.is_empty() && state.forced.is_empty() {
                state.active = false;
                self.condition.notify_all();
                state = self.condition.wait(state).unwrap();
                continue;
            }

            // Forced blocks drain first, then a bounded batch of the rest.
            let mut batch: Vec<(Block, bool)> = Vec::new();
            while let Some(block) = state.forced.pop_front() {
                batch.push((block, true));
                if batch.len() >= BATCH_MAX {
                    break;
                }
            }
            while batch.len() < BATCH_MAX {
                let Some((block, _arrival)) = state.blocks.pop_front() else {
                    break;
                };
                state.hashes.remove(&block.hash);
                batch.push((block, false));
            }
            state.active = true;
            drop(state);

            let now = Timestamp::now();
            for (block, forced) in batch {
                self.process_one(block, forced, now);
            }
            state = self.state.lock().unwrap();
        }
        debug!("block processor stopped");
    }
}

/// Owner of the worker thread.
pub struct BlockProcessor {
    handle: Arc<BlockProcessorHandle>,
    thread: Option<thread::JoinHandle<()>>,
}

impl BlockProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        active_elections: Arc<Mutex<ActiveElections>>,
        gap_cache: Arc<Mutex<GapCache>>,
        observer: ProcessObserver,
    ) -> Self {
        let handle = Arc::new(BlockProcessorHandle {
            state: Mutex::new(State {
                blocks: VecDeque::new(),
                hashes: HashSet::new(),
                forced: VecDeque::new(),
                active: false,
                stopped: false,
            }),
            condition: Condvar::new(),
            ledger,
            active_elections,
            gap_cache,
            observer,
        });
        let worker = handle.clone();
        let thread = thread::Builder::new()
            .name("block processor".into())
            .spawn(move || worker.process_loop())
            .expect("spawning the block processor thread");
        Self {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> &Arc<BlockProcessorHandle> {
        &self.handle
    }

    pub fn stop(&mut self) {
        {
            let mut state = self.handle.state.lock().unwrap();
            state.stopped = true;
            self.handle.condition.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BlockProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_consensus::QuorumSettings;
    use lattice_crypto::keypair_from_seed;
    use lattice_ledger::{BlockBuilder, BlockKind, MemoryStore};
    use lattice_types::{Account, Amount, KeyPair};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keys(seed: u8) -> KeyPair {
        keypair_from_seed(&[seed; 32])
    }

    struct Fixture {
        processor: BlockProcessor,
        ledger: Arc<Ledger>,
        active: Arc<Mutex<ActiveElections>>,
        gap_cache: Arc<Mutex<GapCache>>,
        progressed: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), 0));
        let active = Arc::new(Mutex::new(ActiveElections::new(QuorumSettings {
            online_weight_minimum: Amount::new(1_000_000),
            quorum_percent: 50,
        })));
        let gap_cache = Arc::new(Mutex::new(GapCache::new(1)));
        let progressed = Arc::new(AtomicUsize::new(0));
        let progressed_clone = progressed.clone();
        let processor = BlockProcessor::new(
            ledger.clone(),
            active.clone(),
            gap_cache.clone(),
            Box::new(move |_, result| {
                if result == ProcessResult::Progress {
                    progressed_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        Fixture {
            processor,
            ledger,
            active,
            gap_cache,
            progressed,
        }
    }

    fn genesis(ledger: &Ledger, kp: &KeyPair, amount: u128) -> Block {
        let account = Account::from(kp.public);
        let block = BlockBuilder::new(BlockKind::Open, account)
            .representative(account)
            .balance(Amount::new(amount))
            .sign(&kp.private);
        ledger.insert_genesis(&block);
        block
    }

    fn send(kp: &KeyPair, previous: BlockHash, balance: u128, dest: u8) -> Block {
        let account = Account::from(kp.public);
        BlockBuilder::new(BlockKind::Send, account)
            .previous(previous)
            .representative(account)
            .balance(Amount::new(balance))
            .link(BlockHash::new([dest; 32]))
            .sign(&kp.private)
    }

    #[test]
    fn add_processes_block_into_ledger() {
        let fixture = fixture();
        let alice = keys(1);
        let g = genesis(&fixture.ledger, &alice, 1000);
        let block = send(&alice, g.hash, 900, 0xAA);

        assert!(fixture
            .processor
            .handle()
            .add(block.clone(), Timestamp::new(1)));
        fixture.processor.handle().flush();
        assert_eq!(
            fixture.ledger.latest(&Account::from(alice.public)),
            Some(block.hash)
        );
        assert_eq!(fixture.progressed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replayed_block_is_old_not_reapplied() {
        let fixture = fixture();
        let alice = keys(1);
        let g = genesis(&fixture.ledger, &alice, 1000);
        let block = send(&alice, g.hash, 900, 0xAA);

        fixture.processor.handle().add(block.clone(), Timestamp::new(1));
        fixture.processor.handle().flush();
        fixture.processor.handle().add(block, Timestamp::new(2));
        fixture.processor.handle().flush();
        assert_eq!(fixture.progressed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gap_block_lands_in_gap_cache_then_drains() {
        let fixture = fixture();
        let alice = keys(1);
        let g = genesis(&fixture.ledger, &alice, 1000);
        let first = send(&alice, g.hash, 900, 0xAA);
        let second = send(&alice, first.hash, 800, 0xBB);

        // Second arrives first: its previous is unknown.
        fixture
            .processor
            .handle()
            .add(second.clone(), Timestamp::new(1));
        fixture.processor.handle().flush();
        assert_eq!(fixture.gap_cache.lock().unwrap().len(), 1);

        // Predecessor arrives; the gapped block drains, requeues, and lands.
        fixture
            .processor
            .handle()
            .add(first.clone(), Timestamp::new(2));
        fixture.processor.handle().flush();
        assert_eq!(
            fixture.ledger.latest(&Account::from(alice.public)),
            Some(second.hash)
        );
        assert!(fixture.gap_cache.lock().unwrap().is_empty());
    }

    #[test]
    fn fork_starts_paired_election() {
        let fixture = fixture();
        let alice = keys(1);
        let g = genesis(&fixture.ledger, &alice, 1000);
        let ours = send(&alice, g.hash, 900, 0xAA);
        let theirs = send(&alice, g.hash, 800, 0xBB);

        fixture.processor.handle().add(ours.clone(), Timestamp::new(1));
        fixture.processor.handle().flush();
        fixture
            .processor
            .handle()
            .add(theirs.clone(), Timestamp::new(2));
        fixture.processor.handle().flush();

        let active = fixture.active.lock().unwrap();
        assert!(active.active(&ours.root()));
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn force_overwrites_rival_and_cancels_election() {
        let fixture = fixture();
        let alice = keys(1);
        let g = genesis(&fixture.ledger, &alice, 1000);
        let ours = send(&alice, g.hash, 900, 0xAA);
        let theirs = send(&alice, g.hash, 800, 0xBB);

        fixture.processor.handle().add(ours.clone(), Timestamp::new(1));
        fixture.processor.handle().flush();
        fixture
            .processor
            .handle()
            .add(theirs.clone(), Timestamp::new(2));
        fixture.processor.handle().flush();
        assert!(fixture.active.lock().unwrap().active(&ours.root()));

        fixture.processor.handle().force(theirs.clone());
        fixture.processor.handle().flush();

        assert_eq!(
            fixture.ledger.latest(&Account::from(alice.public)),
            Some(theirs.hash)
        );
        assert!(!fixture.active.lock().unwrap().active(&ours.root()));
        assert!(fixture.ledger.store().get_block(&ours.hash).is_none());
    }

    #[test]
    fn backpressure_reports_full() {
        let fixture = fixture();
        assert!(!fixture.processor.handle().full());
    }
}
