//! Serialized vote ingestion.
//!
//! All incoming votes pass through one dedicated thread, so vote admission
//! is totally ordered. The worker validates the signature, samples the
//! voting representative as online, and routes the vote into any elections
//! its hashes touch. Confirmations triggered by a vote are handed to the
//! configured sink (the node force-processes the winner from there).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use lattice_ledger::Ledger;
use lattice_types::Timestamp;
use tracing::{debug, trace};

use crate::active_elections::ActiveElections;
use crate::election::ElectionStatus;
use crate::online_reps::OnlineReps;
use crate::vote::Vote;

/// Classification of one processed vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteCode {
    /// New information: at least one election recorded the vote.
    Vote,
    /// Sequence at or below one already seen for this representative.
    Replay,
    /// Signature failure.
    Invalid,
}

/// Observer invoked (on the worker thread) for every processed vote.
pub type VoteObserver = Box<dyn Fn(&Vote, SocketAddr, VoteCode) + Send + Sync>;
/// Sink for elections confirmed while processing a vote.
pub type ConfirmedSink = Box<dyn Fn(ElectionStatus) + Send + Sync>;

struct Queue {
    votes: VecDeque<(Vote, SocketAddr)>,
    /// A batch is being processed outside the lock.
    active: bool,
    stopped: bool,
}

pub struct VoteProcessorShared {
    queue: Mutex<Queue>,
    condition: Condvar,
    active_elections: Arc<Mutex<ActiveElections>>,
    online_reps: Arc<Mutex<OnlineReps>>,
    ledger: Arc<Ledger>,
    observer: VoteObserver,
    confirmed_sink: ConfirmedSink,
}

/// Single-consumer vote queue with a dedicated worker thread.
pub struct VoteProcessor {
    shared: Arc<VoteProcessorShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl VoteProcessor {
    pub fn new(
        active_elections: Arc<Mutex<ActiveElections>>,
        online_reps: Arc<Mutex<OnlineReps>>,
        ledger: Arc<Ledger>,
        observer: VoteObserver,
        confirmed_sink: ConfirmedSink,
    ) -> Self {
        let shared = Arc::new(VoteProcessorShared {
            queue: Mutex::new(Queue {
                votes: VecDeque::new(),
                active: false,
                stopped: false,
            }),
            condition: Condvar::new(),
            active_elections,
            online_reps,
            ledger,
            observer,
            confirmed_sink,
        });
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("vote processor".into())
            .spawn(move || Self::process_loop(worker))
            .expect("spawning the vote processor thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Enqueue a vote for processing.
    pub fn vote(&self, vote: Vote, endpoint: SocketAddr) {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.stopped {
            return;
        }
        queue.votes.push_back((vote, endpoint));
        self.shared.condition.notify_all();
    }

    /// Validate and route one vote synchronously. Exposed so tests (and the
    /// wire dispatcher under backpressure) can bypass the queue.
    pub fn vote_blocking(shared: &VoteProcessorShared, vote: &Vote, endpoint: SocketAddr) -> VoteCode {
        let code = if !vote.validate() {
            VoteCode::Invalid
        } else {
            let now = Timestamp::now();
            let online_stake = {
                let mut online = shared.online_reps.lock().unwrap();
                online.observe(vote.account, now);
                online.online_stake()
            };
            let (replay, confirmed) = shared.active_elections.lock().unwrap().vote(
                vote,
                &shared.ledger,
                online_stake,
                now,
            );
            for status in confirmed {
                (shared.confirmed_sink)(status);
            }
            if replay {
                VoteCode::Replay
            } else {
                VoteCode::Vote
            }
        };
        trace!(account = %vote.account, sequence = vote.sequence, ?code, "vote processed");
        (shared.observer)(vote, endpoint, code);
        code
    }

    fn process_loop(shared: Arc<VoteProcessorShared>) {
        let mut queue = shared.queue.lock().unwrap();
        loop {
            if queue.stopped {
                break;
            }
            if queue.votes.is_empty() {
                queue.active = false;
                shared.condition.notify_all();
                queue = shared.condition.wait(queue).unwrap();
                continue;
            }
            let batch: Vec<_> = queue.votes.drain(..).collect();
            queue.active = true;
            drop(queue);
            for (vote, endpoint) in &batch {
                Self::vote_blocking(&shared, vote, *endpoint);
            }
            queue = shared.queue.lock().unwrap();
        }
        debug!("vote processor stopped");
    }

    /// Block until every queued vote has been processed. Used by tests for
    /// determinism.
    pub fn flush(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        while !queue.stopped && (!queue.votes.is_empty() || queue.active) {
            queue = self.shared.condition.wait(queue).unwrap();
        }
    }

    /// Stop the worker and join it.
    pub fn stop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.stopped = true;
            self.shared.condition.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Shared state handle for synchronous submission via [`vote_blocking`].
    ///
    /// [`vote_blocking`]: VoteProcessor::vote_blocking
    pub fn shared(&self) -> &Arc<VoteProcessorShared> {
        &self.shared
    }
}

impl Drop for VoteProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::active_elections::QuorumSettings;
    use lattice_crypto::keypair_from_seed;
    use lattice_ledger::{BlockBuilder, BlockKind, MemoryStore};
    use lattice_types::{Account, Amount, KeyPair};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoint() -> SocketAddr {
        "[::1]:54000".parse().unwrap()
    }

    fn keys(seed: u8) -> KeyPair {
        keypair_from_seed(&[seed; 32])
    }

    struct Fixture {
        processor: VoteProcessor,
        active: Arc<Mutex<ActiveElections>>,
        ledger: Arc<Ledger>,
        codes: Arc<Mutex<Vec<VoteCode>>>,
        confirmed: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), 0));
        let active = Arc::new(Mutex::new(ActiveElections::new(QuorumSettings {
            online_weight_minimum: Amount::new(1_000_000),
            quorum_percent: 50,
        })));
        let online = Arc::new(Mutex::new(OnlineReps::new(Amount::ZERO)));
        let codes = Arc::new(Mutex::new(Vec::new()));
        let codes_clone = codes.clone();
        let confirmed = Arc::new(AtomicUsize::new(0));
        let confirmed_clone = confirmed.clone();
        let processor = VoteProcessor::new(
            active.clone(),
            online,
            ledger.clone(),
            Box::new(move |_, _, code| codes_clone.lock().unwrap().push(code)),
            Box::new(move |_| {
                confirmed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Fixture {
            processor,
            active,
            ledger,
            codes,
            confirmed,
        }
    }

    fn start_election(fixture: &Fixture, seed: u8) -> lattice_types::BlockHash {
        let kp = keys(seed);
        let account = Account::from(kp.public);
        let block = BlockBuilder::new(BlockKind::State, account)
            .representative(account)
            .balance(Amount::new(10))
            .sign(&kp.private);
        let hash = block.hash;
        fixture.active.lock().unwrap().start(block, None);
        hash
    }

    #[test]
    fn invalid_signature_reported() {
        let fixture = fixture();
        let kp = keys(1);
        let mut vote = Vote::new(
            Account::from(kp.public),
            1,
            vec![lattice_types::BlockHash::new([1u8; 32])],
            &kp.private,
        );
        vote.sequence = 2; // breaks the signature
        fixture.processor.vote(vote, endpoint());
        fixture.processor.flush();
        assert_eq!(fixture.codes.lock().unwrap().as_slice(), &[VoteCode::Invalid]);
    }

    #[test]
    fn replay_detected_across_queue() {
        let fixture = fixture();
        let hash = start_election(&fixture, 1);
        let rep = keys(9);
        fixture
            .ledger
            .store()
            .add_rep_weight(&Account::from(rep.public), Amount::new(1));

        let v5 = Vote::new(Account::from(rep.public), 5, vec![hash], &rep.private);
        let v3 = Vote::new(Account::from(rep.public), 3, vec![hash], &rep.private);
        fixture.processor.vote(v5, endpoint());
        fixture.processor.vote(v3, endpoint());
        fixture.processor.flush();

        let codes = fixture.codes.lock().unwrap();
        assert_eq!(codes.as_slice(), &[VoteCode::Vote, VoteCode::Replay]);
    }

    #[test]
    fn quorum_vote_reaches_confirmed_sink() {
        let fixture = fixture();
        let hash = start_election(&fixture, 1);
        let rep = keys(9);
        fixture
            .ledger
            .store()
            .add_rep_weight(&Account::from(rep.public), Amount::new(600_000));

        let vote = Vote::new(Account::from(rep.public), 1, vec![hash], &rep.private);
        fixture.processor.vote(vote, endpoint());
        fixture.processor.flush();
        assert_eq!(fixture.confirmed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_on_empty_queue_returns() {
        let fixture = fixture();
        fixture.processor.flush();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut fixture = fixture();
        fixture.processor.stop();
        fixture.processor.stop();
    }
}
