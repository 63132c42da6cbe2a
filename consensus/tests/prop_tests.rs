//! Property tests for election bookkeeping.

use std::sync::Arc;

use lattice_crypto::keypair_from_seed;
use lattice_ledger::{BlockBuilder, BlockKind, Ledger, MemoryStore};
use lattice_consensus::Election;
use lattice_types::{Account, Amount, Timestamp};
use proptest::prelude::*;

fn candidate_block() -> lattice_ledger::Block {
    let kp = keypair_from_seed(&[1u8; 32]);
    BlockBuilder::new(BlockKind::State, Account::from(kp.public))
        .representative(Account::from(kp.public))
        .balance(Amount::new(10))
        .sign(&kp.private)
}

proptest! {
    /// After any sequence of votes from one account, the recorded sequence
    /// never decreases and always equals the maximum sequence seen.
    #[test]
    fn recorded_sequence_is_monotonic(sequences in proptest::collection::vec(1u64..100, 1..40)) {
        let mut election = Election::new(candidate_block());
        let voter = Account::new([7u8; 32]);
        let hash = election.winner_hash();

        let mut max_seen = 0u64;
        for (i, sequence) in sequences.iter().enumerate() {
            let result = election.vote(voter, *sequence, hash, Timestamp::new(i as u64));
            let recorded = election.last_vote(&voter).unwrap().sequence;
            prop_assert!(recorded >= max_seen);
            if *sequence > max_seen {
                prop_assert!(!result.replay);
                max_seen = *sequence;
            } else {
                prop_assert!(result.replay);
            }
            prop_assert_eq!(recorded, max_seen);
        }
    }

    /// However votes arrive, confirmation fires at most once.
    #[test]
    fn confirmation_fires_at_most_once(
        weights in proptest::collection::vec(1u128..1000, 1..20),
        quorum in 1u128..=100,
    ) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store, 0);
        let block = candidate_block();
        let hash = block.hash;
        let mut election = Election::new(block);

        let mut confirmations = 0;
        for (i, weight) in weights.iter().enumerate() {
            let rep = Account::new([i as u8 + 1; 32]);
            ledger.store().add_rep_weight(&rep, Amount::new(*weight));
            election.vote(rep, 1, hash, Timestamp::new(i as u64));
            if election
                .confirm_if_quorum(&ledger, Amount::new(500), Amount::ZERO, quorum)
                .is_some()
            {
                confirmations += 1;
            }
        }
        prop_assert!(confirmations <= 1);
        if confirmations == 1 {
            prop_assert!(election.is_confirmed());
        }
    }
}
