//! Serialized block admission and rollback.
//!
//! `process` is the linearization point for fork detection: callers (the
//! block processor thread and election confirmation) never run it
//! concurrently. Each admission either advances exactly one account chain or
//! returns a rejection code describing why the block cannot be applied yet.

use std::sync::Arc;

use lattice_types::{Account, Amount, BlockHash, Timestamp};
use tracing::debug;

use crate::block::{work_value, Block, BlockKind};
use crate::error::LedgerError;
use crate::store::{AccountInfo, PendingInfo, Store};

/// Outcome of attempting to admit one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Inserted; the account chain advanced.
    Progress,
    /// `previous` is not in the ledger.
    GapPrevious,
    /// The linked source (send) block is not in the ledger.
    GapSource,
    /// Already present.
    Old,
    /// Signature does not verify against the account key.
    BadSignature,
    /// A send whose balance exceeds the prior balance.
    NegativeSpend,
    /// Receive of a source that is not pending for this account.
    Unreceivable,
    /// Another block already occupies this root.
    Fork,
    /// Work nonce below the network threshold.
    InsufficientWork,
    /// Attempt to open a chain for the burn account.
    OpenedBurnAccount,
    /// Declared balance disagrees with the computed transition.
    BalanceMismatch,
    /// A block kind that may not change the representative tried to.
    RepresentativeMismatch,
    /// The block cannot follow its predecessor (wrong chain or kind order).
    BlockPosition,
}

/// The ledger: admission rules over an abstract [`Store`].
pub struct Ledger {
    store: Arc<dyn Store>,
    work_threshold: u64,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, work_threshold: u64) -> Self {
        Self {
            store,
            work_threshold,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Admit a genesis block directly, bypassing the pending-source check.
    /// Only valid on an empty chain for that account.
    pub fn insert_genesis(&self, block: &Block) {
        self.store.put_block(block);
        self.store.set_account_info(
            &block.account,
            AccountInfo {
                head: block.hash,
                open_block: block.hash,
                representative: block.representative,
                balance: block.balance,
                block_count: 1,
                modified: 0,
            },
        );
        self.store.add_rep_weight(&block.representative, block.balance);
    }

    /// The head hash of an account chain, if opened.
    pub fn latest(&self, account: &Account) -> Option<BlockHash> {
        self.store.get_account_info(account).map(|info| info.head)
    }

    /// Current balance of an account.
    pub fn balance(&self, account: &Account) -> Amount {
        self.store
            .get_account_info(account)
            .map(|info| info.balance)
            .unwrap_or(Amount::ZERO)
    }

    /// Current delegated weight of a representative.
    pub fn weight(&self, representative: &Account) -> Amount {
        self.store.rep_weight(representative)
    }

    /// Attempt to admit a block. See [`ProcessResult`] for outcomes.
    pub fn process(&self, block: &Block, now: Timestamp) -> ProcessResult {
        if self.store.block_exists(&block.hash) {
            return ProcessResult::Old;
        }
        if work_value(&block.root(), block.work) < self.work_threshold {
            return ProcessResult::InsufficientWork;
        }
        if !block.verify() {
            return ProcessResult::BadSignature;
        }

        let result = if block.is_open() {
            self.process_open(block, now)
        } else {
            self.process_successor(block, now)
        };
        if result == ProcessResult::Progress {
            debug!(hash = %block.hash, account = %block.account, "block admitted");
        }
        result
    }

    fn process_open(&self, block: &Block, now: Timestamp) -> ProcessResult {
        if block.account == Account::BURN {
            return ProcessResult::OpenedBurnAccount;
        }
        if !matches!(block.kind, BlockKind::Open | BlockKind::State) {
            return ProcessResult::BlockPosition;
        }
        if self.store.get_account_info(&block.account).is_some()
            || self.store.block_by_root(&block.root()).is_some()
        {
            return ProcessResult::Fork;
        }

        // An open must receive exactly one pending send.
        let pending = match self.store.get_pending(&block.account, &block.source()) {
            Some(pending) => pending,
            None if self.store.block_exists(&block.source()) => {
                return ProcessResult::Unreceivable
            }
            None => return ProcessResult::GapSource,
        };
        if block.balance != pending.amount {
            return ProcessResult::BalanceMismatch;
        }

        self.store.delete_pending(&block.account, &block.source());
        self.store.put_block(block);
        self.store.set_account_info(
            &block.account,
            AccountInfo {
                head: block.hash,
                open_block: block.hash,
                representative: block.representative,
                balance: block.balance,
                block_count: 1,
                modified: now.as_secs(),
            },
        );
        self.store.add_rep_weight(&block.representative, block.balance);
        ProcessResult::Progress
    }

    fn process_successor(&self, block: &Block, now: Timestamp) -> ProcessResult {
        let Some(prev_block) = self.store.get_block(&block.previous) else {
            return ProcessResult::GapPrevious;
        };
        if prev_block.account != block.account {
            return ProcessResult::BlockPosition;
        }
        let Some(info) = self.store.get_account_info(&block.account) else {
            return ProcessResult::GapPrevious;
        };
        if info.head != block.previous {
            // Some block already follows `previous`: competing chain slot.
            return ProcessResult::Fork;
        }
        // Legacy kinds may not follow a state block.
        if block.kind.is_legacy() && prev_block.kind == BlockKind::State {
            return ProcessResult::BlockPosition;
        }

        let result = match block.kind {
            BlockKind::Send => self.apply_send(block, &info),
            BlockKind::Receive => self.apply_receive(block, &info),
            BlockKind::Change => {
                if block.balance != info.balance {
                    return ProcessResult::BalanceMismatch;
                }
                ProcessResult::Progress
            }
            BlockKind::State => self.apply_state(block, &info),
            BlockKind::Open => ProcessResult::BlockPosition,
        };
        if result != ProcessResult::Progress {
            return result;
        }

        // Move delegated weight from the old representative to the new one.
        self.store.sub_rep_weight(&info.representative, info.balance);
        self.store.add_rep_weight(&block.representative, block.balance);

        self.store.put_block(block);
        self.store.set_account_info(
            &block.account,
            AccountInfo {
                head: block.hash,
                open_block: info.open_block,
                representative: block.representative,
                balance: block.balance,
                block_count: info.block_count + 1,
                modified: now.as_secs(),
            },
        );
        ProcessResult::Progress
    }

    fn apply_send(&self, block: &Block, info: &AccountInfo) -> ProcessResult {
        if block.representative != info.representative {
            return ProcessResult::RepresentativeMismatch;
        }
        if block.balance > info.balance {
            return ProcessResult::NegativeSpend;
        }
        let amount = info.balance - block.balance;
        if amount.is_zero() {
            return ProcessResult::BalanceMismatch;
        }
        self.store.put_pending(
            &block.destination(),
            &block.hash,
            PendingInfo {
                source_account: block.account,
                amount,
            },
        );
        ProcessResult::Progress
    }

    fn apply_receive(&self, block: &Block, info: &AccountInfo) -> ProcessResult {
        if block.representative != info.representative {
            return ProcessResult::RepresentativeMismatch;
        }
        let pending = match self.store.get_pending(&block.account, &block.source()) {
            Some(pending) => pending,
            None if self.store.block_exists(&block.source()) => {
                return ProcessResult::Unreceivable
            }
            None => return ProcessResult::GapSource,
        };
        if block.balance != info.balance + pending.amount {
            return ProcessResult::BalanceMismatch;
        }
        self.store.delete_pending(&block.account, &block.source());
        ProcessResult::Progress
    }

    fn apply_state(&self, block: &Block, info: &AccountInfo) -> ProcessResult {
        if block.balance < info.balance {
            // Send: link names the destination.
            let amount = info.balance - block.balance;
            self.store.put_pending(
                &block.destination(),
                &block.hash,
                PendingInfo {
                    source_account: block.account,
                    amount,
                },
            );
            ProcessResult::Progress
        } else if block.balance > info.balance {
            // Receive: link names the source send.
            let pending = match self.store.get_pending(&block.account, &block.source()) {
                Some(pending) => pending,
                None if self.store.block_exists(&block.source()) => {
                    return ProcessResult::Unreceivable
                }
                None => return ProcessResult::GapSource,
            };
            if block.balance != info.balance + pending.amount {
                return ProcessResult::BalanceMismatch;
            }
            self.store.delete_pending(&block.account, &block.source());
            ProcessResult::Progress
        } else {
            // Balance-neutral: representative change only; link must be zero.
            if !block.link.is_zero() {
                return ProcessResult::BalanceMismatch;
            }
            ProcessResult::Progress
        }
    }

    /// Roll back the account chain holding `hash`, head first, until `hash`
    /// itself has been removed. Returns the removed hashes in rollback order.
    pub fn rollback(&self, hash: &BlockHash) -> Result<Vec<BlockHash>, LedgerError> {
        let target = self
            .store
            .get_block(hash)
            .ok_or_else(|| LedgerError::BlockNotFound(hash.to_string()))?;
        let account = target.account;
        let mut removed = Vec::new();

        loop {
            let info = self
                .store
                .get_account_info(&account)
                .ok_or_else(|| LedgerError::AccountNotFound(account.to_string()))?;
            let head = self
                .store
                .get_block(&info.head)
                .ok_or_else(|| LedgerError::BlockNotFound(info.head.to_string()))?;

            self.undo_block(&head, &info)?;
            removed.push(head.hash);
            debug!(hash = %head.hash, account = %account, "block rolled back");

            if head.hash == *hash {
                return Ok(removed);
            }
            if removed.len() > 10_000 {
                return Err(LedgerError::RollbackTooDeep);
            }
        }
    }

    fn undo_block(&self, block: &Block, info: &AccountInfo) -> Result<(), LedgerError> {
        self.store.sub_rep_weight(&info.representative, info.balance);
        self.store.delete_block(&block.hash);

        if block.is_open() {
            self.store.delete_account_info(&block.account);
        } else {
            let prev = self
                .store
                .get_block(&block.previous)
                .ok_or_else(|| LedgerError::BlockNotFound(block.previous.to_string()))?;
            self.store.add_rep_weight(&prev.representative, prev.balance);
            self.store.set_account_info(
                &block.account,
                AccountInfo {
                    head: prev.hash,
                    open_block: info.open_block,
                    representative: prev.representative,
                    balance: prev.balance,
                    block_count: info.block_count.saturating_sub(1),
                    modified: info.modified,
                },
            );
        }

        // Reverse the pending side effects.
        let prev_balance = if block.is_open() {
            Amount::ZERO
        } else {
            self.store
                .get_block(&block.previous)
                .map(|prev| prev.balance)
                .unwrap_or(Amount::ZERO)
        };
        if block.balance < prev_balance {
            // Was a send: retract the unreceived pending entry.
            self.store.delete_pending(&block.destination(), &block.hash);
        } else if block.balance > prev_balance || block.is_open() {
            // Was a receive: the source send becomes pending again.
            if let Some(source) = self.store.get_block(&block.source()) {
                let amount = block.balance - prev_balance;
                self.store.put_pending(
                    &block.account,
                    &block.source(),
                    PendingInfo {
                        source_account: source.account,
                        amount,
                    },
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::store::MemoryStore;
    use lattice_crypto::keypair_from_seed;
    use lattice_types::KeyPair;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()), 0)
    }

    fn keys(seed: u8) -> KeyPair {
        keypair_from_seed(&[seed; 32])
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

    fn now() -> Timestamp {
        Timestamp::new(1_000)
    }

    #[test]
    fn send_and_receive_between_accounts() {
        let ledger = ledger();
        let alice = keys(1);
        let bob = keys(2);
        let genesis_block = genesis(&ledger, &alice, 1000);
        let alice_account = Account::from(alice.public);
        let bob_account = Account::from(bob.public);

        let send = BlockBuilder::new(BlockKind::Send, alice_account)
            .previous(genesis_block.hash)
            .representative(alice_account)
            .balance(Amount::new(600))
            .link(BlockHash::new(bob_account.0))
            .sign(&alice.private);
        assert_eq!(ledger.process(&send, now()), ProcessResult::Progress);
        assert_eq!(ledger.balance(&alice_account), Amount::new(600));

        let open = BlockBuilder::new(BlockKind::Open, bob_account)
            .representative(bob_account)
            .balance(Amount::new(400))
            .link(send.hash)
            .sign(&bob.private);
        assert_eq!(ledger.process(&open, now()), ProcessResult::Progress);
        assert_eq!(ledger.balance(&bob_account), Amount::new(400));
        assert_eq!(ledger.weight(&bob_account), Amount::new(400));
    }

    #[test]
    fn duplicate_is_old() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 100);
        assert_eq!(ledger.process(&g, now()), ProcessResult::Old);
    }

    #[test]
    fn unknown_previous_is_gap() {
        let ledger = ledger();
        let alice = keys(1);
        let account = Account::from(alice.public);
        let block = BlockBuilder::new(BlockKind::Send, account)
            .previous(BlockHash::new([9u8; 32]))
            .balance(Amount::new(1))
            .sign(&alice.private);
        assert_eq!(ledger.process(&block, now()), ProcessResult::GapPrevious);
    }

    #[test]
    fn fork_when_root_occupied() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 1000);
        let account = Account::from(alice.public);

        let send_a = BlockBuilder::new(BlockKind::Send, account)
            .previous(g.hash)
            .representative(account)
            .balance(Amount::new(900))
            .link(BlockHash::new([1u8; 32]))
            .sign(&alice.private);
        assert_eq!(ledger.process(&send_a, now()), ProcessResult::Progress);

        let send_b = BlockBuilder::new(BlockKind::Send, account)
            .previous(g.hash)
            .representative(account)
            .balance(Amount::new(800))
            .link(BlockHash::new([2u8; 32]))
            .sign(&alice.private);
        assert_eq!(ledger.process(&send_b, now()), ProcessResult::Fork);
    }

    #[test]
    fn negative_spend_rejected() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 100);
        let account = Account::from(alice.public);
        let send = BlockBuilder::new(BlockKind::Send, account)
            .previous(g.hash)
            .representative(account)
            .balance(Amount::new(200))
            .link(BlockHash::new([1u8; 32]))
            .sign(&alice.private);
        assert_eq!(ledger.process(&send, now()), ProcessResult::NegativeSpend);
    }

    #[test]
    fn bad_signature_rejected() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 100);
        let account = Account::from(alice.public);
        let send = BlockBuilder::new(BlockKind::Send, account)
            .previous(g.hash)
            .representative(account)
            .balance(Amount::new(50))
            .unsigned();
        assert_eq!(ledger.process(&send, now()), ProcessResult::BadSignature);
    }

    #[test]
    fn burn_account_cannot_open() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 100);
        let account = Account::from(alice.public);

        let send = BlockBuilder::new(BlockKind::Send, account)
            .previous(g.hash)
            .representative(account)
            .balance(Amount::new(50))
            .link(BlockHash::ZERO) // destination: burn account
            .sign(&alice.private);
        assert_eq!(ledger.process(&send, now()), ProcessResult::Progress);

        // Even with pending funds, the burn account may not be opened. The
        // signature gate fires first for a mismatched key, so construct a
        // burn-account open signed by some key and expect rejection.
        let mallory = keys(3);
        let mut open = BlockBuilder::new(BlockKind::Open, Account::BURN)
            .balance(Amount::new(50))
            .link(send.hash)
            .unsigned();
        open.signature = lattice_crypto::sign_message(open.hash.as_bytes(), &mallory.private);
        let result = ledger.process(&open, now());
        assert!(matches!(
            result,
            ProcessResult::BadSignature | ProcessResult::OpenedBurnAccount
        ));
    }

    #[test]
    fn receive_requires_pending() {
        let ledger = ledger();
        let alice = keys(1);
        let bob = keys(2);
        let _g = genesis(&ledger, &alice, 1000);
        let bob_account = Account::from(bob.public);

        let open = BlockBuilder::new(BlockKind::Open, bob_account)
            .representative(bob_account)
            .balance(Amount::new(100))
            .link(BlockHash::new([7u8; 32]))
            .sign(&bob.private);
        // Source is entirely unknown: gap, not unreceivable.
        assert_eq!(ledger.process(&open, now()), ProcessResult::GapSource);
    }

    #[test]
    fn receive_of_non_pending_source_unreceivable() {
        let ledger = ledger();
        let alice = keys(1);
        let bob = keys(2);
        let g = genesis(&ledger, &alice, 1000);
        let bob_account = Account::from(bob.public);

        // Bob tries to "receive" the genesis block, which was never sent to him.
        let open = BlockBuilder::new(BlockKind::Open, bob_account)
            .representative(bob_account)
            .balance(Amount::new(1000))
            .link(g.hash)
            .sign(&bob.private);
        assert_eq!(ledger.process(&open, now()), ProcessResult::Unreceivable);
    }

    #[test]
    fn state_block_rep_change_moves_weight() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 500);
        let account = Account::from(alice.public);
        let new_rep = Account::new([0xAB; 32]);

        let change = BlockBuilder::new(BlockKind::State, account)
            .previous(g.hash)
            .representative(new_rep)
            .balance(Amount::new(500))
            .sign(&alice.private);
        assert_eq!(ledger.process(&change, now()), ProcessResult::Progress);
        assert_eq!(ledger.weight(&new_rep), Amount::new(500));
        assert_eq!(ledger.weight(&account), Amount::ZERO);
    }

    #[test]
    fn legacy_block_cannot_follow_state_block() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 500);
        let account = Account::from(alice.public);

        let state = BlockBuilder::new(BlockKind::State, account)
            .previous(g.hash)
            .representative(account)
            .balance(Amount::new(500))
            .sign(&alice.private);
        assert_eq!(ledger.process(&state, now()), ProcessResult::Progress);

        let send = BlockBuilder::new(BlockKind::Send, account)
            .previous(state.hash)
            .representative(account)
            .balance(Amount::new(400))
            .link(BlockHash::new([1u8; 32]))
            .sign(&alice.private);
        assert_eq!(ledger.process(&send, now()), ProcessResult::BlockPosition);
    }

    #[test]
    fn rollback_restores_prior_state() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 1000);
        let account = Account::from(alice.public);

        let send = BlockBuilder::new(BlockKind::Send, account)
            .previous(g.hash)
            .representative(account)
            .balance(Amount::new(700))
            .link(BlockHash::new([1u8; 32]))
            .sign(&alice.private);
        assert_eq!(ledger.process(&send, now()), ProcessResult::Progress);
        assert_eq!(ledger.balance(&account), Amount::new(700));

        let removed = ledger.rollback(&send.hash).unwrap();
        assert_eq!(removed, vec![send.hash]);
        assert_eq!(ledger.balance(&account), Amount::new(1000));
        assert_eq!(ledger.latest(&account), Some(g.hash));
        assert_eq!(ledger.weight(&account), Amount::new(1000));
        // The retracted send's pending entry is gone.
        assert!(ledger
            .store()
            .get_pending(&Account::new([1u8; 32]), &send.hash)
            .is_none());
    }

    #[test]
    fn rollback_multiple_blocks_head_first() {
        let ledger = ledger();
        let alice = keys(1);
        let g = genesis(&ledger, &alice, 1000);
        let account = Account::from(alice.public);

        let s1 = BlockBuilder::new(BlockKind::Send, account)
            .previous(g.hash)
            .representative(account)
            .balance(Amount::new(900))
            .link(BlockHash::new([1u8; 32]))
            .sign(&alice.private);
        let s2 = BlockBuilder::new(BlockKind::Send, account)
            .previous(s1.hash)
            .representative(account)
            .balance(Amount::new(800))
            .link(BlockHash::new([2u8; 32]))
            .sign(&alice.private);
        assert_eq!(ledger.process(&s1, now()), ProcessResult::Progress);
        assert_eq!(ledger.process(&s2, now()), ProcessResult::Progress);

        let removed = ledger.rollback(&s1.hash).unwrap();
        assert_eq!(removed, vec![s2.hash, s1.hash]);
        assert_eq!(ledger.latest(&account), Some(g.hash));
        assert_eq!(ledger.balance(&account), Amount::new(1000));
    }

    #[test]
    fn insufficient_work_rejected() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store, u64::MAX);
        let alice = keys(1);
        let account = Account::from(alice.public);
        let block = BlockBuilder::new(BlockKind::Open, account)
            .representative(account)
            .balance(Amount::new(1))
            .link(BlockHash::new([1u8; 32]))
            .sign(&alice.private);
        assert_eq!(
            ledger.process(&block, now()),
            ProcessResult::InsufficientWork
        );
    }
}
