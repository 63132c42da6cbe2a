//! The transactional block store abstraction.
//!
//! The consensus core only needs a handful of operations: block lookup and
//! insertion, per-account head info, pending (sent-but-unreceived) entries,
//! and representative weights. The on-disk implementation lives outside this
//! workspace; `MemoryStore` backs tests and the default node.
//!
//! Writes are serialized by construction: the block processor thread and
//! election confirmation are the only writers, and both hold the owning
//! component's lock for the duration of a batch.

use lattice_types::{Account, Amount, BlockHash, Root};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::block::Block;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block {0} not found")]
    NotFound(String),

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Head state for one account chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub head: BlockHash,
    pub open_block: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub block_count: u64,
    pub modified: u64,
}

/// A send awaiting receipt, keyed by `(destination, source_hash)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInfo {
    pub source_account: Account,
    pub amount: Amount,
}

/// Storage operations required by the consensus core.
pub trait Store: Send + Sync {
    fn get_block(&self, hash: &BlockHash) -> Option<Block>;
    fn put_block(&self, block: &Block);
    fn delete_block(&self, hash: &BlockHash);
    fn block_exists(&self, hash: &BlockHash) -> bool;
    /// The block occupying `root`: the successor of `previous`, or the open
    /// block for an account root. Fork detection pivots on this lookup.
    fn block_by_root(&self, root: &Root) -> Option<Block>;

    fn get_account_info(&self, account: &Account) -> Option<AccountInfo>;
    fn set_account_info(&self, account: &Account, info: AccountInfo);
    fn delete_account_info(&self, account: &Account);
    fn account_count(&self) -> u64;

    fn get_pending(&self, destination: &Account, source: &BlockHash) -> Option<PendingInfo>;
    fn put_pending(&self, destination: &Account, source: &BlockHash, info: PendingInfo);
    fn delete_pending(&self, destination: &Account, source: &BlockHash);

    fn rep_weight(&self, representative: &Account) -> Amount;
    fn add_rep_weight(&self, representative: &Account, delta: Amount);
    fn sub_rep_weight(&self, representative: &Account, delta: Amount);
    fn rep_weights(&self) -> Vec<(Account, Amount)>;

    fn block_count(&self) -> u64;
}

#[derive(Default)]
struct MemoryStoreInner {
    blocks: HashMap<BlockHash, Block>,
    by_root: HashMap<Root, BlockHash>,
    accounts: HashMap<Account, AccountInfo>,
    pending: HashMap<(Account, BlockHash), PendingInfo>,
    weights: HashMap<Account, Amount>,
}

/// In-memory store. Interior mutability so the node can share one handle
/// across components; see the module docs for the write-serialization rule.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        self.inner.read().unwrap().blocks.get(hash).cloned()
    }

    fn put_block(&self, block: &Block) {
        let mut inner = self.inner.write().unwrap();
        inner.by_root.insert(block.root(), block.hash);
        inner.blocks.insert(block.hash, block.clone());
    }

    fn delete_block(&self, hash: &BlockHash) {
        let mut inner = self.inner.write().unwrap();
        if let Some(block) = inner.blocks.remove(hash) {
            let root = block.root();
            if inner.by_root.get(&root) == Some(hash) {
                inner.by_root.remove(&root);
            }
        }
    }

    fn block_exists(&self, hash: &BlockHash) -> bool {
        self.inner.read().unwrap().blocks.contains_key(hash)
    }

    fn block_by_root(&self, root: &Root) -> Option<Block> {
        let inner = self.inner.read().unwrap();
        let hash = inner.by_root.get(root)?;
        inner.blocks.get(hash).cloned()
    }

    fn get_account_info(&self, account: &Account) -> Option<AccountInfo> {
        self.inner.read().unwrap().accounts.get(account).cloned()
    }

    fn set_account_info(&self, account: &Account, info: AccountInfo) {
        self.inner.write().unwrap().accounts.insert(*account, info);
    }

    fn delete_account_info(&self, account: &Account) {
        self.inner.write().unwrap().accounts.remove(account);
    }

    fn account_count(&self) -> u64 {
        self.inner.read().unwrap().accounts.len() as u64
    }

    fn get_pending(&self, destination: &Account, source: &BlockHash) -> Option<PendingInfo> {
        self.inner
            .read()
            .unwrap()
            .pending
            .get(&(*destination, *source))
            .cloned()
    }

    fn put_pending(&self, destination: &Account, source: &BlockHash, info: PendingInfo) {
        self.inner
            .write()
            .unwrap()
            .pending
            .insert((*destination, *source), info);
    }

    fn delete_pending(&self, destination: &Account, source: &BlockHash) {
        self.inner
            .write()
            .unwrap()
            .pending
            .remove(&(*destination, *source));
    }

    fn rep_weight(&self, representative: &Account) -> Amount {
        self.inner
            .read()
            .unwrap()
            .weights
            .get(representative)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    fn add_rep_weight(&self, representative: &Account, delta: Amount) {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .weights
            .entry(*representative)
            .or_insert(Amount::ZERO);
        *entry += delta;
    }

    fn sub_rep_weight(&self, representative: &Account, delta: Amount) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.weights.get_mut(representative) {
            *entry = entry.saturating_sub(delta);
            if entry.is_zero() {
                inner.weights.remove(representative);
            }
        }
    }

    fn rep_weights(&self) -> Vec<(Account, Amount)> {
        self.inner
            .read()
            .unwrap()
            .weights
            .iter()
            .map(|(account, weight)| (*account, *weight))
            .collect()
    }

    fn block_count(&self) -> u64 {
        self.inner.read().unwrap().blocks.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockBuilder, BlockKind};
    use lattice_crypto::keypair_from_seed;

    fn sample_block(seed: u8) -> Block {
        let kp = keypair_from_seed(&[seed; 32]);
        BlockBuilder::new(BlockKind::Open, Account::from(kp.public))
            .balance(Amount::new(10))
            .sign(&kp.private)
    }

    #[test]
    fn put_and_get_block() {
        let store = MemoryStore::new();
        let block = sample_block(1);
        store.put_block(&block);
        assert!(store.block_exists(&block.hash));
        assert_eq!(store.get_block(&block.hash), Some(block.clone()));
        assert_eq!(store.block_by_root(&block.root()), Some(block));
    }

    #[test]
    fn delete_clears_root_index() {
        let store = MemoryStore::new();
        let block = sample_block(1);
        store.put_block(&block);
        store.delete_block(&block.hash);
        assert!(!store.block_exists(&block.hash));
        assert!(store.block_by_root(&block.root()).is_none());
    }

    #[test]
    fn rep_weight_accumulates_and_clears() {
        let store = MemoryStore::new();
        let rep = Account::new([1u8; 32]);
        store.add_rep_weight(&rep, Amount::new(100));
        store.add_rep_weight(&rep, Amount::new(50));
        assert_eq!(store.rep_weight(&rep), Amount::new(150));

        store.sub_rep_weight(&rep, Amount::new(150));
        assert_eq!(store.rep_weight(&rep), Amount::ZERO);
        assert!(store.rep_weights().is_empty());
    }

    #[test]
    fn pending_round_trip() {
        let store = MemoryStore::new();
        let destination = Account::new([2u8; 32]);
        let source = BlockHash::new([3u8; 32]);
        let info = PendingInfo {
            source_account: Account::new([4u8; 32]),
            amount: Amount::new(7),
        };
        store.put_pending(&destination, &source, info.clone());
        assert_eq!(store.get_pending(&destination, &source), Some(info));
        store.delete_pending(&destination, &source);
        assert!(store.get_pending(&destination, &source).is_none());
    }
}
