//! The block model.
//!
//! Every account owns its own chain; a block's `previous` points at the prior
//! block on that chain (zero for a chain-opening block). Legacy kinds (send,
//! receive, open, change) each mutate one aspect of account state; `state`
//! blocks carry the full resulting state and subsume all of them. Only state
//! blocks may be vote-stapled.

use lattice_crypto::{blake2b_parts, sign_message, verify_signature};
use lattice_types::{Account, Amount, BlockHash, PrivateKey, PublicKey, Root, Signature};
use serde::{Deserialize, Serialize};

/// Block kind discriminant. The numeric values are the wire encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockKind {
    Send = 2,
    Receive = 3,
    Open = 4,
    Change = 5,
    State = 6,
}

impl BlockKind {
    /// Legacy kinds predate state blocks and carry partial account state.
    pub fn is_legacy(&self) -> bool {
        !matches!(self, BlockKind::State)
    }
}

/// A block in the lattice. Immutable once constructed; the cached `hash` is
/// computed over every consensus-relevant field.
///
/// Field use by kind:
/// - `link` is the destination account for sends, the source block hash for
///   receives/opens, and either for state blocks (zero when only the
///   representative or balance-neutral state changes).
/// - `balance` is the account balance *after* this block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    pub account: Account,
    pub previous: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub link: BlockHash,
    pub work: u64,
    pub signature: Signature,
    pub hash: BlockHash,
}

impl Block {
    /// Compute the content hash over all consensus-relevant fields.
    pub fn compute_hash(&self) -> BlockHash {
        let kind_tag = [self.kind as u8];
        let balance = self.balance.raw().to_be_bytes();
        let work = self.work.to_be_bytes();
        BlockHash::new(blake2b_parts(&[
            &kind_tag,
            self.account.as_bytes(),
            self.previous.as_bytes(),
            self.representative.as_bytes(),
            &balance,
            self.link.as_bytes(),
            &work,
        ]))
    }

    /// The election root: `previous`, or the account id for chain-opening
    /// blocks. Two blocks sharing a root compete for the same chain slot.
    pub fn root(&self) -> Root {
        if self.previous.is_zero() {
            Root::from(self.account)
        } else {
            Root::from(self.previous)
        }
    }

    /// Whether this block opens a new chain.
    pub fn is_open(&self) -> bool {
        self.previous.is_zero()
    }

    /// Whether this block may be vote-stapled.
    pub fn is_state(&self) -> bool {
        self.kind == BlockKind::State
    }

    /// Sign the block hash with the account's key, storing the signature.
    pub fn sign(&mut self, private: &PrivateKey) {
        self.hash = self.compute_hash();
        self.signature = sign_message(self.hash.as_bytes(), private);
    }

    /// Verify the signature against the block's account key.
    pub fn verify(&self) -> bool {
        verify_signature(
            self.hash.as_bytes(),
            &self.signature,
            &PublicKey::from(self.account),
        )
    }

    /// The destination account of a send (the `link` reinterpreted).
    pub fn destination(&self) -> Account {
        Account::new(self.link.0)
    }

    /// The source block hash of a receive (the `link` as a hash).
    pub fn source(&self) -> BlockHash {
        self.link
    }
}

/// Convenience builder used by tests and the wallet-facing layers.
pub struct BlockBuilder {
    block: Block,
}

impl BlockBuilder {
    pub fn new(kind: BlockKind, account: Account) -> Self {
        Self {
            block: Block {
                kind,
                account,
                previous: BlockHash::ZERO,
                representative: Account::BURN,
                balance: Amount::ZERO,
                link: BlockHash::ZERO,
                work: 0,
                signature: Signature::ZERO,
                hash: BlockHash::ZERO,
            },
        }
    }

    pub fn previous(mut self, previous: BlockHash) -> Self {
        self.block.previous = previous;
        self
    }

    pub fn representative(mut self, representative: Account) -> Self {
        self.block.representative = representative;
        self
    }

    pub fn balance(mut self, balance: Amount) -> Self {
        self.block.balance = balance;
        self
    }

    pub fn link(mut self, link: BlockHash) -> Self {
        self.block.link = link;
        self
    }

    pub fn work(mut self, work: u64) -> Self {
        self.block.work = work;
        self
    }

    /// Finish and sign with the account's key.
    pub fn sign(mut self, private: &PrivateKey) -> Block {
        self.block.sign(private);
        self.block
    }

    /// Finish unsigned (hash still computed). Used by tests exercising
    /// signature rejection.
    pub fn unsigned(mut self) -> Block {
        self.block.hash = self.block.compute_hash();
        self.block
    }
}

/// Proof-of-work difficulty of `work` against `root`: the first eight bytes
/// of `blake2b(work || root)` as a big-endian integer. Higher is harder.
pub fn work_value(root: &Root, work: u64) -> u64 {
    let work_bytes = work.to_le_bytes();
    let digest = blake2b_parts(&[&work_bytes, root.as_bytes()]);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_crypto::keypair_from_seed;

    fn keypair() -> lattice_types::KeyPair {
        keypair_from_seed(&[42u8; 32])
    }

    #[test]
    fn open_block_root_is_account() {
        let kp = keypair();
        let block = BlockBuilder::new(BlockKind::Open, Account::from(kp.public))
            .balance(Amount::new(100))
            .sign(&kp.private);
        assert_eq!(block.root(), Root::from(Account::from(kp.public)));
        assert!(block.is_open());
    }

    #[test]
    fn chained_block_root_is_previous() {
        let kp = keypair();
        let previous = BlockHash::new([9u8; 32]);
        let block = BlockBuilder::new(BlockKind::Send, Account::from(kp.public))
            .previous(previous)
            .sign(&kp.private);
        assert_eq!(block.root(), Root::from(previous));
    }

    #[test]
    fn signature_verifies_for_owner() {
        let kp = keypair();
        let block = BlockBuilder::new(BlockKind::State, Account::from(kp.public))
            .balance(Amount::new(5))
            .sign(&kp.private);
        assert!(block.verify());
    }

    #[test]
    fn tampered_block_fails_verification() {
        let kp = keypair();
        let mut block = BlockBuilder::new(BlockKind::State, Account::from(kp.public))
            .balance(Amount::new(5))
            .sign(&kp.private);
        block.balance = Amount::new(6);
        block.hash = block.compute_hash();
        assert!(!block.verify());
    }

    #[test]
    fn hash_covers_every_field() {
        let kp = keypair();
        let base = BlockBuilder::new(BlockKind::State, Account::from(kp.public))
            .balance(Amount::new(5))
            .sign(&kp.private);
        let changed = BlockBuilder::new(BlockKind::State, Account::from(kp.public))
            .balance(Amount::new(5))
            .link(BlockHash::new([1u8; 32]))
            .sign(&kp.private);
        assert_ne!(base.hash, changed.hash);
    }

    #[test]
    fn work_value_depends_on_nonce() {
        let root = Root::new([3u8; 32]);
        assert_ne!(work_value(&root, 1), work_value(&root, 2));
    }
}
