//! The representative side of a staple session.
//!
//! Round one (`stage0`): an initiator asks one of our hosted representatives
//! to help staple a state block. We mint a session nonce, remember the
//! session keyed both by `(initiator node id, request id)` and by the
//! block's root (at most one staple per root at a time), and answer with
//! the nonce commitment.
//!
//! Round two (`stage1`): the initiator returns the aggregate context
//! (`R_total`, aggregate key, key-list hash) and we answer with our partial
//! signature. The session is consumed, since a nonce signs exactly one
//! challenge, and the result is cached so retransmitted stage1 packets get
//! the same answer instead of a fresh computation.

use std::collections::{HashMap, VecDeque};

use lattice_crypto::musig::{self, SecretNonce};
use lattice_crypto::sign_message;
use lattice_ledger::Block;
use lattice_types::{Account, PrivateKey, PublicKey, Root, Signature, Timestamp};
use tracing::{debug, trace};

use crate::error::StapleError;

/// Stage0 sessions expire after this long without a stage1.
pub const STAGE0_SESSION_TTL_SECS: u64 = 60;
/// Bounded size of the stage1 answer cache.
pub const S_VALUE_CACHE_MAX: usize = 256;

/// `(opposing node id, request id)`, unique per staple attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub node_id: PublicKey,
    pub request_id: [u8; 32],
}

struct Stage0Info {
    created: Timestamp,
    representative: Account,
    root: Root,
    block: Block,
    nonce: SecretNonce,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct SValueKey {
    session: SessionId,
    r_total: [u8; 32],
}

struct SValueEntry {
    s_value: [u8; 32],
}

/// Inbound staple session state for the representatives this node hosts.
pub struct VoteStapler {
    /// Hosted representative signing keys.
    rep_keys: HashMap<Account, PrivateKey>,
    /// Open round-one sessions.
    stage0_sessions: HashMap<SessionId, Stage0Info>,
    /// Root -> owning session, enforcing one staple per root.
    stage0_by_root: HashMap<Root, SessionId>,
    /// Blocks we have contributed a partial signature for, by root.
    stapled_votes: HashMap<Root, Block>,
    /// Answer cache for retransmitted stage1 requests, LRU by insertion.
    s_value_cache: HashMap<SValueKey, SValueEntry>,
    s_value_order: VecDeque<SValueKey>,
}

impl VoteStapler {
    pub fn new() -> Self {
        Self {
            rep_keys: HashMap::new(),
            stage0_sessions: HashMap::new(),
            stage0_by_root: HashMap::new(),
            stapled_votes: HashMap::new(),
            s_value_cache: HashMap::new(),
            s_value_order: VecDeque::new(),
        }
    }

    /// Host a representative: its key becomes available for stapling.
    pub fn add_representative(&mut self, account: Account, key: PrivateKey) {
        self.rep_keys.insert(account, key);
    }

    pub fn hosts(&self, account: &Account) -> bool {
        self.rep_keys.contains_key(account)
    }

    /// Sign `message` with a hosted representative's key (e.g. to
    /// authenticate a stage0 response).
    pub fn sign_as(&self, account: &Account, message: &[u8]) -> Option<Signature> {
        self.rep_keys
            .get(account)
            .map(|key| sign_message(message, key))
    }

    /// Round one: open a session and return the nonce commitment `R`.
    pub fn stage0(
        &mut self,
        node_id: PublicKey,
        request_id: [u8; 32],
        representative: Account,
        block: Block,
        now: Timestamp,
    ) -> Result<[u8; 32], StapleError> {
        if !block.is_state() {
            return Err(StapleError::NotStateBlock);
        }
        if !self.rep_keys.contains_key(&representative) {
            return Err(StapleError::UnknownRepresentative);
        }
        let root = block.root();
        if self.stapled_votes.contains_key(&root) {
            return Err(StapleError::RootAlreadyStapled);
        }
        let session = SessionId {
            node_id,
            request_id,
        };
        if self.stage0_sessions.contains_key(&session) {
            return Err(StapleError::RootBusy);
        }
        if let Some(owner) = self.stage0_by_root.get(&root) {
            if *owner != session {
                return Err(StapleError::RootBusy);
            }
        }

        let (nonce, commitment) = musig::generate_nonce();
        self.stage0_sessions.insert(
            session,
            Stage0Info {
                created: now,
                representative,
                root,
                block,
                nonce,
            },
        );
        self.stage0_by_root.insert(root, session);
        trace!(root = %root, rep = %representative, "stage0 session opened");
        Ok(commitment)
    }

    /// Round two: produce the partial signature for a session.
    ///
    /// The session is consumed; retransmissions are answered from the cache.
    pub fn stage1(
        &mut self,
        node_id: PublicKey,
        request_id: [u8; 32],
        r_total: [u8; 32],
        agg_pubkey: PublicKey,
        l_base: [u8; 32],
    ) -> Result<[u8; 32], StapleError> {
        let session = SessionId {
            node_id,
            request_id,
        };
        let cache_key = SValueKey { session, r_total };
        if let Some(entry) = self.s_value_cache.get(&cache_key) {
            return Ok(entry.s_value);
        }

        let info = self
            .stage0_sessions
            .remove(&session)
            .ok_or(StapleError::SessionNotFound)?;
        self.stage0_by_root.remove(&info.root);

        let key = self
            .rep_keys
            .get(&info.representative)
            .ok_or(StapleError::UnknownRepresentative)?;
        let s_value = musig::partial_sign(
            &info.nonce,
            key,
            &l_base,
            &agg_pubkey,
            &r_total,
            info.block.hash.as_bytes(),
        );

        // Committing a partial signature binds this rep to the block.
        self.stapled_votes.insert(info.root, info.block);
        self.cache_insert(cache_key, s_value);
        debug!(rep = %info.representative, "partial signature issued");
        Ok(s_value)
    }

    fn cache_insert(&mut self, key: SValueKey, s_value: [u8; 32]) {
        if self.s_value_cache.len() >= S_VALUE_CACHE_MAX {
            if let Some(oldest) = self.s_value_order.pop_front() {
                self.s_value_cache.remove(&oldest);
            }
        }
        self.s_value_cache.insert(key, SValueEntry { s_value });
        self.s_value_order.push_back(key);
    }

    /// Remove and return the stapled block for a root, if any. Called when
    /// the root is finalized (or the staple superseded).
    pub fn remove_root(&mut self, root: &Root) -> Option<Block> {
        self.stapled_votes.remove(root)
    }

    /// Expire stage0 sessions older than the TTL.
    pub fn purge(&mut self, now: Timestamp) {
        let stale: Vec<SessionId> = self
            .stage0_sessions
            .iter()
            .filter(|(_, info)| info.created.saturating_elapsed(now) > STAGE0_SESSION_TTL_SECS)
            .map(|(session, _)| *session)
            .collect();
        for session in stale {
            if let Some(info) = self.stage0_sessions.remove(&session) {
                self.stage0_by_root.remove(&info.root);
            }
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.stage0_sessions.len()
    }

    pub fn stapled_count(&self) -> usize {
        self.stapled_votes.len()
    }
}

impl Default for VoteStapler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_crypto::{keypair_from_seed, musig};
    use lattice_ledger::{BlockBuilder, BlockKind};
    use lattice_types::{Amount, KeyPair};

    fn keys(seed: u8) -> KeyPair {
        keypair_from_seed(&[seed; 32])
    }

    fn state_block(seed: u8) -> Block {
        let kp = keys(seed);
        BlockBuilder::new(BlockKind::State, Account::from(kp.public))
            .representative(Account::from(kp.public))
            .balance(Amount::new(10))
            .sign(&kp.private)
    }

    fn stapler_with_rep(seed: u8) -> (VoteStapler, Account) {
        let kp = keys(seed);
        let account = Account::from(kp.public);
        let mut stapler = VoteStapler::new();
        stapler.add_representative(account, kp.private);
        (stapler, account)
    }

    fn node_id(byte: u8) -> PublicKey {
        PublicKey([byte; 32])
    }

    fn ts(secs: u64) -> Timestamp {
        Timestamp::new(secs)
    }

    #[test]
    fn stage0_returns_commitment() {
        let (mut stapler, rep) = stapler_with_rep(9);
        let commitment = stapler
            .stage0(node_id(1), [1u8; 32], rep, state_block(1), ts(100))
            .unwrap();
        assert_ne!(commitment, [0u8; 32]);
        assert_eq!(stapler.open_sessions(), 1);
    }

    #[test]
    fn stage0_rejects_legacy_block() {
        let (mut stapler, rep) = stapler_with_rep(9);
        let kp = keys(1);
        let legacy = BlockBuilder::new(BlockKind::Open, Account::from(kp.public))
            .balance(Amount::new(10))
            .sign(&kp.private);
        assert_eq!(
            stapler.stage0(node_id(1), [1u8; 32], rep, legacy, ts(100)),
            Err(StapleError::NotStateBlock)
        );
    }

    #[test]
    fn stage0_rejects_unknown_rep() {
        let (mut stapler, _) = stapler_with_rep(9);
        let stranger = Account::new([0x55; 32]);
        assert_eq!(
            stapler.stage0(node_id(1), [1u8; 32], stranger, state_block(1), ts(100)),
            Err(StapleError::UnknownRepresentative)
        );
    }

    #[test]
    fn one_session_per_root() {
        let (mut stapler, rep) = stapler_with_rep(9);
        let block = state_block(1);
        stapler
            .stage0(node_id(1), [1u8; 32], rep, block.clone(), ts(100))
            .unwrap();
        // A different initiator may not open a second session on the root.
        assert_eq!(
            stapler.stage0(node_id(2), [2u8; 32], rep, block, ts(101)),
            Err(StapleError::RootBusy)
        );
    }

    #[test]
    fn stage1_consumes_session_and_is_idempotent() {
        let (mut stapler, rep) = stapler_with_rep(9);
        let block = state_block(1);
        let rep_key = PublicKey::from(rep);
        let commitment = stapler
            .stage0(node_id(1), [1u8; 32], rep, block.clone(), ts(100))
            .unwrap();

        // Single-signer aggregate context.
        let l = musig::l_base(&[rep_key]);
        let agg = musig::aggregate_public(&l, &[rep_key]).unwrap();
        let r_total = musig::aggregate_commitments(&[commitment]).unwrap();

        let s1 = stapler
            .stage1(node_id(1), [1u8; 32], r_total, agg, l)
            .unwrap();
        // The single partial is a complete aggregate signature.
        let signature = musig::assemble_signature(&r_total, &s1);
        assert!(musig::verify_with_keys(block.hash.as_bytes(), &[rep_key], &signature).is_some());

        // Retransmission: same answer, no new session required.
        let s2 = stapler
            .stage1(node_id(1), [1u8; 32], r_total, agg, l)
            .unwrap();
        assert_eq!(s1, s2);
        assert_eq!(stapler.open_sessions(), 0);
        assert_eq!(stapler.stapled_count(), 1);

        // A different aggregate context after consumption would need the
        // nonce again: refused.
        let bad = stapler.stage1(node_id(1), [1u8; 32], [9u8; 32], agg, l);
        assert_eq!(bad, Err(StapleError::SessionNotFound));
    }

    #[test]
    fn stapled_root_blocks_new_sessions_until_removed() {
        let (mut stapler, rep) = stapler_with_rep(9);
        let block = state_block(1);
        let rep_key = PublicKey::from(rep);
        let root = block.root();
        let commitment = stapler
            .stage0(node_id(1), [1u8; 32], rep, block.clone(), ts(100))
            .unwrap();
        let l = musig::l_base(&[rep_key]);
        let agg = musig::aggregate_public(&l, &[rep_key]).unwrap();
        let r_total = musig::aggregate_commitments(&[commitment]).unwrap();
        stapler
            .stage1(node_id(1), [1u8; 32], r_total, agg, l)
            .unwrap();

        assert_eq!(
            stapler.stage0(node_id(2), [2u8; 32], rep, block.clone(), ts(101)),
            Err(StapleError::RootAlreadyStapled)
        );

        let removed = stapler.remove_root(&root).unwrap();
        assert_eq!(removed.hash, block.hash);
        assert!(stapler
            .stage0(node_id(2), [2u8; 32], rep, block, ts(102))
            .is_ok());
    }

    #[test]
    fn purge_expires_stale_sessions() {
        let (mut stapler, rep) = stapler_with_rep(9);
        stapler
            .stage0(node_id(1), [1u8; 32], rep, state_block(1), ts(100))
            .unwrap();
        stapler.purge(ts(100 + STAGE0_SESSION_TTL_SECS + 1));
        assert_eq!(stapler.open_sessions(), 0);
        // Root slot is free again.
        assert!(stapler
            .stage0(node_id(2), [2u8; 32], rep, state_block(1), ts(200))
            .is_ok());
    }
}
