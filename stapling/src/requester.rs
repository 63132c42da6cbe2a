//! The initiator side of staple aggregation.
//!
//! Given a state block, the requester recruits top representatives whose
//! combined weight clears the quorum cutoff, runs the two MuSig rounds
//! against them, and assembles the staple. The component is passive: every
//! entry point returns the wire actions for the owner to send, so it can be
//! driven (and tested) without sockets.
//!
//! Sessions with the same representative account must not overlap: a rep's
//! nonce handling is per-session and serializing per account removes any
//! chance of nonce reuse. Requests that would overlap queue FIFO per account
//! and are replayed when the blocking request settles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use lattice_crypto::{musig, verify_signature};
use lattice_ledger::Block;
use lattice_types::{Account, Amount, BlockHash, PublicKey, Signature, Timestamp};
use tracing::{debug, trace, warn};

use crate::xor_keys;

/// Stage0 solicitations unanswered for this long are retried or abandoned.
pub const REQUEST_TTL_SECS: u64 = 30;
/// Consecutive aggregation failures after which stapling is abandoned in
/// favour of plain vote broadcasts.
pub const FORCE_FULL_BROADCAST_AFTER: usize = 3;

/// Completion callback: `(success, reps_xor, aggregate_signature)`.
pub type StapleCallback = Box<dyn FnOnce(bool, [u8; 32], Signature) + Send>;

/// A recruitable representative: its account, current weight, and the peer
/// endpoints known to host it.
#[derive(Clone, Debug)]
pub struct RepTarget {
    pub account: Account,
    pub weight: Amount,
    pub endpoints: Vec<SocketAddr>,
}

/// Wire work the owner must perform after an entry point returns.
pub enum RequesterAction {
    Stage0Request {
        endpoint: SocketAddr,
        request_id: [u8; 32],
        block: Block,
        representative: Account,
    },
    Stage1Request {
        endpoint: SocketAddr,
        request_id: [u8; 32],
        r_total: [u8; 32],
        agg_pubkey: PublicKey,
        l_base: [u8; 32],
    },
    /// Staple assembled: flood it.
    BroadcastStaple {
        block: Block,
        reps_xor: [u8; 32],
        signature: Signature,
    },
    /// Aggregation failed: flood the bare block and let individual votes
    /// confirm it.
    BroadcastIndividual { block: Block },
}

struct Stage1State {
    l_base: [u8; 32],
    agg_pubkey: PublicKey,
    r_total: [u8; 32],
    /// Contributors in canonical (weight-descending) order.
    contributors: Vec<Account>,
    pending: HashSet<Account>,
    s_total: [u8; 32],
}

struct RequestInfo {
    request_id: [u8; 32],
    block: Block,
    created: Timestamp,
    weight_cutoff: Amount,
    callback: Option<StapleCallback>,
    /// All candidates, canonical order.
    targets: Vec<RepTarget>,
    /// Currently solicited accounts.
    reps_requested: HashSet<Account>,
    /// Silent or malformed reps, excluded for this block only.
    blacklisted: HashSet<Account>,
    /// Collected round-one commitments.
    rb_values: HashMap<Account, [u8; 32]>,
    vote_weight_collected: Amount,
    stage1: Option<Stage1State>,
}

struct QueuedRequest {
    block: Block,
    targets: Vec<RepTarget>,
    online_stake: Amount,
    callback: StapleCallback,
}

/// Client-side staple sessions, one per block hash.
pub struct VoteStapleRequester {
    /// Our node id, part of every session id on the rep side.
    node_id: PublicKey,
    quorum_percent: u128,
    requests: HashMap<BlockHash, RequestInfo>,
    request_ids: HashMap<[u8; 32], BlockHash>,
    /// Accounts with a session in flight; requests touching them queue.
    in_flight_reps: HashSet<Account>,
    accounts_queue: HashMap<Account, VecDeque<QueuedRequest>>,
    /// Aggregation failures in a row; resets on any assembled staple.
    consecutive_failures: usize,
    /// Set after repeated aggregation failures: skip stapling entirely.
    force_full_broadcast: bool,
}

impl VoteStapleRequester {
    pub fn new(node_id: PublicKey, quorum_percent: u128) -> Self {
        Self {
            node_id,
            quorum_percent,
            requests: HashMap::new(),
            request_ids: HashMap::new(),
            in_flight_reps: HashSet::new(),
            accounts_queue: HashMap::new(),
            consecutive_failures: 0,
            force_full_broadcast: false,
        }
    }

    fn note_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= FORCE_FULL_BROADCAST_AFTER && !self.force_full_broadcast
        {
            warn!("repeated staple failures; switching to full vote broadcasts");
            self.force_full_broadcast = true;
        }
    }

    pub fn node_id(&self) -> PublicKey {
        self.node_id
    }

    pub fn force_full_broadcast(&self) -> bool {
        self.force_full_broadcast
    }

    pub fn open_requests(&self) -> usize {
        self.requests.len()
    }

    /// Begin stapling `block`. `targets` must be in canonical
    /// (weight-descending) order, typically `RepXorSolver::generation_candidates`
    /// joined with peer endpoints.
    pub fn request_staple(
        &mut self,
        block: Block,
        targets: Vec<RepTarget>,
        online_stake: Amount,
        callback: StapleCallback,
        now: Timestamp,
    ) -> Vec<RequesterAction> {
        if !block.is_state() || self.requests.contains_key(&block.hash) {
            callback(false, [0u8; 32], Signature::ZERO);
            return Vec::new();
        }
        if self.force_full_broadcast {
            callback(false, [0u8; 32], Signature::ZERO);
            return vec![RequesterAction::BroadcastIndividual { block }];
        }

        // Per-account serialization: overlap with an in-flight session
        // queues the whole request behind that account.
        if let Some(busy) = targets
            .iter()
            .find(|target| self.in_flight_reps.contains(&target.account))
        {
            trace!(account = %busy.account, "staple request queued behind in-flight session");
            self.accounts_queue
                .entry(busy.account)
                .or_default()
                .push_back(QueuedRequest {
                    block,
                    targets,
                    online_stake,
                    callback,
                });
            return Vec::new();
        }

        self.begin(block, targets, online_stake, callback, now)
    }

    fn begin(
        &mut self,
        block: Block,
        targets: Vec<RepTarget>,
        online_stake: Amount,
        callback: StapleCallback,
        now: Timestamp,
    ) -> Vec<RequesterAction> {
        let weight_cutoff = online_stake.percent(self.quorum_percent);

        // Recruit down the table until the cutoff is cleared.
        let mut selected: Vec<&RepTarget> = Vec::new();
        let mut selected_weight = Amount::ZERO;
        for target in &targets {
            if target.endpoints.is_empty() || target.weight.is_zero() {
                continue;
            }
            selected.push(target);
            selected_weight += target.weight;
            if selected_weight >= weight_cutoff {
                break;
            }
        }
        if selected_weight < weight_cutoff {
            debug!(block = %block.hash, have = %selected_weight, need = %weight_cutoff,
                   "insufficient representative weight for staple");
            callback(false, [0u8; 32], Signature::ZERO);
            self.note_failure();
            return vec![RequesterAction::BroadcastIndividual { block }];
        }

        let mut request_id = [0u8; 32];
        if getrandom::getrandom(&mut request_id).is_err() {
            callback(false, [0u8; 32], Signature::ZERO);
            return vec![RequesterAction::BroadcastIndividual { block }];
        }

        let mut actions = Vec::new();
        let mut reps_requested = HashSet::new();
        for target in &selected {
            reps_requested.insert(target.account);
            self.in_flight_reps.insert(target.account);
            for endpoint in &target.endpoints {
                actions.push(RequesterAction::Stage0Request {
                    endpoint: *endpoint,
                    request_id,
                    block: block.clone(),
                    representative: target.account,
                });
            }
        }
        self.request_ids.insert(request_id, block.hash);
        self.requests.insert(
            block.hash,
            RequestInfo {
                request_id,
                block,
                created: now,
                weight_cutoff,
                callback: Some(callback),
                targets,
                reps_requested,
                blacklisted: HashSet::new(),
                rb_values: HashMap::new(),
                vote_weight_collected: Amount::ZERO,
                stage1: None,
            },
        );
        actions
    }

    /// Handle a round-one response. The responder signs
    /// `request_id || R` under its representative key so commitments cannot
    /// be forged by third parties.
    pub fn stage0_response(
        &mut self,
        request_id: [u8; 32],
        responder: PublicKey,
        r_commitment: [u8; 32],
        signature: &Signature,
    ) -> Vec<RequesterAction> {
        let Some(block_hash) = self.request_ids.get(&request_id).copied() else {
            return Vec::new();
        };
        let Some(info) = self.requests.get_mut(&block_hash) else {
            return Vec::new();
        };
        if info.stage1.is_some() {
            return Vec::new(); // already advanced to round two
        }
        let account = Account::from(responder);
        if !info.reps_requested.contains(&account)
            || info.blacklisted.contains(&account)
            || info.rb_values.contains_key(&account)
        {
            return Vec::new();
        }

        let mut message = Vec::with_capacity(64);
        message.extend_from_slice(&request_id);
        message.extend_from_slice(&r_commitment);
        if !verify_signature(&message, signature, &responder) {
            warn!(account = %account, "stage0 response signature invalid; rep blacklisted");
            info.blacklisted.insert(account);
            return Vec::new();
        }

        info.rb_values.insert(account, r_commitment);
        let weight = info
            .targets
            .iter()
            .find(|target| target.account == account)
            .map(|target| target.weight)
            .unwrap_or(Amount::ZERO);
        info.vote_weight_collected += weight;
        trace!(account = %account, collected = %info.vote_weight_collected, "commitment collected");

        if info.vote_weight_collected >= info.weight_cutoff {
            Self::advance_to_stage1(info)
        } else {
            Vec::new()
        }
    }

    fn advance_to_stage1(info: &mut RequestInfo) -> Vec<RequesterAction> {
        // Contributors in canonical order, as the verifier will reconstruct.
        let contributors: Vec<Account> = info
            .targets
            .iter()
            .map(|target| target.account)
            .filter(|account| info.rb_values.contains_key(account))
            .collect();
        let keys: Vec<PublicKey> = contributors.iter().map(|a| PublicKey::from(*a)).collect();
        let commitments: Vec<[u8; 32]> = contributors
            .iter()
            .map(|account| info.rb_values[account])
            .collect();

        let l_base = musig::l_base(&keys);
        let (Some(agg_pubkey), Some(r_total)) = (
            musig::aggregate_public(&l_base, &keys),
            musig::aggregate_commitments(&commitments),
        ) else {
            // A rep handed us a non-point; give up on aggregation.
            warn!(block = %info.block.hash, "aggregate context failed to build");
            return Vec::new();
        };

        let pending: HashSet<Account> = contributors.iter().copied().collect();
        let mut actions = Vec::new();
        for account in &contributors {
            let endpoints = info
                .targets
                .iter()
                .find(|target| target.account == *account)
                .map(|target| target.endpoints.clone())
                .unwrap_or_default();
            for endpoint in endpoints {
                actions.push(RequesterAction::Stage1Request {
                    endpoint,
                    request_id: info.request_id,
                    r_total,
                    agg_pubkey,
                    l_base,
                });
            }
        }
        info.stage1 = Some(Stage1State {
            l_base,
            agg_pubkey,
            r_total,
            contributors,
            pending,
            s_total: [0u8; 32],
        });
        actions
    }

    /// Handle a round-two response. Stage1 replies carry no sender identity,
    /// so the partial is attributed by testing it against each outstanding
    /// contributor's commitment; forged or corrupt partials match nobody and
    /// are dropped before touching the running total.
    pub fn stage1_response(
        &mut self,
        request_id: [u8; 32],
        s_partial: [u8; 32],
    ) -> Vec<RequesterAction> {
        let Some(block_hash) = self.request_ids.get(&request_id).copied() else {
            return Vec::new();
        };
        let Some(info) = self.requests.get_mut(&block_hash) else {
            return Vec::new();
        };
        let Some(stage1) = info.stage1.as_mut() else {
            return Vec::new();
        };

        let matched = stage1.pending.iter().copied().find(|account| {
            musig::verify_partial(
                &s_partial,
                &info.rb_values[account],
                &PublicKey::from(*account),
                &stage1.l_base,
                &stage1.agg_pubkey,
                &stage1.r_total,
                info.block.hash.as_bytes(),
            )
        });
        let Some(account) = matched else {
            trace!(block = %block_hash, "unattributable partial signature dropped");
            return Vec::new();
        };
        stage1.pending.remove(&account);
        stage1.s_total = musig::add_scalars(&stage1.s_total, &s_partial);
        if !stage1.pending.is_empty() {
            return Vec::new();
        }

        // Complete: assemble and flood.
        let keys: Vec<PublicKey> = stage1
            .contributors
            .iter()
            .map(|a| PublicKey::from(*a))
            .collect();
        let signature = musig::assemble_signature(&stage1.r_total, &stage1.s_total);
        let reps_xor = xor_keys(keys.iter());
        debug_assert!(
            musig::verify_with_keys(info.block.hash.as_bytes(), &keys, &signature).is_some()
        );
        let block = info.block.clone();
        if let Some(callback) = info.callback.take() {
            callback(true, reps_xor, signature);
        }
        self.consecutive_failures = 0;
        debug!(block = %block.hash, reps = keys.len(), "staple assembled");

        let mut actions = vec![RequesterAction::BroadcastStaple {
            block,
            reps_xor,
            signature,
        }];
        actions.extend(self.cleanup(&block_hash, Timestamp::now()));
        actions
    }

    /// Sweep for requests past the TTL: blacklist silent reps and retry with
    /// the remaining table weight, or fall back to individual votes.
    pub fn check_timeouts(&mut self, now: Timestamp) -> Vec<RequesterAction> {
        let expired: Vec<BlockHash> = self
            .requests
            .iter()
            .filter(|(_, info)| info.created.saturating_elapsed(now) > REQUEST_TTL_SECS)
            .map(|(hash, _)| *hash)
            .collect();

        let mut actions = Vec::new();
        for block_hash in expired {
            let Some(info) = self.requests.get_mut(&block_hash) else {
                continue;
            };
            if info.stage1.is_some() {
                // Round two stalled; no recovery without fresh nonces.
                warn!(block = %block_hash, "stage1 timed out; falling back to individual votes");
                if let Some(callback) = info.callback.take() {
                    callback(false, [0u8; 32], Signature::ZERO);
                }
                actions.push(RequesterAction::BroadcastIndividual {
                    block: info.block.clone(),
                });
                self.note_failure();
                actions.extend(self.cleanup(&block_hash, now));
                continue;
            }

            // Blacklist every solicited rep that never answered.
            let silent: Vec<Account> = info
                .reps_requested
                .iter()
                .filter(|account| !info.rb_values.contains_key(*account))
                .copied()
                .collect();
            for account in &silent {
                info.blacklisted.insert(*account);
                info.reps_requested.remove(account);
                self.in_flight_reps.remove(account);
            }
            debug!(block = %block_hash, silent = silent.len(), "stage0 timeout");

            // Recruit replacements from deeper in the table.
            let mut new_weight = info.vote_weight_collected;
            let mut recruits: Vec<(Account, Vec<SocketAddr>)> = Vec::new();
            for target in &info.targets {
                if info.reps_requested.contains(&target.account)
                    || info.blacklisted.contains(&target.account)
                    || target.endpoints.is_empty()
                    || target.weight.is_zero()
                {
                    continue;
                }
                recruits.push((target.account, target.endpoints.clone()));
                new_weight += target.weight;
                if new_weight >= info.weight_cutoff {
                    break;
                }
            }
            if new_weight < info.weight_cutoff {
                if let Some(callback) = info.callback.take() {
                    callback(false, [0u8; 32], Signature::ZERO);
                }
                actions.push(RequesterAction::BroadcastIndividual {
                    block: info.block.clone(),
                });
                self.note_failure();
                actions.extend(self.cleanup_with(&block_hash, now, &silent));
                continue;
            }

            info.created = now;
            let request_id = info.request_id;
            let block = info.block.clone();
            for (account, endpoints) in recruits {
                info.reps_requested.insert(account);
                self.in_flight_reps.insert(account);
                for endpoint in endpoints {
                    actions.push(RequesterAction::Stage0Request {
                        endpoint,
                        request_id,
                        block: block.clone(),
                        representative: account,
                    });
                }
            }
        }
        actions
    }

    /// Tear down a request and replay any queued requests its representative
    /// accounts were blocking.
    fn cleanup(&mut self, block_hash: &BlockHash, now: Timestamp) -> Vec<RequesterAction> {
        self.cleanup_with(block_hash, now, &[])
    }

    /// [`cleanup`], additionally draining queues behind `extra_freed`
    /// accounts (reps already released earlier, e.g. blacklisted ones).
    ///
    /// [`cleanup`]: Self::cleanup
    fn cleanup_with(
        &mut self,
        block_hash: &BlockHash,
        now: Timestamp,
        extra_freed: &[Account],
    ) -> Vec<RequesterAction> {
        let Some(info) = self.requests.remove(block_hash) else {
            return Vec::new();
        };
        self.request_ids.remove(&info.request_id);
        let mut freed: Vec<Account> = extra_freed.to_vec();
        for account in &info.reps_requested {
            self.in_flight_reps.remove(account);
            freed.push(*account);
        }

        let mut actions = Vec::new();
        for account in freed {
            if !self.accounts_queue.contains_key(&account) {
                continue;
            }
            loop {
                let queued = match self.accounts_queue.get_mut(&account) {
                    Some(queue) => queue.pop_front(),
                    None => None,
                };
                let Some(queued) = queued else {
                    break;
                };
                let replay = self.request_staple(
                    queued.block,
                    queued.targets,
                    queued.online_stake,
                    queued.callback,
                    now,
                );
                let queued_again = replay.is_empty();
                actions.extend(replay);
                if !queued_again {
                    break;
                }
            }
            if self
                .accounts_queue
                .get(&account)
                .is_some_and(|queue| queue.is_empty())
            {
                self.accounts_queue.remove(&account);
            }
        }
        actions
    }
}
