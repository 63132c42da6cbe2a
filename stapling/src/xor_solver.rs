//! Recovering the signer set from a staple's XOR fingerprint.
//!
//! The fingerprint is the XOR of the contributing representatives' public
//! keys. Over GF(2) that makes recovery a linear-algebra problem: find a
//! subset of the top-representative key table whose XOR equals the
//! fingerprint. Keys are treated as 256-bit vectors (four u64 limbs) and
//! eliminated Gaussian-style; each reduced row drags along a bitmask of the
//! original keys it combines, so solutions read off directly. Dependent keys
//! yield a solution space rather than a single subset; enumeration is
//! capped at `2^XOR_CHECK_POSSIBILITIES_CAP_LOG2` candidates, and a
//! fingerprint that resolves to none of them is rejected.

use lattice_ledger::Ledger;
use lattice_types::{Account, Amount, BlockHash, PublicKey, Signature, Timestamp};
use tracing::trace;

use crate::error::StapleError;
use crate::{
    TOP_REPS_CONFIRMATION_CUTOFF, TOP_REPS_GENERATION_CUTOFF, TOP_REPS_HARD_CUTOFF,
    XOR_CHECK_POSSIBILITIES_CAP_LOG2,
};

type Limbs = [u64; 4];

fn key_limbs(key: &PublicKey) -> Limbs {
    let bytes = key.0;
    let mut limbs = [0u64; 4];
    for (i, limb) in limbs.iter_mut().enumerate() {
        *limb = u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
    }
    limbs
}

fn xor_into(acc: &mut Limbs, other: &Limbs) {
    for (a, b) in acc.iter_mut().zip(other.iter()) {
        *a ^= b;
    }
}

fn is_zero(limbs: &Limbs) -> bool {
    limbs.iter().all(|limb| *limb == 0)
}

/// Index of the highest set bit, or `None` for the zero vector.
fn leading_bit(limbs: &Limbs) -> Option<usize> {
    for (i, limb) in limbs.iter().enumerate().rev() {
        if *limb != 0 {
            return Some(i * 64 + 63 - limb.leading_zeros() as usize);
        }
    }
    None
}

fn has_bit(limbs: &Limbs, bit: usize) -> bool {
    limbs[bit / 64] >> (bit % 64) & 1 == 1
}

/// Solve `XOR of subset(keys) == target` by GF(2) elimination.
///
/// Returns up to `2^cap_log2` candidate subsets as key-index bitmasks
/// (`keys.len()` must be at most 127 so a mask fits in a `u128`). An empty
/// result means no subset of these keys produces the target.
pub fn solve_xor_check(keys: &[Limbs], target: &Limbs, cap_log2: usize) -> Vec<u128> {
    debug_assert!(keys.len() <= TOP_REPS_HARD_CUTOFF);

    // Eliminate: every pivot row remembers which original keys it combines.
    let mut pivots: Vec<(Limbs, u128, usize)> = Vec::new();
    let mut nullspace: Vec<u128> = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        let mut row = *key;
        let mut mask: u128 = 1 << index;
        for (value, combo, lead) in &pivots {
            if has_bit(&row, *lead) {
                xor_into(&mut row, value);
                mask ^= combo;
            }
        }
        match leading_bit(&row) {
            Some(lead) => pivots.push((row, mask, lead)),
            None => nullspace.push(mask),
        }
    }

    // Express the target in terms of the pivots.
    let mut residue = *target;
    let mut base_mask: u128 = 0;
    for (value, combo, lead) in &pivots {
        if has_bit(&residue, *lead) {
            xor_into(&mut residue, value);
            base_mask ^= combo;
        }
    }
    if !is_zero(&residue) {
        return Vec::new();
    }

    // Enumerate the bounded solution space.
    let free = nullspace.len().min(cap_log2);
    let mut candidates = Vec::with_capacity(1 << free);
    for combo in 0u32..(1 << free) {
        let mut mask = base_mask;
        for (bit, null_mask) in nullspace.iter().take(free).enumerate() {
            if combo >> bit & 1 == 1 {
                mask ^= null_mask;
            }
        }
        if mask != 0 {
            candidates.push(mask);
        }
    }
    candidates
}

/// Top-representative table and staple validation against it.
pub struct RepXorSolver {
    /// Weight-descending table, at most [`TOP_REPS_HARD_CUTOFF`] entries.
    top_reps: Vec<(Account, Amount)>,
    last_calculated: Timestamp,
    recalc_interval_secs: u64,
}

impl RepXorSolver {
    pub fn new(recalc_interval_secs: u64) -> Self {
        Self {
            top_reps: Vec::new(),
            last_calculated: Timestamp::new(0),
            recalc_interval_secs,
        }
    }

    /// Recompute the table from ledger weights, at most once per interval.
    pub fn calculate_top_reps(&mut self, ledger: &Ledger, now: Timestamp) {
        if !self.top_reps.is_empty()
            && self.last_calculated.saturating_elapsed(now) < self.recalc_interval_secs
        {
            return;
        }
        let mut weights = ledger.store().rep_weights();
        weights.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        weights.truncate(TOP_REPS_HARD_CUTOFF);
        self.top_reps = weights;
        self.last_calculated = now;
        trace!(count = self.top_reps.len(), "top representatives recalculated");
    }

    /// The full weight-descending table.
    pub fn top_reps(&self) -> &[(Account, Amount)] {
        &self.top_reps
    }

    /// Recruiting candidates for staple generation (shallower cutoff).
    pub fn generation_candidates(&self) -> &[(Account, Amount)] {
        let limit = self.top_reps.len().min(TOP_REPS_GENERATION_CUTOFF);
        &self.top_reps[..limit]
    }

    /// Validate a staple: recover which top representatives the fingerprint
    /// names, then verify the aggregate signature against that subset.
    ///
    /// Returns the subset's summed stake and how deep in the table its
    /// least-important member sits (1-based). A fingerprint that cannot be
    /// expressed over the table is `Unsolvable`; one whose candidate subsets
    /// all fail signature verification is `BadSignature`. Either way the
    /// caller falls back to requesting individual votes.
    pub fn validate_staple(
        &self,
        block_hash: &BlockHash,
        reps_xor: &[u8; 32],
        signature: &Signature,
    ) -> Result<(Amount, usize), StapleError> {
        let limit = self.top_reps.len().min(TOP_REPS_CONFIRMATION_CUTOFF);
        if limit == 0 {
            return Err(StapleError::Unsolvable);
        }
        let limbs: Vec<Limbs> = self.top_reps[..limit]
            .iter()
            .map(|(account, _)| key_limbs(&PublicKey::from(*account)))
            .collect();
        let target = key_limbs(&PublicKey(*reps_xor));

        let candidates = solve_xor_check(&limbs, &target, XOR_CHECK_POSSIBILITIES_CAP_LOG2);
        if candidates.is_empty() {
            return Err(StapleError::Unsolvable);
        }

        for mask in candidates {
            let indices: Vec<usize> = (0..limit).filter(|i| mask >> i & 1 == 1).collect();
            let keys: Vec<PublicKey> = indices
                .iter()
                .map(|i| PublicKey::from(self.top_reps[*i].0))
                .collect();
            if lattice_crypto::musig::verify_with_keys(block_hash.as_bytes(), &keys, signature)
                .is_some()
            {
                let stake: Amount = indices.iter().map(|i| self.top_reps[*i].1).sum();
                let max_position = indices.last().map(|i| i + 1).unwrap_or(0);
                return Ok((stake, max_position));
            }
        }
        Err(StapleError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xor_keys;
    use lattice_crypto::{keypair_from_seed, musig};
    use lattice_ledger::{MemoryStore, Store};
    use lattice_types::KeyPair;
    use std::sync::Arc;

    fn keys(seed: u8) -> KeyPair {
        keypair_from_seed(&[seed; 32])
    }

    /// Ledger with `n` representatives of descending weight 1000, 999, ...
    fn ledger_with_reps(n: u8) -> (Ledger, Vec<KeyPair>) {
        let store = Arc::new(MemoryStore::new());
        let mut reps = Vec::new();
        for i in 0..n {
            let kp = keys(i + 1);
            store.add_rep_weight(
                &Account::from(kp.public),
                Amount::new(1000 - i as u128),
            );
            reps.push(kp);
        }
        (Ledger::new(store, 0), reps)
    }

    /// Produce an honest staple over `signers` for `message`.
    fn staple(signers: &[&KeyPair], message: &[u8]) -> ([u8; 32], Signature) {
        let pubkeys: Vec<PublicKey> = signers.iter().map(|kp| kp.public).collect();
        let l = musig::l_base(&pubkeys);
        let agg = musig::aggregate_public(&l, &pubkeys).unwrap();
        let nonces: Vec<_> = signers.iter().map(|_| musig::generate_nonce()).collect();
        let commitments: Vec<_> = nonces.iter().map(|(_, c)| *c).collect();
        let r_total = musig::aggregate_commitments(&commitments).unwrap();
        let mut s_total = [0u8; 32];
        for (kp, (nonce, _)) in signers.iter().zip(&nonces) {
            let s = musig::partial_sign(nonce, &kp.private, &l, &agg, &r_total, message);
            s_total = musig::add_scalars(&s_total, &s);
        }
        let xor = xor_keys(pubkeys.iter());
        (xor, musig::assemble_signature(&r_total, &s_total))
    }

    #[test]
    fn solve_single_key() {
        let a = [1u64, 0, 0, 0];
        let solutions = solve_xor_check(&[a], &a, 3);
        assert_eq!(solutions, vec![0b1]);
    }

    #[test]
    fn solve_pair_xor() {
        let a = [0b01u64, 0, 0, 7];
        let b = [0b10u64, 0, 0, 5];
        let mut target = a;
        xor_into(&mut target, &b);
        let solutions = solve_xor_check(&[a, b], &target, 3);
        assert_eq!(solutions, vec![0b11]);
    }

    #[test]
    fn solve_no_solution() {
        let a = [0b01u64, 0, 0, 0];
        let b = [0b10u64, 0, 0, 0];
        let target = [0, 0, 0, 1u64];
        assert!(solve_xor_check(&[a, b], &target, 3).is_empty());
    }

    #[test]
    fn dependent_keys_enumerate_multiple_candidates() {
        // c == a ^ b, so any solution has a twin through the null vector.
        let a = [0b001u64, 0, 0, 0];
        let b = [0b010u64, 0, 0, 0];
        let c = [0b011u64, 0, 0, 0];
        let solutions = solve_xor_check(&[a, b, c], &a, 3);
        assert!(solutions.len() > 1);
        // Every candidate must actually XOR to the target.
        for mask in solutions {
            let mut acc = [0u64; 4];
            for (i, key) in [a, b, c].iter().enumerate() {
                if mask >> i & 1 == 1 {
                    xor_into(&mut acc, key);
                }
            }
            assert_eq!(acc, a);
        }
    }

    #[test]
    fn enumeration_is_capped() {
        // Four copies of the same vector: 3-dimensional nullspace.
        let v = [0b1u64, 0, 0, 0];
        let solutions = solve_xor_check(&[v, v, v, v], &v, 1);
        assert!(solutions.len() <= 2);
    }

    #[test]
    fn validate_recovers_subset_stake() {
        let (ledger, reps) = ledger_with_reps(10);
        let mut solver = RepXorSolver::new(60);
        solver.calculate_top_reps(&ledger, Timestamp::new(100));
        assert_eq!(solver.top_reps().len(), 10);

        let hash = BlockHash::new([0xAA; 32]);
        // Reps 0, 2, 4 (by seed order) sign. The table is weight-sorted with
        // distinct weights so seed order and table order coincide.
        let signers = [&reps[0], &reps[2], &reps[4]];
        let (xor, signature) = staple(&signers, hash.as_bytes());

        let (stake, max_position) = solver.validate_staple(&hash, &xor, &signature).unwrap();
        assert_eq!(stake, Amount::new(1000 + 998 + 996));
        assert_eq!(max_position, 5);
    }

    #[test]
    fn validate_rejects_unknown_fingerprint() {
        let (ledger, _) = ledger_with_reps(5);
        let mut solver = RepXorSolver::new(60);
        solver.calculate_top_reps(&ledger, Timestamp::new(100));

        let hash = BlockHash::new([0xAA; 32]);
        let outsider = keys(99);
        let (xor, signature) = staple(&[&outsider], hash.as_bytes());
        // An outsider's key is (with overwhelming probability) independent of
        // the table, so the fingerprint cannot be expressed over it.
        assert_eq!(
            solver.validate_staple(&hash, &xor, &signature),
            Err(StapleError::Unsolvable)
        );
    }

    #[test]
    fn validate_rejects_wrong_signature() {
        let (ledger, reps) = ledger_with_reps(10);
        let mut solver = RepXorSolver::new(60);
        solver.calculate_top_reps(&ledger, Timestamp::new(100));

        let hash = BlockHash::new([0xAA; 32]);
        let signers = [&reps[1], &reps[3]];
        let (xor, _) = staple(&signers, hash.as_bytes());
        // Signature over a different message.
        let (_, wrong_sig) = staple(&signers, b"different message");
        assert_eq!(
            solver.validate_staple(&hash, &xor, &wrong_sig),
            Err(StapleError::BadSignature)
        );
    }

    #[test]
    fn table_recalculation_respects_interval() {
        let (ledger, _) = ledger_with_reps(3);
        let mut solver = RepXorSolver::new(60);
        solver.calculate_top_reps(&ledger, Timestamp::new(100));
        assert_eq!(solver.top_reps().len(), 3);

        // New rep appears; within the interval the table is unchanged.
        let newcomer = keys(50);
        ledger
            .store()
            .add_rep_weight(&Account::from(newcomer.public), Amount::new(5000));
        solver.calculate_top_reps(&ledger, Timestamp::new(130));
        assert_eq!(solver.top_reps().len(), 3);

        solver.calculate_top_reps(&ledger, Timestamp::new(161));
        assert_eq!(solver.top_reps().len(), 4);
        assert_eq!(solver.top_reps()[0].1, Amount::new(5000));
    }

    #[test]
    fn generation_candidates_cut_shallower() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..100u8 {
            let kp = keys(i.wrapping_add(1));
            store.add_rep_weight(&Account::from(kp.public), Amount::new(1000 + i as u128));
        }
        let ledger = Ledger::new(store, 0);
        let mut solver = RepXorSolver::new(60);
        solver.calculate_top_reps(&ledger, Timestamp::new(100));
        assert_eq!(solver.top_reps().len(), 100);
        assert_eq!(solver.generation_candidates().len(), TOP_REPS_GENERATION_CUTOFF);
    }
}
