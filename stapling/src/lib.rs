//! Vote stapling.
//!
//! A staple compresses a quorum of representative votes on one state block
//! into a single aggregate Schnorr signature plus a 256-bit fingerprint (the
//! XOR of the contributing representatives' public keys). Peers recover the
//! signer set from the fingerprint against their own top-representative
//! table and verify one signature instead of dozens.
//!
//! - [`stapler`] — the representative (server) side of a two-round session.
//! - [`requester`] — the initiator (client) side: recruit, aggregate, broadcast.
//! - [`xor_solver`] — subset-XOR recovery and staple validation.

pub mod error;
pub mod requester;
pub mod stapler;
pub mod xor_solver;

pub use error::StapleError;
pub use requester::{RepTarget, RequesterAction, StapleCallback, VoteStapleRequester};
pub use stapler::{SessionId, VoteStapler};
pub use xor_solver::RepXorSolver;

/// Representatives beyond this rank are never part of a staple.
pub const TOP_REPS_HARD_CUTOFF: usize = 127;
/// Deepest rank accepted when validating an incoming staple.
pub const TOP_REPS_CONFIRMATION_CUTOFF: usize = 90;
/// Deepest rank recruited when generating a staple.
pub const TOP_REPS_GENERATION_CUTOFF: usize = 64;
/// At most `2^this` candidate subsets are tried per fingerprint.
pub const XOR_CHECK_POSSIBILITIES_CAP_LOG2: usize = 3;

/// XOR of a set of representative public keys: the staple fingerprint.
pub fn xor_keys<'a>(keys: impl IntoIterator<Item = &'a lattice_types::PublicKey>) -> [u8; 32] {
    let mut out = [0u8; 32];
    for key in keys {
        for (acc, byte) in out.iter_mut().zip(key.0.iter()) {
            *acc ^= byte;
        }
    }
    out
}
