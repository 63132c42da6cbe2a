//! Representative votes.
//!
//! A vote names one or more block hashes the representative currently backs.
//! The sequence number is monotonic per representative: a vote with a higher
//! sequence supersedes any earlier vote, and equal-or-lower sequences are
//! replays.

use lattice_crypto::{sign_message, verify_signature};
use lattice_types::{Account, BlockHash, PrivateKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// A signed vote from one representative.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// The representative account casting the vote.
    pub account: Account,
    /// Monotonic per-account sequence number.
    pub sequence: u64,
    /// The block hashes voted for (at least one).
    pub hashes: Vec<BlockHash>,
    /// Ed25519 signature over the sequence-prefixed hash list.
    pub signature: Signature,
}

impl Vote {
    /// Construct and sign a vote.
    pub fn new(
        account: Account,
        sequence: u64,
        hashes: Vec<BlockHash>,
        private: &PrivateKey,
    ) -> Self {
        let mut vote = Self {
            account,
            sequence,
            hashes,
            signature: Signature::ZERO,
        };
        vote.signature = sign_message(&vote.signing_message(), private);
        vote
    }

    /// The signed payload: big-endian sequence followed by each hash.
    fn signing_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(8 + self.hashes.len() * 32);
        message.extend_from_slice(&self.sequence.to_be_bytes());
        for hash in &self.hashes {
            message.extend_from_slice(hash.as_bytes());
        }
        message
    }

    /// Verify the signature against the voting account's key.
    pub fn validate(&self) -> bool {
        if self.hashes.is_empty() {
            return false;
        }
        verify_signature(
            &self.signing_message(),
            &self.signature,
            &PublicKey::from(self.account),
        )
    }
}
