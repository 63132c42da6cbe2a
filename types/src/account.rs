//! Account identity: the public key that owns a chain.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::keys::PublicKey;

/// A 32-byte account identifier (an Ed25519 public key). Each account owns
/// its own chain in the block lattice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Account(pub [u8; 32]);

impl Account {
    /// The burn account. Funds sent here are unrecoverable, and no open
    /// block may ever be admitted for it.
    pub const BURN: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl From<PublicKey> for Account {
    fn from(key: PublicKey) -> Self {
        Self(key.0)
    }
}

impl From<Account> for PublicKey {
    fn from(account: Account) -> Self {
        Self(account.0)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Account({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
