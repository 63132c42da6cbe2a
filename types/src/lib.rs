//! Fundamental types for the lattice protocol.
//!
//! This crate defines the core types shared across every other crate in the
//! workspace: accounts, hashes, amounts, keys, timestamps, and network
//! parameters.

pub mod account;
pub mod amount;
pub mod error;
pub mod hash;
pub mod keys;
pub mod network;
pub mod time;

pub use account::Account;
pub use amount::Amount;
pub use error::LatticeError;
pub use hash::{BlockHash, Root};
pub use keys::{KeyPair, PrivateKey, PublicKey, Signature};
pub use network::NetworkKind;
pub use time::Timestamp;
