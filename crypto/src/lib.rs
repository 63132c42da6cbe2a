//! Cryptography for the lattice protocol: Ed25519 signing, Blake2b hashing,
//! and the two-round Schnorr multi-signature scheme used for vote stapling.

pub mod hash;
pub mod keys;
pub mod musig;
pub mod sign;

pub use hash::{blake2b, blake2b_parts};
pub use keys::{generate_keypair, keypair_from_seed, public_key_of};
pub use sign::{sign_message, verify_signature};
