//! Ed25519 key generation and derivation.

use ed25519_dalek::SigningKey;
use lattice_types::{KeyPair, PrivateKey, PublicKey};
use rand::RngCore;

/// Generate a fresh random key pair.
pub fn generate_keypair() -> KeyPair {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    keypair_from_seed(&seed)
}

/// Derive a key pair deterministically from a 32-byte seed.
pub fn keypair_from_seed(seed: &[u8; 32]) -> KeyPair {
    let signing_key = SigningKey::from_bytes(seed);
    let public = PublicKey(signing_key.verifying_key().to_bytes());
    KeyPair {
        public,
        private: PrivateKey(*seed),
    }
}

/// Recompute the public key for a private key.
pub fn public_key_of(private: &PrivateKey) -> PublicKey {
    let signing_key = SigningKey::from_bytes(&private.0);
    PublicKey(signing_key.verifying_key().to_bytes())
}
