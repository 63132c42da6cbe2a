//! Ed25519 message signing and verification.

use ed25519_dalek::{Signer, Verifier};
use lattice_types::{PrivateKey, PublicKey, Signature};

/// Sign `message` with `key`, returning the detached signature.
pub fn sign_message(message: &[u8], key: &PrivateKey) -> Signature {
    let signer = ed25519_dalek::SigningKey::from_bytes(&key.0);
    Signature(signer.sign(message).to_bytes())
}

/// Verify a detached signature over `message`.
///
/// Anything that fails to parse (a public key off the curve, a
/// non-canonical signature) verifies as false rather than erroring; callers
/// treat every failure the same way and drop the message.
pub fn verify_signature(message: &[u8], signature: &Signature, key: &PublicKey) -> bool {
    let parsed = ed25519_dalek::Signature::from_bytes(&signature.0);
    match ed25519_dalek::VerifyingKey::from_bytes(&key.0) {
        Ok(verifier) => verifier.verify(message, &parsed).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_keypair, keypair_from_seed};

    #[test]
    fn round_trip_accepts_only_the_signed_message() {
        let kp = generate_keypair();
        let signature = sign_message(b"vote on block", &kp.private);
        assert!(verify_signature(b"vote on block", &signature, &kp.public));
        assert!(!verify_signature(b"vote on other block", &signature, &kp.public));
    }

    #[test]
    fn signature_binds_to_the_signing_key() {
        let signer = generate_keypair();
        let other = generate_keypair();
        let signature = sign_message(b"msg", &signer.private);
        assert!(!verify_signature(b"msg", &signature, &other.public));
    }

    #[test]
    fn same_seed_signs_identically() {
        let a = keypair_from_seed(&[5u8; 32]);
        let b = keypair_from_seed(&[5u8; 32]);
        assert_eq!(
            sign_message(b"deterministic", &a.private).0,
            sign_message(b"deterministic", &b.private).0
        );
    }

    #[test]
    fn off_curve_public_key_never_verifies() {
        let kp = generate_keypair();
        let signature = sign_message(b"msg", &kp.private);
        assert!(!verify_signature(b"msg", &signature, &PublicKey([0xFF; 32])));
    }

    #[test]
    fn empty_message_is_signable() {
        let kp = generate_keypair();
        let signature = sign_message(b"", &kp.private);
        assert!(verify_signature(b"", &signature, &kp.public));
    }
}
