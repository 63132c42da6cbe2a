//! Two-round Schnorr multi-signature over edwards25519.
//!
//! A set of representatives jointly produces one 64-byte signature on a block
//! hash. Round one exchanges nonce commitments `R_i = r_i * G`; round two
//! exchanges partial signatures `s_i = r_i + e * a_i * x_i`, where
//! `a_i = H(L, X_i)` is the per-key coefficient derived from the key-list
//! hash `L` and `e = H(L, A, R, m)` is the challenge bound to the aggregate
//! public key `A = sum(a_i * X_i)`. Key-prefixing the challenge and the
//! coefficients prevents rogue-key attacks.
//!
//! The aggregate `(R, s)` with `R = sum(R_i)` and `s = sum(s_i) mod l`
//! verifies as an ordinary Schnorr signature: `s * G == R + e * A`.
//!
//! All inputs and outputs at this module's boundary are plain byte arrays;
//! curve types stay internal.

use blake2::Blake2b512;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use lattice_types::{PrivateKey, PublicKey, Signature};
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::blake2b_parts;

/// A per-session secret nonce. Zeroized on drop; must never be reused across
/// sessions for the same key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretNonce(pub [u8; 32]);

/// Derive the ed25519 signing scalar from a private key seed (SHA-512
/// expansion with standard clamping).
fn signing_scalar(private: &PrivateKey) -> Scalar {
    let digest = Sha512::digest(private.0);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest[..32]);
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    let scalar = Scalar::from_bytes_mod_order(bytes);
    bytes.zeroize();
    scalar
}

fn scalar_from_hash(hasher: Blake2b512) -> Scalar {
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn decompress(bytes: &[u8; 32]) -> Option<EdwardsPoint> {
    CompressedEdwardsY(*bytes).decompress()
}

/// Generate a fresh secret nonce and its public commitment `R = r * G`.
pub fn generate_nonce() -> (SecretNonce, [u8; 32]) {
    let r = Scalar::random(&mut rand::rngs::OsRng);
    let commitment = EdwardsPoint::mul_base(&r).compress().0;
    (SecretNonce(r.to_bytes()), commitment)
}

/// The key-list hash `L = H(X_1 || X_2 || ... || X_n)`.
///
/// Callers must present keys in a canonical order (this workspace orders by
/// descending representative weight) so every participant derives the same
/// value.
pub fn l_base(keys: &[PublicKey]) -> [u8; 32] {
    let parts: Vec<&[u8]> = keys.iter().map(|k| k.0.as_slice()).collect();
    blake2b_parts(&parts)
}

/// The MuSig coefficient `a_i = H(L, X_i)` as canonical scalar bytes.
pub fn coefficient(l_base: &[u8; 32], key: &PublicKey) -> [u8; 32] {
    let mut hasher = Blake2b512::new();
    hasher.update(l_base);
    hasher.update(key.0);
    scalar_from_hash(hasher).to_bytes()
}

/// The challenge `e = H(L, A, R, m)` as canonical scalar bytes.
pub fn challenge(
    l_base: &[u8; 32],
    agg_pubkey: &PublicKey,
    r_total: &[u8; 32],
    message: &[u8],
) -> [u8; 32] {
    let mut hasher = Blake2b512::new();
    hasher.update(l_base);
    hasher.update(agg_pubkey.0);
    hasher.update(r_total);
    hasher.update(message);
    scalar_from_hash(hasher).to_bytes()
}

/// The aggregate public key `A = sum(a_i * X_i)` over the given key list.
///
/// Returns `None` if any key fails to decompress to a curve point.
pub fn aggregate_public(l_base: &[u8; 32], keys: &[PublicKey]) -> Option<PublicKey> {
    let mut total = EdwardsPoint::identity();
    for key in keys {
        let point = decompress(&key.0)?;
        let a = Scalar::from_bytes_mod_order(coefficient(l_base, key));
        total += a * point;
    }
    Some(PublicKey(total.compress().0))
}

/// The aggregate commitment `R = sum(R_i)`.
///
/// Returns `None` if any commitment fails to decompress.
pub fn aggregate_commitments(commitments: &[[u8; 32]]) -> Option<[u8; 32]> {
    let mut total = EdwardsPoint::identity();
    for commitment in commitments {
        total += decompress(commitment)?;
    }
    Some(total.compress().0)
}

/// Round-two partial signature `s_i = r_i + e * a_i * x_i`.
///
/// The signer derives its own coefficient from `l_base` and its public key,
/// so a malicious initiator cannot substitute a different coefficient.
pub fn partial_sign(
    nonce: &SecretNonce,
    private: &PrivateKey,
    l_base: &[u8; 32],
    agg_pubkey: &PublicKey,
    r_total: &[u8; 32],
    message: &[u8],
) -> [u8; 32] {
    let r = Scalar::from_bytes_mod_order(nonce.0);
    let x = signing_scalar(private);
    let own_key = crate::keys::public_key_of(private);
    let a = Scalar::from_bytes_mod_order(coefficient(l_base, &own_key));
    let e = Scalar::from_bytes_mod_order(challenge(l_base, agg_pubkey, r_total, message));
    (r + e * a * x).to_bytes()
}

/// Verify a single round-two partial signature: `s_i * G == R_i + e * a_i * X_i`.
///
/// Lets an aggregator attribute (and reject) individual contributions before
/// they poison the running total.
pub fn verify_partial(
    s_partial: &[u8; 32],
    commitment: &[u8; 32],
    key: &PublicKey,
    l_base: &[u8; 32],
    agg_pubkey: &PublicKey,
    r_total: &[u8; 32],
    message: &[u8],
) -> bool {
    let s: Option<Scalar> = Scalar::from_canonical_bytes(*s_partial).into();
    let Some(s) = s else {
        return false;
    };
    let Some(r_point) = decompress(commitment) else {
        return false;
    };
    let Some(key_point) = decompress(&key.0) else {
        return false;
    };
    let a = Scalar::from_bytes_mod_order(coefficient(l_base, key));
    let e = Scalar::from_bytes_mod_order(challenge(l_base, agg_pubkey, r_total, message));
    EdwardsPoint::mul_base(&s) == r_point + (e * a) * key_point
}

/// Whether `bytes` is a canonical scalar mod l. Incoming partial signatures
/// must pass this before entering a running total.
pub fn scalar_is_canonical(bytes: &[u8; 32]) -> bool {
    let maybe: Option<Scalar> = Scalar::from_canonical_bytes(*bytes).into();
    maybe.is_some()
}

/// `a + b mod l`, for accumulating partial signatures.
pub fn add_scalars(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    (Scalar::from_bytes_mod_order(*a) + Scalar::from_bytes_mod_order(*b)).to_bytes()
}

/// Assemble the 64-byte aggregate signature `(R, s)`.
pub fn assemble_signature(r_total: &[u8; 32], s_total: &[u8; 32]) -> Signature {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(r_total);
    bytes[32..].copy_from_slice(s_total);
    Signature(bytes)
}

/// Split a 64-byte aggregate signature back into `(R, s)`.
pub fn split_signature(signature: &Signature) -> ([u8; 32], [u8; 32]) {
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&signature.0[..32]);
    s.copy_from_slice(&signature.0[32..]);
    (r, s)
}

/// Verify an aggregate signature against an explicit signer key list.
///
/// Recomputes `L`, the aggregate public key, and the challenge, then checks
/// `s * G == R + e * A`. Returns the aggregate public key on success so
/// callers can log or cache it.
pub fn verify_with_keys(
    message: &[u8],
    keys: &[PublicKey],
    signature: &Signature,
) -> Option<PublicKey> {
    if keys.is_empty() {
        return None;
    }
    let (r_bytes, s_bytes) = split_signature(signature);
    let s: Option<Scalar> = Scalar::from_canonical_bytes(s_bytes).into();
    let s = s?;
    let l = l_base(keys);
    let agg = aggregate_public(&l, keys)?;
    let agg_point = decompress(&agg.0)?;
    let r_point = decompress(&r_bytes)?;
    let e = Scalar::from_bytes_mod_order(challenge(&l, &agg, &r_bytes, message));

    // s*G - e*A == R
    let candidate = EdwardsPoint::vartime_double_scalar_mul_basepoint(&-e, &agg_point, &s);
    if candidate == r_point {
        Some(agg)
    } else {
        None
    }
}
