//! Blake2b content hashing.

use blake2::digest::{consts::U32, Digest};
use blake2::Blake2b;

type Blake2b256 = Blake2b<U32>;

/// Blake2b-256 of a single byte slice.
pub fn blake2b(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Blake2b-256 over a sequence of parts, hashed as one stream.
pub fn blake2b_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(blake2b(b"abc"), blake2b(b"abc"));
        assert_ne!(blake2b(b"abc"), blake2b(b"abd"));
    }

    #[test]
    fn parts_equal_concatenation() {
        assert_eq!(blake2b_parts(&[b"ab", b"c"]), blake2b(b"abc"));
    }
}
