//! Property tests for the fundamental types.

use lattice_types::{Account, Amount, BlockHash, Root, Signature};
use proptest::prelude::*;

proptest! {
    #[test]
    fn amount_percent_never_exceeds_input(raw in any::<u128>(), pct in 0u128..=100) {
        let amount = Amount::new(raw);
        prop_assert!(amount.percent(pct) <= amount);
    }

    #[test]
    fn amount_add_is_commutative(a in any::<u128>(), b in any::<u128>()) {
        prop_assert_eq!(Amount::new(a) + Amount::new(b), Amount::new(b) + Amount::new(a));
    }

    #[test]
    fn block_hash_serde_round_trip(bytes in any::<[u8; 32]>()) {
        let hash = BlockHash::new(bytes);
        let encoded = bincode::serialize(&hash).unwrap();
        let decoded: BlockHash = bincode::deserialize(&encoded).unwrap();
        prop_assert_eq!(hash, decoded);
    }

    #[test]
    fn signature_serde_round_trip(head in any::<[u8; 32]>(), tail in any::<[u8; 32]>()) {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&head);
        bytes[32..].copy_from_slice(&tail);
        let sig = Signature(bytes);
        let encoded = bincode::serialize(&sig).unwrap();
        let decoded: Signature = bincode::deserialize(&encoded).unwrap();
        prop_assert_eq!(sig, decoded);
    }

    #[test]
    fn root_conversions_preserve_bytes(bytes in any::<[u8; 32]>()) {
        prop_assert_eq!(Root::from(BlockHash::new(bytes)).0, bytes);
        prop_assert_eq!(Root::from(Account::new(bytes)).0, bytes);
    }
}
