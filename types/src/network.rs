//! Network selection and the per-network protocol constants.

use serde::{Deserialize, Serialize};

/// Which network this node participates in. Test uses aggressive timers so
/// multi-node tests converge in milliseconds rather than minutes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Live,
    #[default]
    Test,
}

impl NetworkKind {
    /// Default UDP peering port.
    pub fn default_port(&self) -> u16 {
        match self {
            NetworkKind::Live => 7075,
            NetworkKind::Test => 54000,
        }
    }

    /// Two-byte magic prefix on every wire message.
    pub fn magic(&self) -> [u8; 2] {
        match self {
            NetworkKind::Live => *b"LC",
            NetworkKind::Test => *b"LX",
        }
    }

    /// Interval between election announcement rounds.
    pub fn announce_interval_ms(&self) -> u64 {
        match self {
            NetworkKind::Live => 16_000,
            NetworkKind::Test => 10,
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, NetworkKind::Test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_per_network() {
        assert_eq!(NetworkKind::Live.default_port(), 7075);
        assert_eq!(NetworkKind::Test.default_port(), 54000);
    }

    #[test]
    fn magic_differs_across_networks() {
        assert_ne!(NetworkKind::Live.magic(), NetworkKind::Test.magic());
    }
}
