//! Peer lifecycle and handshake gating.

pub mod peer_directory;
pub mod syn_cookies;

pub use peer_directory::{PeerDirectory, PeerInfo};
pub use syn_cookies::SynCookies;
