use thiserror::Error;

/// Errors shared across the workspace's leaf crates.
#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed input: {0}")]
    Malformed(String),
}
