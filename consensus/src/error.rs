use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("election for root {0} not found")]
    ElectionNotFound(String),

    #[error("election registry at capacity ({0})")]
    CapacityReached(usize),

    #[error("vote signature invalid")]
    InvalidVote,
}
