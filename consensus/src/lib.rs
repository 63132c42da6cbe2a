//! Consensus — fork resolution via delegated representative voting.
//!
//! Each account delegates its balance to a representative. When two blocks
//! compete for the same chain slot (the same root), representatives vote and
//! the block reaching a quorum of online voting weight wins.
//!
//! ## Module overview
//!
//! - [`vote`] — a representative's signed, sequence-numbered vote over block hashes.
//! - [`election`] — per-root election state: tallying, quorum, confirmation.
//! - [`active_elections`] — registry of in-flight elections + announcement rounds.
//! - [`vote_processor`] — dedicated-thread queue validating and routing votes.
//! - [`online_reps`] — sliding estimate of online stake for quorum computation.
//! - [`rep_crawler`] — probe bookkeeping for representative discovery.

pub mod active_elections;
pub mod election;
pub mod error;
pub mod online_reps;
pub mod rep_crawler;
pub mod vote;
pub mod vote_processor;

pub use active_elections::{ActiveElections, AnnounceAction, AnnounceRound, QuorumSettings};
pub use election::{Election, ElectionStatus, ElectionVoteResult};
pub use error::ConsensusError;
pub use online_reps::OnlineReps;
pub use rep_crawler::RepCrawler;
pub use vote::Vote;
pub use vote_processor::{VoteCode, VoteProcessor};
