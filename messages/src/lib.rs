//! Wire messages for node-to-node communication.
//!
//! Every datagram starts with an eight-byte header (network magic, protocol
//! version triple, message type, extensions) followed by a bincode-encoded
//! body. The header fields are hand-packed in network byte order so foreign
//! implementations can dispatch without a serde stack.

pub mod codec;

use lattice_consensus::Vote;
use lattice_ledger::Block;
use lattice_types::{Account, BlockHash, PublicKey, Root, Signature};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub use codec::{decode, encode, WireError, HEADER_LEN};

/// Protocol version advertised in every header.
pub const VERSION_MAX: u8 = 7;
pub const VERSION_USING: u8 = 7;
pub const VERSION_MIN: u8 = 5;

/// Number of peer slots in a keepalive.
pub const KEEPALIVE_SLOTS: usize = 8;

/// Numeric wire identifiers for each message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Keepalive = 2,
    Publish = 3,
    ConfirmReq = 4,
    ConfirmAck = 5,
    NodeIdHandshake = 10,
    MusigStage0Req = 13,
    MusigStage0Res = 14,
    MusigStage1Req = 15,
    MusigStage1Res = 16,
    PublishVoteStaple = 17,
}

impl MessageType {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            2 => Self::Keepalive,
            3 => Self::Publish,
            4 => Self::ConfirmReq,
            5 => Self::ConfirmAck,
            10 => Self::NodeIdHandshake,
            13 => Self::MusigStage0Req,
            14 => Self::MusigStage0Res,
            15 => Self::MusigStage1Req,
            16 => Self::MusigStage1Res,
            17 => Self::PublishVoteStaple,
            _ => return None,
        })
    }
}

/// Eight endpoint slots advertising known peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keepalive {
    pub peers: [Option<SocketAddr>; KEEPALIVE_SLOTS],
}

/// Flood a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub block: Block,
}

/// Ask peers to vote on a block. Old fork elections probe with the
/// root-and-hash pair instead of a full block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmReq {
    Block(Block),
    RootHashPair { root: Root, head: BlockHash },
}

/// A representative's vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmAck {
    pub vote: Vote,
}

/// SYN-cookie handshake: optionally a query cookie to sign, optionally a
/// response proving ownership of the claimed node id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdHandshake {
    pub query: Option<[u8; 32]>,
    pub response: Option<(Account, Signature)>,
}

/// Open a staple session with a representative (round one request).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusigStage0Req {
    pub request_id: [u8; 32],
    pub block: Block,
    pub representative: Account,
}

/// Round-one response: the rep's nonce commitment, signed so the requester
/// can authenticate which rep answered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusigStage0Res {
    pub request_id: [u8; 32],
    pub r_commitment: [u8; 32],
    pub responder: PublicKey,
    pub signature: Signature,
}

/// Round-two request carrying the aggregate context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusigStage1Req {
    pub request_id: [u8; 32],
    pub r_total: [u8; 32],
    pub agg_pubkey: PublicKey,
    pub l_base: [u8; 32],
}

/// Round-two response: the partial signature scalar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusigStage1Res {
    pub request_id: [u8; 32],
    pub s_partial: [u8; 32],
}

/// Flood a stapled block: one aggregate signature plus the XOR fingerprint
/// of the contributing representatives' keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishVoteStaple {
    pub block: Block,
    pub reps_xor: [u8; 32],
    pub signature: Signature,
}

/// Any wire message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Keepalive(Keepalive),
    Publish(Publish),
    ConfirmReq(ConfirmReq),
    ConfirmAck(ConfirmAck),
    NodeIdHandshake(NodeIdHandshake),
    MusigStage0Req(MusigStage0Req),
    MusigStage0Res(MusigStage0Res),
    MusigStage1Req(MusigStage1Req),
    MusigStage1Res(MusigStage1Res),
    PublishVoteStaple(PublishVoteStaple),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Keepalive(_) => MessageType::Keepalive,
            Message::Publish(_) => MessageType::Publish,
            Message::ConfirmReq(_) => MessageType::ConfirmReq,
            Message::ConfirmAck(_) => MessageType::ConfirmAck,
            Message::NodeIdHandshake(_) => MessageType::NodeIdHandshake,
            Message::MusigStage0Req(_) => MessageType::MusigStage0Req,
            Message::MusigStage0Res(_) => MessageType::MusigStage0Res,
            Message::MusigStage1Req(_) => MessageType::MusigStage1Req,
            Message::MusigStage1Res(_) => MessageType::MusigStage1Res,
            Message::PublishVoteStaple(_) => MessageType::PublishVoteStaple,
        }
    }
}
