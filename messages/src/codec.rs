//! Datagram framing: header packing and body serialization.

use lattice_types::NetworkKind;
use thiserror::Error;

use crate::{Message, MessageType, VERSION_MAX, VERSION_MIN, VERSION_USING};

/// Bytes in the fixed header: magic(2) + versions(3) + type(1) + extensions(2).
pub const HEADER_LEN: usize = 8;

/// Largest datagram we are willing to decode.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("bad magic")]
    BadMagic,

    #[error("truncated frame")]
    Truncated,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("peer version {0} below minimum")]
    VersionTooOld(u8),

    #[error("malformed body: {0}")]
    Malformed(String),
}

/// Encode a message for the given network.
pub fn encode(message: &Message, network: NetworkKind) -> Vec<u8> {
    let body = bincode::serialize(message).expect("message bodies always serialize");
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&network.magic());
    frame.push(VERSION_MAX);
    frame.push(VERSION_USING);
    frame.push(VERSION_MIN);
    frame.push(message.message_type() as u8);
    frame.extend_from_slice(&0u16.to_be_bytes()); // extensions, currently unused
    frame.extend_from_slice(&body);
    frame
}

/// Decode a datagram for the given network. The header's declared type must
/// match the decoded body variant.
pub fn decode(data: &[u8], network: NetworkKind) -> Result<Message, WireError> {
    if data.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::Malformed("oversized frame".into()));
    }
    if data[..2] != network.magic() {
        return Err(WireError::BadMagic);
    }
    let version_using = data[3];
    if version_using < VERSION_MIN {
        return Err(WireError::VersionTooOld(version_using));
    }
    let declared =
        MessageType::from_wire(data[5]).ok_or(WireError::UnknownType(data[5]))?;
    let message: Message = bincode::deserialize(&data[HEADER_LEN..])
        .map_err(|_| WireError::Truncated)?;
    if message.message_type() != declared {
        return Err(WireError::Malformed("type/body mismatch".into()));
    }
    Ok(message)
}
