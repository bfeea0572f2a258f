//! Wire messages of the Tessera peer protocol.
//!
//! A [`Message`] is a numeric [`MsgType`] code plus a bincode payload. Framed
//! messages are bincode-encoded `Message` values and never exceed
//! [`MAX_MSG_SIZE`].

use std::fmt;

use serde::{Deserialize, Serialize};

use tessera_core::error::SyncError;
use tessera_core::types::{Block, BlockHeader, Hash256, Transaction};

/// Largest encoded message accepted or produced.
pub const MAX_MSG_SIZE: usize = 20 << 20;

/// Decoding config for peer data. The limit caps what a declared length may
/// make the decoder allocate.
fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_MSG_SIZE>()
}

/// Numeric message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MsgType {
    BlockReq = 1,
    BlockResp = 2,
    Block = 3,
    Transaction = 4,
    PeerState = 5,
    PeerStateReq = 6,
    HeaderReq = 7,
    HeaderRsp = 8,
}

impl MsgType {
    pub const fn code(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for MsgType {
    type Error = SyncError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => MsgType::BlockReq,
            2 => MsgType::BlockResp,
            3 => MsgType::Block,
            4 => MsgType::Transaction,
            5 => MsgType::PeerState,
            6 => MsgType::PeerStateReq,
            7 => MsgType::HeaderReq,
            8 => MsgType::HeaderRsp,
            other => return Err(SyncError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// --- payloads ---

/// Ask for the main-chain blocks between the first and last hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockReq {
    pub block_hashes: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockResp {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transactions {
    pub transactions: Vec<Transaction>,
}

/// Sender's current main-chain height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PeerState {
    pub height: u64,
}

/// Sender's height, asking for ours in return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PeerStateReq {
    pub height: u64,
}

/// Ask for main-chain headers in `from_height..=to_height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct HeaderReq {
    pub from_height: u64,
    pub to_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct HeaderRsp {
    pub headers: Vec<BlockHeader>,
}

/// A framed message: type code plus encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Message {
    pub code: u64,
    pub payload: Vec<u8>,
}

impl Message {
    /// Encode for the wire. Fails with `MessageTooLarge` past [`MAX_MSG_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let bytes = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Encode(e.to_string()))?;
        if bytes.len() > MAX_MSG_SIZE {
            return Err(SyncError::MessageTooLarge { size: bytes.len(), max: MAX_MSG_SIZE });
        }
        Ok(bytes)
    }

    /// Decode a wire frame. The size limit is checked before decoding.
    pub fn decode(data: &[u8]) -> Result<Self, SyncError> {
        if data.len() > MAX_MSG_SIZE {
            return Err(SyncError::MessageTooLarge { size: data.len(), max: MAX_MSG_SIZE });
        }
        let (msg, _): (Self, usize) = bincode::decode_from_slice(data, wire_config())
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(msg)
    }

    pub fn msg_type(&self) -> Result<MsgType, SyncError> {
        MsgType::try_from(self.code)
    }

    /// Approximate in-memory size, used to reject oversized frames early.
    pub fn size(&self) -> usize {
        self.payload.len() + std::mem::size_of::<u64>()
    }
}

/// Typed view of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    BlockReq(BlockReq),
    BlockResp(BlockResp),
    Block(Box<Block>),
    Transaction(Transactions),
    PeerState(PeerState),
    PeerStateReq(PeerStateReq),
    HeaderReq(HeaderReq),
    HeaderRsp(HeaderRsp),
}

fn encode_payload<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, SyncError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(|e| SyncError::Encode(e.to_string()))
}

fn decode_payload<T: bincode::Decode<()>>(msg_type: MsgType, payload: &[u8]) -> Result<T, SyncError> {
    let (value, _): (T, usize) = bincode::decode_from_slice(payload, wire_config())
        .map_err(|e| SyncError::Decode(format!("{msg_type} payload: {e}")))?;
    Ok(value)
}

impl SyncMessage {
    pub fn msg_type(&self) -> MsgType {
        match self {
            SyncMessage::BlockReq(_) => MsgType::BlockReq,
            SyncMessage::BlockResp(_) => MsgType::BlockResp,
            SyncMessage::Block(_) => MsgType::Block,
            SyncMessage::Transaction(_) => MsgType::Transaction,
            SyncMessage::PeerState(_) => MsgType::PeerState,
            SyncMessage::PeerStateReq(_) => MsgType::PeerStateReq,
            SyncMessage::HeaderReq(_) => MsgType::HeaderReq,
            SyncMessage::HeaderRsp(_) => MsgType::HeaderRsp,
        }
    }

    pub fn to_message(&self) -> Result<Message, SyncError> {
        let payload = match self {
            SyncMessage::BlockReq(m) => encode_payload(m)?,
            SyncMessage::BlockResp(m) => encode_payload(m)?,
            SyncMessage::Block(m) => encode_payload(m.as_ref())?,
            SyncMessage::Transaction(m) => encode_payload(m)?,
            SyncMessage::PeerState(m) => encode_payload(m)?,
            SyncMessage::PeerStateReq(m) => encode_payload(m)?,
            SyncMessage::HeaderReq(m) => encode_payload(m)?,
            SyncMessage::HeaderRsp(m) => encode_payload(m)?,
        };
        if payload.len() > MAX_MSG_SIZE {
            return Err(SyncError::MessageTooLarge { size: payload.len(), max: MAX_MSG_SIZE });
        }
        Ok(Message { code: self.msg_type().code(), payload })
    }

    /// Decode the payload according to its code.
    pub fn from_message(msg: &Message) -> Result<Self, SyncError> {
        if msg.size() > MAX_MSG_SIZE {
            return Err(SyncError::MessageTooLarge { size: msg.size(), max: MAX_MSG_SIZE });
        }
        let msg_type = msg.msg_type()?;
        let payload = msg.payload.as_slice();
        Ok(match msg_type {
            MsgType::BlockReq => SyncMessage::BlockReq(decode_payload(msg_type, payload)?),
            MsgType::BlockResp => SyncMessage::BlockResp(decode_payload(msg_type, payload)?),
            MsgType::Block => SyncMessage::Block(Box::new(decode_payload(msg_type, payload)?)),
            MsgType::Transaction => SyncMessage::Transaction(decode_payload(msg_type, payload)?),
            MsgType::PeerState => SyncMessage::PeerState(decode_payload(msg_type, payload)?),
            MsgType::PeerStateReq => SyncMessage::PeerStateReq(decode_payload(msg_type, payload)?),
            MsgType::HeaderReq => SyncMessage::HeaderReq(decode_payload(msg_type, payload)?),
            MsgType::HeaderRsp => SyncMessage::HeaderRsp(decode_payload(msg_type, payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(MsgType::BlockReq.code(), 1);
        assert_eq!(MsgType::HeaderRsp.code(), 8);
        for code in 1..=8 {
            assert_eq!(MsgType::try_from(code).unwrap().code(), code);
        }
    }

    #[test]
    fn unknown_code_rejected() {
        let msg = Message { code: 42, payload: vec![] };
        assert_eq!(SyncMessage::from_message(&msg), Err(SyncError::UnknownMessageType(42)));
        assert_eq!(MsgType::try_from(0), Err(SyncError::UnknownMessageType(0)));
    }

    #[test]
    fn peer_state_through_frame() {
        let typed = SyncMessage::PeerStateReq(PeerStateReq { height: 77 });
        let frame = typed.to_message().unwrap().encode().unwrap();
        let decoded = SyncMessage::from_message(&Message::decode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, typed);
    }

    #[test]
    fn oversized_frame_rejected_before_decode() {
        let data = vec![0u8; MAX_MSG_SIZE + 1];
        assert!(matches!(
            Message::decode(&data),
            Err(SyncError::MessageTooLarge { size, max: MAX_MSG_SIZE }) if size == MAX_MSG_SIZE + 1
        ));
    }

    #[test]
    fn oversized_message_rejected_on_encode() {
        let msg = Message { code: MsgType::Block.code(), payload: vec![0u8; MAX_MSG_SIZE] };
        assert!(matches!(msg.encode(), Err(SyncError::MessageTooLarge { .. })));
    }

    /// A varint length prefix claiming `len` elements.
    fn huge_length(len: u64) -> Vec<u8> {
        let mut bytes = vec![253];
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes
    }

    #[test]
    fn hostile_frame_length_is_decode_error() {
        let mut frame = vec![MsgType::BlockResp.code() as u8];
        frame.extend(huge_length(1 << 40));
        assert!(matches!(Message::decode(&frame), Err(SyncError::Decode(_))));
    }

    #[test]
    fn hostile_payload_length_is_decode_error() {
        for code in [MsgType::BlockReq, MsgType::BlockResp, MsgType::Transaction, MsgType::HeaderRsp] {
            let msg = Message { code: code.code(), payload: huge_length(u64::MAX >> 1) };
            assert!(matches!(SyncMessage::from_message(&msg), Err(SyncError::Decode(_))));
        }
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let msg = Message { code: MsgType::HeaderReq.code(), payload: vec![0xFF] };
        assert!(matches!(SyncMessage::from_message(&msg), Err(SyncError::Decode(_))));
    }
}
