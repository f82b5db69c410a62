//! Peer protocol messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_state::Block;
use keel_types::{HashValue, MemberIndex, Signature};

use crate::{P2PError, Result};

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Request for a block by state index.
    GetBlock = 1,
    /// A block.
    Block = 2,
    /// A partial signature over a round result.
    SignedResult = 3,
}

impl MessageType {
    /// Parse a message type from a byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(MessageType::GetBlock),
            2 => Ok(MessageType::Block),
            3 => Ok(MessageType::SignedResult),
            _ => Err(P2PError::InvalidMessage(format!(
                "unknown message type: {}",
                b
            ))),
        }
    }
}

/// Request for the block that produced `state_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBlock {
    /// Requested state index.
    pub state_index: u32,
}

impl GetBlock {
    /// Encode the message to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(MessageType::GetBlock as u8);
        buf.put_u32(self.state_index);
        buf.freeze()
    }

    /// Decode the message body.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() != 4 {
            return Err(P2PError::InvalidMessage("bad get-block length".into()));
        }
        Ok(GetBlock {
            state_index: buf.get_u32(),
        })
    }
}

/// A block sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMessage {
    /// The block.
    pub block: Block,
}

impl BlockMessage {
    /// Encode the message to bytes.
    pub fn encode(&self) -> Bytes {
        let block = self.block.encode();
        let mut buf = BytesMut::with_capacity(1 + block.len());
        buf.put_u8(MessageType::Block as u8);
        buf.put_slice(&block);
        buf.freeze()
    }

    /// Decode the message body. The block is validated while decoding.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(BlockMessage {
            block: Block::decode(buf)?,
        })
    }
}

/// A member's partial signature over a round's transaction essence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedResult {
    /// Signing member.
    pub sender_index: MemberIndex,
    /// State index the round is producing from.
    pub state_index: u32,
    /// Round session identifier.
    pub session_id: u64,
    /// Hash of the signed essence.
    pub essence_hash: HashValue,
    /// Signature over `essence_hash`.
    pub signature: Signature,
}

impl SignedResult {
    const BODY_LEN: usize = 2 + 4 + 8 + 32 + 64;

    /// Encode the message to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + Self::BODY_LEN);
        buf.put_u8(MessageType::SignedResult as u8);
        buf.put_u16(self.sender_index);
        buf.put_u32(self.state_index);
        buf.put_u64(self.session_id);
        buf.put_slice(self.essence_hash.as_bytes());
        buf.put_slice(&self.signature.to_bytes());
        buf.freeze()
    }

    /// Decode the message body.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() != Self::BODY_LEN {
            return Err(P2PError::InvalidMessage(format!(
                "bad signed-result length: {}",
                buf.remaining()
            )));
        }
        let sender_index = buf.get_u16();
        let state_index = buf.get_u32();
        let session_id = buf.get_u64();
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        let mut sig = [0u8; 64];
        buf.copy_to_slice(&mut sig);

        Ok(SignedResult {
            sender_index,
            state_index,
            session_id,
            essence_hash: HashValue::from_array(hash),
            signature: Signature::from(sig),
        })
    }
}

/// Any peer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Block request.
    GetBlock(GetBlock),
    /// Block.
    Block(BlockMessage),
    /// Partial signature.
    SignedResult(SignedResult),
}

impl Message {
    /// Encodes the message to bytes.
    pub fn encode(&self) -> Bytes {
        match self {
            Message::GetBlock(m) => m.encode(),
            Message::Block(m) => m.encode(),
            Message::SignedResult(m) => m.encode(),
        }
    }

    /// Decodes a message from bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(P2PError::InvalidMessage("empty message".into()));
        }
        match MessageType::from_byte(buf.get_u8())? {
            MessageType::GetBlock => GetBlock::decode(buf).map(Message::GetBlock),
            MessageType::Block => BlockMessage::decode(buf).map(Message::Block),
            MessageType::SignedResult => SignedResult::decode(buf).map(Message::SignedResult),
        }
    }

    /// Returns the message type as a string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::GetBlock(_) => "get_block",
            Message::Block(_) => "block",
            Message::SignedResult(_) => "signed_result",
        }
    }
}
