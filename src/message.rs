//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types and framing of the BitTorrent peer
//! wire protocol.
//!
//! ## Message Structure
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! A frame with a zero length prefix is a keep-alive and carries no ID.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | - |
//! | 1 | UNCHOKE | - |
//! | 2 | INTERESTED | - |
//! | 3 | NOT INTERESTED | - |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | bitfield |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block |
//! | 8 | CANCEL | index, begin, length |

use crate::error::LeechError;

use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::fmt;
use std::io::{Cursor, Read};

/// Largest frame accepted from a peer: a 1 MiB payload plus the Piece header.
pub const MESSAGE_LEN_MAX: usize = (1 << 20) + 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        let id = match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            _ => return Err(protocol_error(format!("unknown message id {}", value))),
        };
        Ok(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageId::Choke => "CHOKE",
            MessageId::Unchoke => "UNCHOKE",
            MessageId::Interested => "INTERESTED",
            MessageId::NotInterested => "NOT_INTERESTED",
            MessageId::Have => "HAVE",
            MessageId::Bitfield => "BITFIELD",
            MessageId::Request => "REQUEST",
            MessageId::Piece => "PIECE",
            MessageId::Cancel => "CANCEL",
        };
        f.write_str(name)
    }
}

pub(crate) fn protocol_error(message: impl Into<String>) -> anyhow::Error {
    LeechError::Protocol(message.into()).into()
}

/// A peer wire message, built for one send or receive and dropped after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: Vec<u8>,
}

/// Block of data carried by a PIECE message, borrowed from the message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Zero-based piece index
    pub index: u32,
    /// Byte offset within the piece
    pub begin: u32,
    /// Block data
    pub data: &'a [u8],
}

impl Message {
    /// Build a new message without payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    /// * `payload` - The content of the message.
    pub fn new_with_payload(id: MessageId, payload: Vec<u8>) -> Self {
        Message { id, payload }
    }

    /// Build a HAVE announcing piece `index`.
    pub fn have(index: u32) -> Self {
        Message::new_with_payload(MessageId::Have, index.to_be_bytes().to_vec())
    }

    /// Build a REQUEST for `length` bytes at `begin` within piece `index`.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        Message::new_with_payload(MessageId::Request, block_payload(index, begin, length))
    }

    #[cfg(test)]
    /// Build a PIECE message carrying `data` at `begin` within piece `index`.
    pub fn piece(index: u32, begin: u32, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(data);
        Message::new_with_payload(MessageId::Piece, payload)
    }

    /// Serialize message into a length-prefixed frame.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let message_len = 1 + self.payload.len();

        // Add message length, then id and payload
        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);
        serialized.write_u32::<BigEndian>(message_len as u32)?;
        serialized.push(self.id as u8);
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }

    /// Piece index of a HAVE message.
    pub fn have_index(&self) -> Result<u32> {
        self.expect_payload(MessageId::Have, 4)?;
        Ok(Cursor::new(&self.payload).read_u32::<BigEndian>()?)
    }

    /// `(index, begin, length)` of a REQUEST or CANCEL message.
    pub fn block(&self) -> Result<(u32, u32, u32)> {
        if self.id != MessageId::Request && self.id != MessageId::Cancel {
            return Err(protocol_error(format!("{} does not describe a block", self.id)));
        }
        self.expect_payload(self.id, 12)?;

        let mut cursor = Cursor::new(&self.payload);
        let index = cursor.read_u32::<BigEndian>()?;
        let begin = cursor.read_u32::<BigEndian>()?;
        let length = cursor.read_u32::<BigEndian>()?;

        Ok((index, begin, length))
    }

    /// Borrow the block carried by a PIECE message.
    pub fn chunk(&self) -> Result<Chunk<'_>> {
        if self.id != MessageId::Piece || self.payload.len() < 8 {
            return Err(protocol_error(format!(
                "invalid {} message of {} payload bytes",
                self.id,
                self.payload.len()
            )));
        }

        // Get piece index and block offset, the rest is block data
        let mut cursor = Cursor::new(&self.payload[..8]);
        let index = cursor.read_u32::<BigEndian>()?;
        let begin = cursor.read_u32::<BigEndian>()?;

        Ok(Chunk {
            index,
            begin,
            data: &self.payload[8..],
        })
    }

    fn expect_payload(&self, id: MessageId, len: usize) -> Result<()> {
        if self.id != id || self.payload.len() != len {
            return Err(protocol_error(format!(
                "invalid {} message of {} payload bytes",
                self.id,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

fn block_payload(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

/// Read one frame from `reader`.
///
/// Returns `None` for a keep-alive. Blocks until the whole frame is read.
///
/// # Arguments
///
/// * `reader` - Stream positioned at the start of a frame
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    // Get message length
    let message_len = reader.read_u32::<BigEndian>()? as usize;

    if message_len == 0 {
        return Ok(None);
    }
    if message_len > MESSAGE_LEN_MAX {
        return Err(protocol_error(format!(
            "message length {} exceeds {}",
            message_len, MESSAGE_LEN_MAX
        )));
    }

    // Read message body
    let mut message_buf = vec![0; message_len];
    reader.read_exact(&mut message_buf)?;

    deserialize_message(&message_buf).map(Some)
}

/// Deserialize the body of a frame (ID followed by payload).
///
/// # Arguments
///
/// * `message_buf` - The frame without its length prefix.
pub fn deserialize_message(message_buf: &[u8]) -> Result<Message> {
    // Get message id and payload
    let (&id, payload) = message_buf
        .split_first()
        .ok_or_else(|| protocol_error("empty message body"))?;

    Ok(Message::new_with_payload(MessageId::try_from(id)?, payload.to_vec()))
}
