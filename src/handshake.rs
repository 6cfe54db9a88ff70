//! # BitTorrent Handshake Protocol
//!
//! The handshake is the first exchange on a peer connection. It is a fixed
//! 68-byte message:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19)
//! - **pstr**: 19 bytes - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros, no extension is advertised
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Unique identifier for the peer
//!
//! The info hash sent back by the remote peer is not compared with ours: a peer
//! serving another torrent fails later, when its pieces do not verify.

use crate::message::protocol_error;

use anyhow::Result;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Size of a handshake using the standard protocol string.
pub const HANDSHAKE_SIZE: usize = 49 + PROTOCOL_ID.len();

/// Represents a BitTorrent handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 8 reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte unique identifier of the sender
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new handshake with the standard protocol string and no extension bits.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte unique identifier of the sender
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary
    pub fn new(peer_id: [u8; 20], info_hash: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut serialized = [0u8; HANDSHAKE_SIZE];

        // Add protocol string and its length
        serialized[0] = PROTOCOL_ID.len() as u8;
        serialized[1..20].copy_from_slice(PROTOCOL_ID);
        // Add reserved bytes, info hash and peer id
        serialized[20..28].copy_from_slice(&self.reserved);
        serialized[28..48].copy_from_slice(&self.info_hash);
        serialized[48..68].copy_from_slice(&self.peer_id);

        serialized
    }
}

/// Deserializes a received 68-byte handshake.
///
/// # Arguments
///
/// * `buf` - The complete handshake as read from the connection
///
/// # Errors
///
/// Returns a protocol error if the length byte or the protocol string is not the
/// standard BitTorrent one.
pub fn deserialize_handshake(buf: &[u8; HANDSHAKE_SIZE]) -> Result<Handshake> {
    // Check protocol string
    let pstrlen = buf[0] as usize;
    if pstrlen != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
        return Err(protocol_error(format!(
            "unexpected handshake protocol {:?}",
            String::from_utf8_lossy(&buf[1..1 + pstrlen.min(HANDSHAKE_SIZE - 1)])
        )));
    }

    // Get reserved bytes, info hash and peer id
    let mut handshake = Handshake::new([0; 20], [0; 20]);
    handshake.reserved.copy_from_slice(&buf[20..28]);
    handshake.info_hash.copy_from_slice(&buf[28..48]);
    handshake.peer_id.copy_from_slice(&buf[48..68]);

    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([b'p'; 20], [b'i'; 20]);
        let bytes = handshake.serialize();

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0; 8]);
        assert_eq!(&bytes[28..48], &[b'i'; 20]);
        assert_eq!(&bytes[48..68], &[b'p'; 20]);
    }

    #[test]
    fn test_deserialize_handshake() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        assert_eq!(deserialize_handshake(&handshake.serialize()).unwrap(), handshake);
    }

    #[test]
    fn test_foreign_protocol_is_rejected() {
        let mut bytes = Handshake::new([1; 20], [2; 20]).serialize();
        bytes[1] = b'X';
        assert!(deserialize_handshake(&bytes).is_err());

        bytes[0] = 200;
        assert!(deserialize_handshake(&bytes).is_err());
    }
}
