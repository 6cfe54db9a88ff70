//! # BitTorrent Peer Session
//!
//! This module implements the client side of one peer connection: handshake,
//! message exchange and the state learned from the peer.
//!
//! ## Session States
//!
//! ```text
//! Connected -> Handshaking -> Handshaked(choked) <-> Handshaked(unchoked) -> closed
//! ```
//!
//! A session only exists once the handshake succeeded, and it is never
//! re-established: losing the connection ends the download.
//!
//! ## Bitfield Encoding
//!
//! - Each byte represents 8 pieces
//! - Bit 7 (MSB) = piece index 0, bit 0 (LSB) = piece index 7
//! - Set bits indicate available pieces
//!
//! ## Piece Bookkeeping
//!
//! Pieces announced by the peer through HAVE and BITFIELD are pushed on an
//! `available` stack, duplicates included. Pieces already written are kept in a
//! `downloaded` set and are never announced as available again.

use crate::config::Config;
use crate::handshake::*;
use crate::message::*;
use crate::peer::Peer;
use crate::torrent::TorrentMetadata;

use anyhow::{anyhow, Context, Result};

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::Path;

/// Lowercase hexadecimal form of `bytes`, for logs.
fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// State of the connection with the single remote peer.
pub struct PeerSession {
    /// Remote peer address
    peer: Peer,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Number of pieces in the torrent
    num_pieces: u32,
    /// Whether the peer has choked this client
    choked: bool,
    /// Pieces the peer announced, most recent last
    available: Vec<u32>,
    /// Pieces already written to the output file
    downloaded: HashSet<u32>,
    /// Output file, opened once the peer first unchoked us
    output: Option<File>,
}

impl PeerSession {
    fn new(peer: Peer, conn: TcpStream, num_pieces: u32) -> PeerSession {
        PeerSession {
            peer,
            conn,
            num_pieces,
            choked: true,
            available: vec![],
            downloaded: HashSet::new(),
            output: None,
        }
    }

    /// Performs the handshake over a fresh connection and returns the session.
    ///
    /// The remote peer id is only logged. The remote info hash is not checked.
    ///
    /// # Arguments
    ///
    /// * `peer` - Remote peer the connection was opened to
    /// * `conn` - Freshly connected TCP stream
    /// * `torrent` - Torrent providing the info hash and the number of pieces
    /// * `config` - Client configuration providing our peer id
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or the peer answers with an invalid
    /// protocol string.
    pub fn handshake(
        peer: Peer,
        mut conn: TcpStream,
        torrent: &TorrentMetadata,
        config: &Config,
    ) -> Result<PeerSession> {
        // Send our handshake
        let handshake = Handshake::new(config.peer_id, *torrent.info_hash());
        conn.write_all(&handshake.serialize())
            .with_context(|| format!("could not send handshake to peer {}", peer))?;

        // Read the whole remote handshake
        let mut handshake_buf = [0u8; HANDSHAKE_SIZE];
        conn.read_exact(&mut handshake_buf)
            .with_context(|| format!("could not read handshake from peer {}", peer))?;
        let remote = deserialize_handshake(&handshake_buf)?;

        info!("Handshaked with peer {} (peer id {})", peer, to_hex(&remote.peer_id));

        Ok(PeerSession::new(peer, conn, torrent.num_pieces()))
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    #[cfg(test)]
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    #[cfg(test)]
    pub fn available(&self) -> &[u32] {
        &self.available
    }

    /// Takes the most recently announced piece.
    pub fn pop_available(&mut self) -> Option<u32> {
        self.available.pop()
    }

    pub fn is_downloaded(&self, index: u32) -> bool {
        self.downloaded.contains(&index)
    }

    pub fn mark_downloaded(&mut self, index: u32) {
        self.downloaded.insert(index);
    }

    pub fn downloaded_count(&self) -> usize {
        self.downloaded.len()
    }

    /// Sends one message as a complete frame.
    ///
    /// # Arguments
    ///
    /// * `message` - Message to serialize and write to the peer
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let message_encoded = message.serialize()?;

        trace!("Send {} to peer {}", message.id, self.peer);

        self.conn
            .write_all(&message_encoded)
            .with_context(|| format!("could not send {} to peer {}", message.id, self.peer))
    }

    /// Receives the next message, skipping keep-alives, and applies its effect
    /// on the session state before handing it to the caller.
    pub fn receive(&mut self) -> Result<Message> {
        loop {
            // Block until a whole frame is read
            let message = read_message(&mut self.conn)
                .with_context(|| format!("could not read message from peer {}", self.peer))?;

            match message {
                Some(message) => {
                    self.dispatch(&message)?;
                    return Ok(message);
                }
                None => debug!("Receive KEEP_ALIVE from peer {}", self.peer),
            }
        }
    }

    fn dispatch(&mut self, message: &Message) -> Result<()> {
        trace!("Receive {} from peer {}", message.id, self.peer);

        match message.id {
            MessageId::Choke => {
                if !self.choked {
                    info!("Peer {} choked us", self.peer);
                }
                self.choked = true;
            }
            MessageId::Unchoke => {
                if self.choked {
                    info!("Peer {} unchoked us", self.peer);
                }
                self.choked = false;
            }
            MessageId::Have => {
                // Get piece index
                let index = message.have_index()?;
                self.add_available(index);
            }
            MessageId::Bitfield => {
                for (byte_index, byte) in message.payload.iter().enumerate() {
                    // Bit 7 of each byte is the lowest piece index
                    for offset in 0..8 {
                        if byte >> (7 - offset) & 1 != 0 {
                            self.add_available((byte_index * 8 + offset) as u32);
                        }
                    }
                }
            }
            // Payloads are validated even though nothing is recorded
            MessageId::Request | MessageId::Cancel => {
                message.block()?;
            }
            MessageId::Piece => {
                message.chunk()?;
            }
            MessageId::Interested | MessageId::NotInterested => {}
        }

        Ok(())
    }

    fn add_available(&mut self, index: u32) {
        if index >= self.num_pieces {
            debug!("Ignore unknown piece {} from peer {}", index, self.peer);
        } else if !self.downloaded.contains(&index) {
            self.available.push(index);
        }
    }

    /// Declares interest and blocks until the peer unchokes us.
    pub fn await_unchoke(&mut self) -> Result<()> {
        self.send(&Message::new(MessageId::Interested))?;

        while self.choked {
            self.receive()?;
        }

        Ok(())
    }

    /// Creates the output file, truncated and pre-sized to `length` bytes.
    ///
    /// An existing file at `path` is overwritten without confirmation.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the output file
    /// * `length` - Final size of the file in bytes
    pub fn open_output(&mut self, path: &Path, length: u64) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("could not create output file '{}'", path.display()))?;
        // Pieces are written at their offset in any order
        file.set_len(length)
            .with_context(|| format!("could not resize output file '{}'", path.display()))?;

        self.output = Some(file);

        Ok(())
    }

    /// Writes `data` at `offset` in the output file.
    ///
    /// # Arguments
    ///
    /// * `offset` - Byte offset of `data` within the file
    /// * `data` - Bytes to write
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| anyhow!("output file is not open"))?;

        output.seek(SeekFrom::Start(offset))?;
        output.write_all(data)?;

        Ok(())
    }

    /// Flushes the output file to disk.
    pub fn sync_output(&mut self) -> Result<()> {
        if let Some(output) = self.output.as_mut() {
            output.flush()?;
            output.sync_all()?;
        }
        Ok(())
    }
}
