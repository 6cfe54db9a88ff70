//! # BitTorrent Piece Download
//!
//! Pieces are the verification units of the torrent. Each one is fetched in
//! blocks of at most 16 KiB:
//!
//! 1. **Requests**: One REQUEST per block, all sent before any reply is read
//! 2. **Assembly**: Every PIECE reply is copied into the piece buffer at its offset
//! 3. **Verification**: The buffer is hashed with SHA-1 and compared to the metadata
//! 4. **Storage**: The buffer is written at `index * piece size` in the output file
//!
//! A piece failing verification is still written: the mismatch is only logged.
//! When the peer chokes us mid-piece, INTERESTED is sent again (at most 10 times
//! per piece). Outstanding requests are neither cancelled nor re-sent, so a peer
//! that never unchokes again stalls the download.

use crate::message::*;
use crate::session::PeerSession;
use crate::torrent::TorrentMetadata;

use anyhow::Result;
use boring::sha::Sha1;

// Standard block size for piece downloads (16KB)
pub const BLOCK_SIZE_MAX: u32 = 16384;

// Maximum number of INTERESTED messages sent after a choke, per piece
const INTERESTED_NUDGES_MAX: u32 = 10;

/// Download state of a single piece.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece
    pub hash: [u8; 20],
    /// Total length of the piece in bytes
    pub length: u32,
    /// Buffer receiving the blocks
    pub data: Vec<u8>,
    /// Number of PIECE messages stored so far
    pub received: u32,
}

/// Splits a piece of `length` bytes into `(begin, length)` blocks.
pub fn blocks(length: u32) -> impl Iterator<Item = (u32, u32)> {
    (0..length)
        .step_by(BLOCK_SIZE_MAX as usize)
        .map(move |begin| (begin, BLOCK_SIZE_MAX.min(length - begin)))
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
            data: vec![0; length as usize],
            received: 0,
        }
    }

    /// Number of PIECE replies expected for this piece.
    pub fn nb_blocks(&self) -> u32 {
        self.length.div_ceil(BLOCK_SIZE_MAX)
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.nb_blocks()
    }

    /// Copy a received block into the piece buffer.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the block belongs to another piece or does
    /// not fit in this one.
    pub fn store(&mut self, chunk: &Chunk<'_>) -> Result<()> {
        if chunk.index != self.index {
            return Err(protocol_error(format!(
                "received block of piece {} while downloading piece {}",
                chunk.index, self.index
            )));
        }

        let begin = chunk.begin as usize;
        let end = begin + chunk.data.len();
        if end > self.length as usize {
            return Err(protocol_error(format!(
                "block [{}:{}] exceeds piece {} of {} bytes",
                begin, end, self.index, self.length
            )));
        }

        self.data[begin..end].copy_from_slice(chunk.data);
        self.received += 1;

        Ok(())
    }

    /// Check the piece buffer against its expected hash.
    pub fn verify(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);

        hasher.finish() == self.hash
    }
}

/// Download, verify and write one piece.
///
/// Returns whether the piece matched its hash. A mismatch is not an error.
pub fn download_piece(
    session: &mut PeerSession,
    torrent: &TorrentMetadata,
    index: u32,
) -> Result<bool> {
    let mut piece_work = PieceWork::new(index, *torrent.piece_hash(index), torrent.piece_length(index));

    // Pipeline every request before reading any reply
    for (begin, length) in blocks(piece_work.length) {
        session.send(&Message::request(index, begin, length))?;
    }
    debug!(
        "Requested {} blocks of piece {} from peer {}",
        piece_work.nb_blocks(),
        index,
        session.peer()
    );

    let mut nudges = 0;
    while !piece_work.is_complete() {
        let message = session.receive()?;

        match message.id {
            MessageId::Piece => {
                let chunk = message.chunk()?;
                trace!(
                    "Download piece {} [{}:{}]",
                    chunk.index,
                    chunk.begin,
                    chunk.begin as usize + chunk.data.len()
                );
                piece_work.store(&chunk)?;
            }
            MessageId::Choke => {
                if nudges < INTERESTED_NUDGES_MAX {
                    nudges += 1;
                    session.send(&Message::new(MessageId::Interested))?;
                }
            }
            other => debug!("Ignore {} while downloading piece {}", other, index),
        }
    }

    let verified = piece_work.verify();
    if verified {
        debug!("Successfully verified integrity of piece {}", index);
    } else {
        warn!("Piece {} does not match its hash, writing it anyway", index);
    }

    session.write_at(torrent.piece_offset(index), &piece_work.data)?;

    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::LeechError;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finish()
    }

    #[test]
    fn test_blocks_cover_piece() {
        for length in [1u32, 3616, 16383, 16384, 16385, 65536, 262_144 + 7] {
            let blocks: Vec<(u32, u32)> = blocks(length).collect();

            let mut next = 0;
            for &(begin, block_length) in &blocks {
                assert_eq!(begin, next);
                assert!(block_length > 0 && block_length <= BLOCK_SIZE_MAX);
                next = begin + block_length;
            }
            assert_eq!(next, length);
            assert_eq!(blocks.len() as u32, length.div_ceil(BLOCK_SIZE_MAX));
        }
    }

    #[test]
    fn test_last_block_is_shorter() {
        let blocks: Vec<(u32, u32)> = blocks(20000).collect();
        assert_eq!(blocks, vec![(0, 16384), (16384, 3616)]);
    }

    #[test]
    fn test_store_and_verify() {
        let data: Vec<u8> = (0..20000u32).map(|i| i as u8).collect();
        let mut piece_work = PieceWork::new(4, sha1(&data), 20000);

        let second = Message::piece(4, 16384, &data[16384..]);
        let first = Message::piece(4, 0, &data[..16384]);
        piece_work.store(&second.chunk().unwrap()).unwrap();
        assert!(!piece_work.is_complete());
        piece_work.store(&first.chunk().unwrap()).unwrap();

        assert!(piece_work.is_complete());
        assert!(piece_work.verify());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut piece_work = PieceWork::new(0, sha1(b"abc"), 3);
        piece_work.store(&Message::piece(0, 0, b"abd").chunk().unwrap()).unwrap();
        assert!(!piece_work.verify());
    }

    #[test]
    fn test_block_of_other_piece_is_fatal() {
        let mut piece_work = PieceWork::new(1, [0; 20], 16384);
        let message = Message::piece(0, 0, &[0; 16]);

        let err = piece_work.store(&message.chunk().unwrap()).unwrap_err();
        assert!(matches!(err.downcast_ref::<LeechError>(), Some(LeechError::Protocol(_))));
    }

    #[test]
    fn test_block_out_of_bounds_is_fatal() {
        let mut piece_work = PieceWork::new(0, [0; 20], 100);
        let message = Message::piece(0, 90, &[0; 16]);
        assert!(piece_work.store(&message.chunk().unwrap()).is_err());
    }
}
