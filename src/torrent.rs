//! # Torrent Metadata
//!
//! This module decodes a bencoded torrent descriptor into an immutable
//! [`TorrentMetadata`] record.
//!
//! ## Torrent File Format
//!
//! - **announce**: Tracker URL for peer discovery
//! - **announce-list**: Optional tiers of backup tracker URLs
//! - **info**: Dictionary with file information and piece hashes
//!   - **piece length**: Size of each piece except possibly the last
//!   - **pieces**: Concatenated 20-byte SHA-1 hashes, one per piece
//!   - **length** / **name**: Size and suggested name of a single file
//!   - **files**: List of `{path, length}` entries for multi-file torrents
//!
//! ## Info Hash
//!
//! The info hash identifies the swarm. It is the SHA-1 of the bencoded `info`
//! dictionary exactly as it appears in the descriptor. The dictionary is decoded
//! as a generic value and re-encoded with sorted keys, so every key survives the
//! round trip, including the ones this client does not understand (`private`,
//! `source`, ...).
//!
//! ## Multi-file Torrents
//!
//! Only the first file of a multi-file torrent is downloaded. All entries are
//! logged, and the piece hashes are cut down to the pieces covering the first
//! file. The last of those pieces usually spans into the second file and then
//! fails verification.

use crate::error::LeechError;

use anyhow::{Context, Result};
use boring::sha::Sha1;
use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

use std::fs;
use std::path::Path;

// Size of SHA-1 hash in bytes
pub const SHA1_HASH_SIZE: usize = 20;

/// Immutable description of the file to download.
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// Suggested filename from torrent metadata
    name: String,
    /// Primary tracker URL
    announce: String,
    /// All tracker URLs, primary first, without duplicates
    trackers: Vec<String>,
    /// Total size of the file in bytes
    length: u64,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// SHA-1 hash of the bencoded info dictionary
    info_hash: [u8; 20],
    /// One SHA-1 hash per piece, index-aligned
    piece_hashes: Vec<[u8; 20]>,
}

/// File entry of a multi-file info dictionary.
#[derive(Deserialize)]
struct BencodeFile {
    // Size of the file in bytes
    length: u64,
    // Path components, the last one being the file name
    path: Vec<String>,
}

/// Typed view over the info dictionary.
#[derive(Deserialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes (single-file mode)
    length: Option<u64>,
    // Suggested filename (or directory name in multi-file mode)
    name: Option<String>,
    // Files (multi-file mode)
    files: Option<Vec<BencodeFile>>,
}

/// Top-level descriptor. The info dictionary is kept generic for hashing.
#[derive(Deserialize)]
struct BencodeTorrent {
    // URL of the tracker
    announce: Option<String>,
    // Tiers of tracker URLs
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Informations about file
    info: Value,
}

fn parse_error(message: impl Into<String>) -> anyhow::Error {
    LeechError::Parse(message.into()).into()
}

impl BencodeInfo {
    /// Split bencoded pieces into 20-byte SHA-1 hashes.
    fn split_pieces_hashes(&self) -> Result<Vec<[u8; 20]>> {
        if self.pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(parse_error(format!(
                "pieces length {} is not a multiple of {}",
                self.pieces.len(),
                SHA1_HASH_SIZE
            )));
        }

        let hashes = self
            .pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| {
                let mut hash = [0u8; SHA1_HASH_SIZE];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(hashes)
    }

    /// Resolve the name and length of the file to download.
    fn target_file(&self) -> Result<(String, u64)> {
        if let Some(length) = self.length {
            let name = self
                .name
                .clone()
                .ok_or_else(|| parse_error("missing name"))?;
            return Ok((name, length));
        }

        let files = match &self.files {
            Some(files) if !files.is_empty() => files,
            _ => return Err(parse_error("info has neither length nor files")),
        };

        warn!(
            "multi-file torrent with {} entries, only the first file is downloaded",
            files.len()
        );
        for (i, file) in files.iter().enumerate() {
            debug!("file {}: {} ({} bytes)", i, file.path.join("/"), file.length);
        }

        let first = &files[0];
        if first.path.is_empty() {
            return Err(parse_error("first file has an empty path"));
        }

        Ok((first.path.join("/"), first.length))
    }
}

/// Hash bencoded informations to uniquely identify a torrent.
fn hash_info(info: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(info);
    hasher.finish()
}

/// Order the tracker URLs: primary announce first, then every tier in order.
fn collect_trackers(announce: Option<String>, announce_list: Vec<Vec<String>>) -> Vec<String> {
    let mut trackers: Vec<String> = Vec::new();
    for url in announce.into_iter().chain(announce_list.into_iter().flatten()) {
        if !url.is_empty() && !trackers.contains(&url) {
            trackers.push(url);
        }
    }
    trackers
}

impl TorrentMetadata {
    /// Open and decode a torrent file.
    pub fn open(filepath: &Path) -> Result<TorrentMetadata> {
        let buf = fs::read(filepath)
            .with_context(|| format!("could not read torrent '{}'", filepath.display()))?;

        TorrentMetadata::from_bytes(&buf)
    }

    /// Decode a bencoded torrent descriptor.
    pub fn from_bytes(buf: &[u8]) -> Result<TorrentMetadata> {
        let bencode = de::from_bytes::<BencodeTorrent>(buf)
            .map_err(|e| parse_error(format!("could not decode torrent: {}", e)))?;

        if !matches!(bencode.info, Value::Dict(_)) {
            return Err(parse_error("info is not a dictionary"));
        }

        // Re-encode the info node, hash it, then read the typed fields back
        let info_buf = ser::to_bytes(&bencode.info)
            .map_err(|e| parse_error(format!("could not encode info: {}", e)))?;
        let info_hash = hash_info(&info_buf);
        let info = de::from_bytes::<BencodeInfo>(&info_buf)
            .map_err(|e| parse_error(format!("could not decode info: {}", e)))?;

        let trackers = collect_trackers(bencode.announce, bencode.announce_list);
        let announce = match trackers.first() {
            Some(url) => url.clone(),
            None => return Err(parse_error("torrent has no announce or announce-list")),
        };

        if info.piece_length == 0 {
            return Err(parse_error("piece length is zero"));
        }

        let (name, length) = info.target_file()?;
        let mut piece_hashes = info.split_pieces_hashes()?;
        let nb_pieces = length.div_ceil(info.piece_length as u64) as usize;

        if info.files.is_some() && info.length.is_none() {
            if piece_hashes.len() < nb_pieces {
                return Err(parse_error(format!(
                    "{} piece hashes cannot cover {} pieces",
                    piece_hashes.len(),
                    nb_pieces
                )));
            }
            piece_hashes.truncate(nb_pieces);
        } else if piece_hashes.len() != nb_pieces {
            return Err(parse_error(format!(
                "expected {} piece hashes, found {}",
                nb_pieces,
                piece_hashes.len()
            )));
        }

        Ok(TorrentMetadata {
            name,
            announce,
            trackers,
            length,
            piece_length: info.piece_length,
            info_hash,
            piece_hashes,
        })
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn announce(&self) -> &str {
        &self.announce
    }

    /// Tracker URLs in the order they should be tried.
    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    /// Total size of the file in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Nominal piece size in bytes.
    pub fn piece_size(&self) -> u32 {
        self.piece_length
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn piece_hash(&self, index: u32) -> &[u8; 20] {
        &self.piece_hashes[index as usize]
    }

    /// Get piece length. Only the last piece may be shorter than the piece size.
    pub fn piece_length(&self, index: u32) -> u32 {
        let begin = self.piece_offset(index);
        let end = (begin + self.piece_length as u64).min(self.length);

        (end - begin) as u32
    }

    /// Get piece offset within the file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const ANNOUNCE: &str = "http://tracker.example.com/announce";

    fn info_with_private(length: u64, piece_length: u32, nb_hashes: usize) -> Vec<u8> {
        let pieces: Vec<u8> = (0..nb_hashes * SHA1_HASH_SIZE).map(|i| i as u8).collect();
        let mut info = format!(
            "d6:lengthi{}e4:name8:file.bin12:piece lengthi{}e6:pieces{}:",
            length,
            piece_length,
            pieces.len()
        )
        .into_bytes();
        info.extend_from_slice(&pieces);
        info.extend_from_slice(b"7:privatei1ee");
        info
    }

    #[test]
    fn test_single_file_metadata() {
        let info = info_with_private(20000, 16384, 2);
        let torrent = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap();

        assert_eq!(torrent.name(), "file.bin");
        assert_eq!(torrent.announce(), ANNOUNCE);
        assert_eq!(torrent.length(), 20000);
        assert_eq!(torrent.piece_size(), 16384);
        assert_eq!(torrent.num_pieces(), 2);
        assert_eq!(torrent.piece_hash(1)[0], 20);
    }

    #[test]
    fn test_info_hash_matches_raw_info_bytes() {
        let info = info_with_private(20000, 16384, 2);
        let torrent = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(&info);
        assert_eq!(torrent.info_hash(), &hasher.finish());
    }

    #[test]
    fn test_num_pieces_is_ceiling() {
        for (length, piece_length) in [(1u64, 16384u32), (16384, 16384), (16385, 16384), (100, 7)] {
            let nb = length.div_ceil(piece_length as u64) as usize;
            let info = info_with_private(length, piece_length, nb);
            let torrent = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap();
            assert_eq!(torrent.num_pieces() as usize, nb);
        }
    }

    #[test]
    fn test_piece_lengths() {
        let info = info_with_private(20000, 16384, 2);
        let torrent = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap();

        assert_eq!(torrent.piece_length(0), 16384);
        assert_eq!(torrent.piece_length(1), 20000 - 16384);
        assert_eq!(torrent.piece_offset(1), 16384);

        let info = info_with_private(32768, 16384, 2);
        let torrent = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap();
        assert_eq!(torrent.piece_length(1), 16384);
    }

    #[test]
    fn test_wrong_hash_count_is_rejected() {
        let info = info_with_private(20000, 16384, 3);
        let err = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap_err();
        assert!(matches!(err.downcast_ref::<LeechError>(), Some(LeechError::Parse(_))));
    }

    #[test]
    fn test_pieces_not_multiple_of_20_is_rejected() {
        let info = b"d6:lengthi10e4:name1:a12:piece lengthi16384e6:pieces3:abce";
        let err = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, info)).unwrap_err();
        assert!(matches!(err.downcast_ref::<LeechError>(), Some(LeechError::Parse(_))));
    }

    #[test]
    fn test_zero_piece_length_is_rejected() {
        let info = info_with_private(10, 0, 1);
        let err = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap_err();
        assert!(matches!(err.downcast_ref::<LeechError>(), Some(LeechError::Parse(_))));
    }

    #[test]
    fn test_multi_file_with_too_few_hashes_is_rejected() {
        // First file spans 2 pieces, only one hash is given
        let mut info = b"d5:filesld6:lengthi30000e4:pathl5:a.txteee4:name3:dir12:piece lengthi16384e6:pieces20:".to_vec();
        info.extend_from_slice(&[7u8; 20]);
        info.push(b'e');

        let err = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap_err();
        assert!(matches!(err.downcast_ref::<LeechError>(), Some(LeechError::Parse(_))));
        assert!(err.to_string().contains("cannot cover 2 pieces"));
    }

    #[test]
    fn test_multi_tracker_descriptor() {
        let info = single_file_info("f", &[0; 10], 16384);
        let buf = multi_tracker_descriptor("wss://a/announce", &["udp://b:80", "http://c/announce"], &info);
        let torrent = TorrentMetadata::from_bytes(&buf).unwrap();

        assert_eq!(
            torrent.trackers(),
            &["wss://a/announce", "udp://b:80", "http://c/announce"]
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = TorrentMetadata::from_bytes(b"not bencode").unwrap_err();
        assert!(matches!(err.downcast_ref::<LeechError>(), Some(LeechError::Parse(_))));
    }

    #[test]
    fn test_multi_file_uses_first_file() {
        let pieces = [7u8; 40];
        let mut info = b"d5:filesld6:lengthi10e4:pathl3:dir5:a.txteed6:lengthi30000e4:pathl5:b.txteee4:name3:dir12:piece lengthi16384e6:pieces40:".to_vec();
        info.extend_from_slice(&pieces);
        info.push(b'e');

        let torrent = TorrentMetadata::from_bytes(&descriptor(ANNOUNCE, &info)).unwrap();
        assert_eq!(torrent.name(), "dir/a.txt");
        assert_eq!(torrent.length(), 10);
        assert_eq!(torrent.num_pieces(), 1);
    }

    #[test]
    fn test_announce_list_fallback() {
        let info = info_with_private(10, 16384, 1);
        let mut buf = b"d13:announce-listll3:udp8:http://aeel8:http://aee4:info".to_vec();
        buf.extend_from_slice(&info);
        buf.push(b'e');

        let torrent = TorrentMetadata::from_bytes(&buf).unwrap();
        assert_eq!(torrent.announce(), "udp");
        assert_eq!(torrent.trackers(), &["udp", "http://a"]);
    }

    #[test]
    fn test_descriptor_fixture_hashes_content() {
        let content: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        let buf = single_file_descriptor(ANNOUNCE, "data.bin", &content, 16384);
        let torrent = TorrentMetadata::from_bytes(&buf).unwrap();

        assert_eq!(torrent.piece_hash(1), &hash_info(&content[16384..]));
    }
}
