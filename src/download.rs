//! # Download Loop
//!
//! Drives the whole download against the single peer session:
//!
//! 1. **Interest**: Send INTERESTED and wait for the first UNCHOKE
//! 2. **Storage**: Create the output file at its final size
//! 3. **Selection**: Take the most recently announced piece not yet downloaded
//! 4. **Transfer**: Fetch, verify and write it, then notify the peer with HAVE
//!
//! When the peer has announced nothing left to fetch, one message is read to
//! learn about new pieces. There is no overall timeout: a silent peer blocks the
//! loop, a disconnected one ends it with an error.

use crate::message::Message;
use crate::piece::download_piece;
use crate::session::PeerSession;
use crate::torrent::TorrentMetadata;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

use std::path::Path;

/// Progress bar counting downloaded bytes.
pub fn progress_bar(length: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Wait for the peer to unchoke us, then create the output file.
///
/// # Arguments
///
/// * `session` - Handshaked session with the peer
/// * `torrent` - Torrent providing the final file size
/// * `output` - Location of the output file
pub fn prepare(session: &mut PeerSession, torrent: &TorrentMetadata, output: &Path) -> Result<()> {
    session.await_unchoke()?;
    session.open_output(output, torrent.length())
}

/// Download every piece of the torrent through `session`.
///
/// Expects [`prepare`] to have run. Returns the number of pieces that failed
/// verification.
///
/// # Arguments
///
/// * `session` - Unchoked session with the output file open
/// * `torrent` - Torrent providing piece hashes and lengths
/// * `pb` - Progress bar advanced by the length of each written piece
pub fn run(session: &mut PeerSession, torrent: &TorrentMetadata, pb: &ProgressBar) -> Result<u32> {
    let nb_pieces = torrent.num_pieces() as usize;
    let mut nb_corrupted = 0;

    while session.downloaded_count() < nb_pieces {
        // Most recently announced piece first
        let index = match session.pop_available() {
            Some(index) => index,
            None => {
                // Wait for the peer to announce more pieces
                session.receive()?;
                continue;
            }
        };

        if session.is_downloaded(index) {
            continue;
        }

        let verified = download_piece(session, torrent, index)?;
        session.mark_downloaded(index);

        // Only announce pieces that match their hash
        if verified {
            session.send(&Message::have(index))?;
        } else {
            nb_corrupted += 1;
        }

        pb.inc(torrent.piece_length(index) as u64);
        info!(
            "Downloaded piece {} ({}/{})",
            index,
            session.downloaded_count(),
            nb_pieces
        );
    }

    session.sync_output()?;
    pb.finish();

    Ok(nb_corrupted)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;
    use crate::message::{read_message, MessageId};
    use crate::session::testing::*;
    use crate::torrent::testing::single_file_descriptor;

    use std::fs;
    use std::sync::mpsc;

    const PIECE_LENGTH: u32 = 16384;

    fn content() -> Vec<u8> {
        (0..20000u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn download(corrupt: Option<u32>) -> (Vec<u8>, u32) {
        let content = content();
        let torrent = TorrentMetadata::from_bytes(&single_file_descriptor(
            "http://tracker.example.com/announce",
            "data.bin",
            &content,
            PIECE_LENGTH,
        ))
        .unwrap();
        assert_eq!(torrent.num_pieces(), 2);

        let served = content.clone();
        let (peer, handle) = spawn_peer(move |stream| {
            write(stream, &Message::new(MessageId::Unchoke));
            write(stream, &Message::new_with_payload(MessageId::Bitfield, vec![0b1100_0000]));
            serve(stream, &served, PIECE_LENGTH, corrupt);
        });

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");

        let conn = connect(&peer);
        let mut session = PeerSession::handshake(peer, conn, &torrent, &Config::default()).unwrap();
        prepare(&mut session, &torrent, &output).unwrap();
        let nb_corrupted = run(&mut session, &torrent, &ProgressBar::hidden()).unwrap();

        assert_eq!(session.downloaded_count(), 2);
        assert!(session.is_downloaded(0) && session.is_downloaded(1));

        drop(session);
        handle.join().unwrap();

        (fs::read(&output).unwrap(), nb_corrupted)
    }

    #[test]
    fn test_download_whole_file() {
        let (data, nb_corrupted) = download(None);

        assert_eq!(nb_corrupted, 0);
        assert_eq!(data.len(), 20000);
        assert_eq!(data, content());
    }

    #[test]
    fn test_corrupted_piece_is_kept() {
        let (data, nb_corrupted) = download(Some(1));
        let content = content();

        assert_eq!(nb_corrupted, 1);
        assert_eq!(data.len(), 20000);
        assert_eq!(&data[..16384], &content[..16384]);
        assert!(data[16384..]
            .iter()
            .zip(&content[16384..])
            .all(|(got, expected)| *got == !*expected));
    }

    #[test]
    fn test_choke_during_piece_sends_interested_ten_times() {
        let content: Vec<u8> = (0..10000u32).map(|i| (i % 13) as u8).collect();
        let torrent = TorrentMetadata::from_bytes(&single_file_descriptor(
            "http://tracker.example.com/announce",
            "data.bin",
            &content,
            PIECE_LENGTH,
        ))
        .unwrap();

        let (sender, receiver) = mpsc::channel();
        let served = content.clone();
        let (peer, handle) = spawn_peer(move |stream| {
            write(stream, &Message::new(MessageId::Unchoke));
            write(stream, &Message::have(0));

            let mut nb_interested = 0;
            let mut haves = vec![];
            let mut answered = false;
            while let Ok(message) = read_message(stream) {
                let message = match message {
                    Some(message) => message,
                    None => continue,
                };

                match message.id {
                    MessageId::Interested => nb_interested += 1,
                    MessageId::Have => haves.push(message.have_index().unwrap()),
                    MessageId::Request if !answered => {
                        answered = true;
                        for _ in 0..12 {
                            write(stream, &Message::new(MessageId::Choke));
                        }
                        write(stream, &Message::new(MessageId::Unchoke));

                        let (index, begin, length) = message.block().unwrap();
                        let block = &served[begin as usize..(begin + length) as usize];
                        write(stream, &Message::piece(index, begin, block));
                    }
                    _ => {}
                }
            }

            sender.send((nb_interested, haves)).unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");

        let conn = connect(&peer);
        let mut session = PeerSession::handshake(peer, conn, &torrent, &Config::default()).unwrap();
        prepare(&mut session, &torrent, &output).unwrap();
        let nb_corrupted = run(&mut session, &torrent, &ProgressBar::hidden()).unwrap();

        drop(session);
        handle.join().unwrap();
        let (nb_interested, haves) = receiver.recv().unwrap();

        // One before the first unchoke, then at most ten for the piece
        assert_eq!(nb_interested, 1 + 10);
        assert_eq!(haves, vec![0]);
        assert_eq!(nb_corrupted, 0);
        assert_eq!(fs::read(&output).unwrap(), content);
    }

    #[test]
    fn test_have_is_sent_for_verified_pieces_only() {
        let content = content();
        let torrent = TorrentMetadata::from_bytes(&single_file_descriptor(
            "http://tracker.example.com/announce",
            "data.bin",
            &content,
            PIECE_LENGTH,
        ))
        .unwrap();

        let (sender, receiver) = mpsc::channel();
        let served = content.clone();
        let (peer, handle) = spawn_peer(move |stream| {
            write(stream, &Message::new(MessageId::Unchoke));
            write(stream, &Message::new_with_payload(MessageId::Bitfield, vec![0b1100_0000]));

            let mut haves = vec![];
            while let Ok(message) = read_message(stream) {
                let message = match message {
                    Some(message) => message,
                    None => continue,
                };

                match message.id {
                    MessageId::Have => haves.push(message.have_index().unwrap()),
                    MessageId::Request => {
                        let (index, begin, length) = message.block().unwrap();
                        let start = (index * PIECE_LENGTH + begin) as usize;
                        let mut block = served[start..start + length as usize].to_vec();
                        if index == 0 {
                            block.iter_mut().for_each(|b| *b = !*b);
                        }
                        write(stream, &Message::piece(index, begin, &block));
                    }
                    _ => {}
                }
            }

            sender.send(haves).unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");

        let conn = connect(&peer);
        let mut session = PeerSession::handshake(peer, conn, &torrent, &Config::default()).unwrap();
        prepare(&mut session, &torrent, &output).unwrap();
        assert_eq!(run(&mut session, &torrent, &ProgressBar::hidden()).unwrap(), 1);

        drop(session);
        handle.join().unwrap();

        assert_eq!(receiver.recv().unwrap(), vec![1]);
    }

    #[test]
    fn test_waits_for_announcements() {
        let content = content();
        let torrent = TorrentMetadata::from_bytes(&single_file_descriptor(
            "http://tracker.example.com/announce",
            "data.bin",
            &content,
            PIECE_LENGTH,
        ))
        .unwrap();

        let served = content.clone();
        let (peer, handle) = spawn_peer(move |stream| {
            write(stream, &Message::new(MessageId::Unchoke));
            write(stream, &Message::new(MessageId::NotInterested));
            write(stream, &Message::have(0));
            write(stream, &Message::have(0));
            write(stream, &Message::have(1));
            serve(stream, &served, PIECE_LENGTH, None);
        });

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");

        let conn = connect(&peer);
        let mut session = PeerSession::handshake(peer, conn, &torrent, &Config::default()).unwrap();
        prepare(&mut session, &torrent, &output).unwrap();
        run(&mut session, &torrent, &ProgressBar::hidden()).unwrap();

        drop(session);
        handle.join().unwrap();

        assert_eq!(fs::read(&output).unwrap(), content);
    }
}
