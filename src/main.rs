//! # Leech BitTorrent Client
//!
//! A command-line BitTorrent client downloading a single file from a single peer.
//!
//! ## Usage
//!
//! ```bash
//! leech <torrent_file>
//! leech <torrent_file> -o <output_file>
//! ```
//!
//! ## Architecture
//!
//! Everything runs on the main thread with blocking I/O:
//!
//! 1. **Metadata**: Decode the torrent and compute its info hash
//! 2. **Tracker**: Announce over HTTP or UDP to get candidate peers
//! 3. **Peer**: Connect to the first reachable peer and handshake
//! 4. **Download**: Fetch, verify and write pieces one at a time
//!
//! Set `RUST_LOG=leech=debug` to follow the protocol exchanges.

#[macro_use]
extern crate log;

mod config;
mod download;
mod error;
mod handshake;
mod message;
mod peer;
mod piece;
mod session;
mod torrent;
mod tracker;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use config::Config;
use session::PeerSession;
use torrent::TorrentMetadata;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A single-peer BitTorrent leech client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Exit status for a failed argument parse: 0 for help and version output, 1 otherwise.
fn parse_exit_code(error: &clap::Error) -> i32 {
    if error.use_stderr() {
        1
    } else {
        0
    }
}

fn run(args: Args) -> Result<()> {
    if !args.torrent.exists() {
        return Err(anyhow!(
            "could not find torrent file: {}",
            args.torrent.display()
        ));
    }

    let config = Config::default();
    let torrent = TorrentMetadata::open(&args.torrent)?;

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(torrent.name())));

    info!(
        "Torrent {:?}: {} bytes in {} pieces of {} bytes, tracker {}",
        torrent.name(),
        torrent.length(),
        torrent.num_pieces(),
        torrent.piece_size(),
        torrent.announce()
    );

    let peers = tracker::request_peers(&torrent, &config)?;
    let (peer, conn) = tracker::connect_first(&peers, config.connect_timeout)?;
    let mut session = PeerSession::handshake(peer, conn, &torrent, &config)?;

    println!(
        "Downloading {:?} ({} pieces) from {}",
        torrent.name(),
        torrent.num_pieces(),
        session.peer()
    );

    download::prepare(&mut session, &torrent, &output)?;
    let pb = download::progress_bar(torrent.length())?;
    let nb_corrupted = download::run(&mut session, &torrent, &pb)?;

    if nb_corrupted > 0 {
        warn!("{} pieces failed verification", nb_corrupted);
    }

    println!("Saved in \"{}\".", output.display());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments, usage errors exit with status 1
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let _ = error.print();
            std::process::exit(parse_exit_code(&error));
        }
    };

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}
