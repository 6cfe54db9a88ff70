//! # Peer Addresses
//!
//! This module defines the `Peer` structure and parses the peer lists returned
//! by trackers.
//!
//! ## Compact Peer Format
//!
//! HTTP trackers (with `compact=1`) and UDP trackers both return peers as a
//! concatenation of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! - IP address in network byte order (big-endian)
//! - Port number in network byte order (big-endian)

use crate::error::LeechError;

use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const PEER_SIZE: usize = 6;

type PeerId = u32;

/// A candidate peer returned by a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Position in the tracker response, used in logs
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    pub fn new(id: PeerId, ip: Ipv4Addr, port: u16) -> Peer {
        Peer { id, ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}:{}", self.id, self.ip, self.port)
    }
}

/// Parses a compact peer list into peers, keeping the tracker's order.
///
/// # Errors
///
/// Returns a tracker error if the list length is not a multiple of 6 bytes.
pub fn parse_compact_peers(tracker_peers: &[u8]) -> Result<Vec<Peer>> {
    if tracker_peers.len() % PEER_SIZE != 0 {
        return Err(LeechError::Tracker(format!(
            "compact peer list of {} bytes is not a multiple of {}",
            tracker_peers.len(),
            PEER_SIZE
        ))
        .into());
    }

    let mut peers = Vec::with_capacity(tracker_peers.len() / PEER_SIZE);
    let mut cursor = Cursor::new(tracker_peers);

    for i in 0..tracker_peers.len() / PEER_SIZE {
        let ip = Ipv4Addr::from(cursor.read_u32::<BigEndian>()?);
        let port = cursor.read_u16::<BigEndian>()?;
        peers.push(Peer::new(i as PeerId, ip, port));
    }

    Ok(peers)
}
