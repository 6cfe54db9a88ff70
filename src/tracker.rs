//! # Tracker Client
//!
//! Turns the announce URLs of a torrent into a list of candidate peers, then
//! connects to the first reachable one.
//!
//! ## HTTP Trackers
//!
//! A GET request carries the torrent and client state as query parameters:
//!
//! ```text
//! <announce>?info_hash=%xx..&peer_id=%xx..&port=6881&uploaded=0&downloaded=0&left=<length>&compact=1
//! ```
//!
//! The bencoded reply holds either a `failure reason` or the `peers`, usually in
//! the compact format. The older list-of-dictionaries format is accepted too.
//!
//! ## UDP Trackers
//!
//! ```text
//! connect  -> protocol id (u64) | action 0 (u32) | transaction id (u32)
//! connect  <- action (u32) | transaction id (u32) | connection id (u64)
//! announce -> connection id | action 1 | transaction id | info hash | peer id
//!             | downloaded (u64) | left (u64) | uploaded (u64) | event (u32)
//!             | ip (u32) | key (u32) | num want (i32) | port (u16) | extensions (u16)
//! announce <- action | transaction id | interval | leechers | seeders | peers...
//! ```
//!
//! The transaction id of every reply must match the one sent, whatever the
//! action field says. A reply with action 3 carries an error message.

use crate::config::Config;
use crate::error::LeechError;
use crate::peer::*;
use crate::torrent::TorrentMetadata;

use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use url::Url;

use std::io::Cursor;
use std::net::{Ipv4Addr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECT_RESPONSE_SIZE: usize = 16;
const ANNOUNCE_HEADER_SIZE: usize = 20;
const UDP_PACKET_MAX: usize = 2048;

/// BencodeTracker structure.
#[derive(Debug, Deserialize)]
struct BencodeTracker {
    // Human readable error, no other key is meaningful when present
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    // Non fatal message from the tracker
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    // Interval time to refresh the list of peers in seconds
    interval: Option<u32>,
    // Peers, compact string or list of dictionaries
    peers: Option<Value>,
}

fn tracker_error(message: impl Into<String>) -> anyhow::Error {
    LeechError::Tracker(message.into()).into()
}

/// Request peers, trying each tracker of the torrent in order.
///
/// The first tracker returning at least one peer wins. When every tracker
/// fails, the last error is returned.
pub fn request_peers(torrent: &TorrentMetadata, config: &Config) -> Result<Vec<Peer>> {
    let mut last_error = None;

    for url in torrent.trackers() {
        match announce(url, torrent, config) {
            Ok(peers) if !peers.is_empty() => {
                info!("Tracker {} returned {} peers", url, peers.len());
                return Ok(peers);
            }
            Ok(_) => {
                warn!("Tracker {} returned no peers", url);
                last_error = Some(tracker_error(format!("tracker {} returned no peers", url)));
            }
            Err(e) => {
                warn!("Tracker {} failed: {:#}", url, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| tracker_error("no tracker URLs available")))
}

/// Announce to one tracker, selecting the protocol from the URL scheme.
pub fn announce(announce: &str, torrent: &TorrentMetadata, config: &Config) -> Result<Vec<Peer>> {
    let url = Url::parse(announce)
        .map_err(|e| tracker_error(format!("could not parse tracker url '{}': {}", announce, e)))?;

    match url.scheme() {
        "http" | "https" => announce_http(&url, torrent, config),
        "udp" => announce_udp(&url, torrent, config),
        scheme => Err(tracker_error(format!("unsupported tracker scheme '{}'", scheme))),
    }
}

/// Each byte is encoded as %xx where xx is its lowercase hexadecimal value.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789abcdef";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}

/// Build the HTTP announce URL.
pub fn build_tracker_url(
    base_url: &Url,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    length: u64,
) -> String {
    // Build query string manually to handle binary data properly
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        length
    );

    let mut url = base_url.to_string();
    if base_url.query().is_some() {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    url
}

fn announce_http(base_url: &Url, torrent: &TorrentMetadata, config: &Config) -> Result<Vec<Peer>> {
    let full_url = build_tracker_url(
        base_url,
        torrent.info_hash(),
        &config.peer_id,
        config.port,
        torrent.length(),
    );
    debug!("Announce to {}", full_url);

    let client = reqwest::blocking::Client::builder()
        .timeout(config.http_timeout)
        .build()?;

    let response = client
        .get(&full_url)
        .send()
        .map_err(|e| tracker_error(format!("could not reach tracker {}: {}", base_url, e)))?;
    let status = response.status();
    let body = response
        .bytes()
        .map_err(|e| tracker_error(format!("could not read tracker response: {}", e)))?;
    debug!("Tracker replied {} with {} bytes", status, body.len());

    parse_http_response(&body)
}

/// Parse the bencoded reply of an HTTP tracker.
pub fn parse_http_response(buf: &[u8]) -> Result<Vec<Peer>> {
    let tracker = de::from_bytes::<BencodeTracker>(buf)
        .map_err(|e| tracker_error(format!("could not decode tracker response: {}", e)))?;

    if let Some(reason) = tracker.failure_reason {
        return Err(tracker_error(format!("tracker failure: {}", reason)));
    }
    if let Some(warning) = tracker.warning_message {
        warn!("Tracker warning: {}", warning);
    }
    if let Some(interval) = tracker.interval {
        debug!("Tracker interval is {}s", interval);
    }

    match tracker.peers {
        Some(Value::Bytes(peers)) => parse_compact_peers(&peers),
        Some(Value::List(entries)) => Ok(parse_dictionary_peers(&entries)),
        Some(_) => Err(tracker_error("peers has an unexpected type")),
        None => Err(tracker_error("tracker response has no peers")),
    }
}

/// Parse the non-compact peer model, skipping entries without an IPv4 address.
fn parse_dictionary_peers(entries: &[Value]) -> Vec<Peer> {
    let mut peers = Vec::new();

    for entry in entries {
        let dict = match entry {
            Value::Dict(dict) => dict,
            _ => continue,
        };
        let ip = match dict.get(b"ip".as_slice()) {
            Some(Value::Bytes(ip)) => String::from_utf8_lossy(ip).parse::<Ipv4Addr>().ok(),
            _ => None,
        };
        let port = match dict.get(b"port".as_slice()) {
            Some(Value::Int(port)) => u16::try_from(*port).ok(),
            _ => None,
        };

        match (ip, port) {
            (Some(ip), Some(port)) => peers.push(Peer::new(peers.len() as u32, ip, port)),
            _ => debug!("Skip unsupported peer entry {:?}", entry),
        }
    }

    peers
}

/// Build a UDP connect request.
pub fn build_connect_request(transaction_id: u32) -> Result<Vec<u8>> {
    let mut request = Vec::with_capacity(16);
    request.write_u64::<BigEndian>(PROTOCOL_ID)?;
    request.write_u32::<BigEndian>(ACTION_CONNECT)?;
    request.write_u32::<BigEndian>(transaction_id)?;

    Ok(request)
}

/// Read the action and transaction id heading every UDP tracker reply.
///
/// The transaction id is checked first and regardless of the action.
fn parse_udp_header(buf: &[u8], transaction_id: u32, expected_action: u32) -> Result<()> {
    if buf.len() < 8 {
        return Err(tracker_error(format!("udp response of {} bytes is too short", buf.len())));
    }

    let mut cursor = Cursor::new(buf);
    let action = cursor.read_u32::<BigEndian>()?;
    let resp_tid = cursor.read_u32::<BigEndian>()?;

    if resp_tid != transaction_id {
        return Err(tracker_error(format!(
            "udp response transaction id {:#x} does not match {:#x}",
            resp_tid, transaction_id
        )));
    }
    if action == ACTION_ERROR {
        return Err(tracker_error(format!(
            "tracker failure: {}",
            String::from_utf8_lossy(&buf[8..])
        )));
    }
    if action != expected_action {
        return Err(tracker_error(format!(
            "udp response action {} instead of {}",
            action, expected_action
        )));
    }

    Ok(())
}

/// Parse a UDP connect reply and return the connection id.
pub fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64> {
    parse_udp_header(buf, transaction_id, ACTION_CONNECT)?;

    if buf.len() < CONNECT_RESPONSE_SIZE {
        return Err(tracker_error(format!("connect response of {} bytes is too short", buf.len())));
    }

    Ok(Cursor::new(&buf[8..16]).read_u64::<BigEndian>()?)
}

/// Build a UDP announce request.
pub fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    left: u64,
    key: u32,
    port: u16,
) -> Result<Vec<u8>> {
    let mut request = Vec::with_capacity(98);
    request.write_u64::<BigEndian>(connection_id)?;
    request.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    request.write_u32::<BigEndian>(transaction_id)?;
    request.extend_from_slice(info_hash);
    request.extend_from_slice(peer_id);
    // downloaded
    request.write_u64::<BigEndian>(0)?;
    request.write_u64::<BigEndian>(left)?;
    // uploaded
    request.write_u64::<BigEndian>(0)?;
    // event: none
    request.write_u32::<BigEndian>(0)?;
    // ip: sender address
    request.write_u32::<BigEndian>(0)?;
    request.write_u32::<BigEndian>(key)?;
    // num_want: tracker default
    request.write_i32::<BigEndian>(-1)?;
    request.write_u16::<BigEndian>(port)?;
    // extensions
    request.write_u16::<BigEndian>(0)?;

    Ok(request)
}

/// Parse a UDP announce reply into peers.
pub fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<Vec<Peer>> {
    parse_udp_header(buf, transaction_id, ACTION_ANNOUNCE)?;

    if buf.len() < ANNOUNCE_HEADER_SIZE {
        return Err(tracker_error(format!("announce response of {} bytes is too short", buf.len())));
    }

    let mut cursor = Cursor::new(&buf[8..ANNOUNCE_HEADER_SIZE]);
    let interval = cursor.read_i32::<BigEndian>()?;
    let leechers = cursor.read_i32::<BigEndian>()?;
    let seeders = cursor.read_i32::<BigEndian>()?;
    debug!(
        "Tracker interval is {}s, {} leechers, {} seeders",
        interval, leechers, seeders
    );

    let nb_peers = (buf.len() - ANNOUNCE_HEADER_SIZE) / PEER_SIZE;
    parse_compact_peers(&buf[ANNOUNCE_HEADER_SIZE..ANNOUNCE_HEADER_SIZE + nb_peers * PEER_SIZE])
}

fn announce_udp(url: &Url, torrent: &TorrentMetadata, config: &Config) -> Result<Vec<Peer>> {
    let host = url
        .host_str()
        .ok_or_else(|| tracker_error(format!("tracker url '{}' has no host", url)))?;
    let port = url
        .port()
        .ok_or_else(|| tracker_error(format!("tracker url '{}' has no port", url)))?;
    let addr = (host, port)
        .to_socket_addrs()?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| tracker_error(format!("could not resolve tracker '{}'", host)))?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(addr)?;
    socket.set_read_timeout(Some(config.udp_timeout))?;

    let transaction_id = config.transaction_id;
    let mut buf = [0u8; UDP_PACKET_MAX];

    socket.send(&build_connect_request(transaction_id)?)?;
    let len = recv(&socket, &mut buf, config.udp_timeout)?;
    let connection_id = parse_connect_response(&buf[..len], transaction_id)?;
    debug!("Connected to tracker {} with connection id {:#x}", addr, connection_id);

    let key: u32 = rand::thread_rng().gen();
    let request = build_announce_request(
        connection_id,
        transaction_id,
        torrent.info_hash(),
        &config.peer_id,
        torrent.length(),
        key,
        config.port,
    )?;
    socket.send(&request)?;
    let len = recv(&socket, &mut buf, config.udp_timeout)?;

    parse_announce_response(&buf[..len], transaction_id)
}

fn recv(socket: &UdpSocket, buf: &mut [u8], timeout: Duration) -> Result<usize> {
    socket.recv(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            tracker_error(format!("no reply from tracker within {:?}", timeout))
        }
        _ => e.into(),
    })
}

/// Connect to the first reachable peer, in the tracker's order.
pub fn connect_first(peers: &[Peer], timeout: Duration) -> Result<(Peer, TcpStream)> {
    for peer in peers {
        match TcpStream::connect_timeout(&peer.socket_addr(), timeout) {
            Ok(conn) => {
                info!("Connected to peer {}", peer);
                return Ok((peer.clone(), conn));
            }
            Err(e) => debug!("Could not connect to peer {}: {}", peer, e),
        }
    }

    Err(LeechError::Connect(format!("none of {} candidates answered", peers.len())).into())
}
