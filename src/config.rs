//! # Client Configuration
//!
//! Process-wide values shared by the tracker client and the peer session.
//! They are gathered into a [`Config`] that is handed down explicitly, so the
//! protocol code never reads global state.

use std::time::Duration;

/// 20-byte identifier announced to trackers and peers.
pub const PEER_ID: [u8; 20] = *b"-LE0100-7f3c9a1d5e2b";

/// Port advertised to trackers. Nothing listens on it since the client never seeds.
pub const PORT: u16 = 6881;

/// Transaction id used for every UDP tracker exchange.
pub const TRANSACTION_ID: u32 = 0x6c65_6563;

/// Timeout of each TCP connect attempt while selecting a peer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout of the HTTP announce request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout of each UDP tracker receive.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct Config {
    /// Our peer id
    pub peer_id: [u8; 20],
    /// Port reported to the tracker
    pub port: u16,
    /// UDP tracker transaction id
    pub transaction_id: u32,
    /// Per-candidate TCP connect timeout
    pub connect_timeout: Duration,
    /// HTTP tracker request timeout
    pub http_timeout: Duration,
    /// UDP tracker receive timeout
    pub udp_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peer_id: PEER_ID,
            port: PORT,
            transaction_id: TRANSACTION_ID,
            connect_timeout: CONNECT_TIMEOUT,
            http_timeout: HTTP_TIMEOUT,
            udp_timeout: UDP_TIMEOUT,
        }
    }
}
