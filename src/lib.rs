//! # muxsocks
//!
//! A SOCKS5 proxy whose client-to-server leg rides a single long-lived
//! WebSocket connection. Many independent SOCKS5 sessions share the one
//! link by being multiplexed into logical tunnels identified by a 16-bit
//! id; the server end demultiplexes, performs the SOCKS5 handshake against
//! the real destination on behalf of each tunnel, and shuttles bytes
//! between tunnel and destination.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Proxy Layer                      │
//! │   (SOCKS5 handshake drivers, bidirectional pipe)    │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                      │
//! │  (frame codec, dispatcher, per-tunnel byte streams) │
//! ├─────────────────────────────────────────────────────┤
//! │                   Carrier Layer                     │
//! │     (WebSocket or in-memory message transport)      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The tunnel layer only assumes a [`carrier::MessageCarrier`]: an ordered,
//! reliable, message-oriented link. Everything above it is carrier-agnostic.

pub mod carrier;
pub mod proxy;
pub mod socks;
pub mod tunnel;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("carrier error: {0}")]
    Carrier(#[from] carrier::CarrierError),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("SOCKS5 error: {0}")]
    Socks(#[from] socks::SocksError),

    #[error("handshake error: {0}")]
    Handshake(#[from] proxy::HandshakeError),

    #[error("configuration error: {0}")]
    Config(String),
}
