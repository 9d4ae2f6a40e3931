//! Proxy layer
//!
//! Ties the tunnel core to real sockets: the phase-tagged SOCKS5 handshake
//! drivers, the bidirectional pipe, the local client proxy and the remote
//! server loop.

mod client;
mod handshake;
mod pipe;
mod server;

pub use client::ClientProxy;
pub use handshake::{client_handshake, server_handshake, HandshakeError, Phase};
pub use pipe::{Peer, Pipe};
pub use server::{serve_dispatcher, Server, TlsIdentity};

/// How many dispatcher rebuild failures retry without delay.
pub(crate) const REBUILD_FREE_RETRIES: u32 = 3;

/// Sleep before each rebuild attempt past the free retries.
pub(crate) const REBUILD_BACKOFF: std::time::Duration = std::time::Duration::from_secs(8);
