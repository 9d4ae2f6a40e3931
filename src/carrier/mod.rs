//! Message carriers - the underlying link the multiplexer runs on
//!
//! A carrier delivers opaque byte messages in FIFO order and accepts them
//! for transmission. The reference carrier is a WebSocket (one binary frame
//! per message); an in-memory loopback pair is provided for tests. A carrier
//! MAY coalesce messages on the read side but MUST NOT split one.

mod loopback;
mod websocket;

pub use loopback::{loopback_pair, LoopbackCarrier};
pub use websocket::{WsCarrier, WsConnector};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Request header carrying the shared secret on carrier dial.
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Carrier layer errors
#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("carrier closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect failed: {0}")]
    Connect(String),
}

/// An ordered, reliable, message-oriented bidirectional link.
///
/// Implementations serialize concurrent `write_message` calls internally;
/// the dispatcher and every tunnel share one carrier. Reads are serial by
/// contract - only the dispatcher's demultiplex loop reads.
#[async_trait]
pub trait MessageCarrier: Send + Sync {
    /// Return the next whole message, blocking until one is available.
    async fn read_message(&self) -> Result<Bytes, CarrierError>;

    /// Deliver `msg` as one whole message.
    async fn write_message(&self, msg: Bytes) -> Result<(), CarrierError>;

    /// Close the carrier. Idempotent; unblocks a pending reader.
    async fn close(&self) -> Result<(), CarrierError>;
}

/// Factory for carriers, used by the client to rebuild its link after the
/// dispatcher dies.
#[async_trait]
pub trait CarrierConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MessageCarrier>, CarrierError>;
}
