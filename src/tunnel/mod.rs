//! Tunnel layer - stream multiplexing over a message carrier
//!
//! Provides:
//! - Frame encoding/decoding (4-byte header + payload)
//! - Framed transport over a [`MessageCarrier`](crate::carrier::MessageCarrier)
//! - Per-tunnel ordered byte streams with close/EOF semantics
//! - The dispatcher that demultiplexes frames and manages tunnel lifecycle

mod dispatcher;
mod frame;
mod stream;
mod transport;

pub use dispatcher::Dispatcher;
pub use frame::{Frame, FRAME_HEADER_LEN};
pub use stream::Tunnel;
pub use transport::Transport;

use crate::carrier::CarrierError;
use thiserror::Error;

/// Largest payload one frame can carry; the length field is a u16.
pub const MAX_FRAME_PAYLOAD: usize = 65535;

/// Capacity of each tunnel's inbound frame queue.
pub const READ_QUEUE_DEPTH: usize = 64;

/// Capacity of the dispatcher's queue of peer-initiated tunnels.
pub const ACCEPT_QUEUE_DEPTH: usize = 64;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("carrier failed: {0}")]
    Carrier(#[from] CarrierError),

    #[error("carrier closed mid-frame")]
    DecodeShort,

    #[error("no available tunnel id")]
    NoAvailableId,

    #[error("tunnel closed")]
    Closed,

    #[error("end of stream")]
    Eof,

    #[error("dispatcher shut down")]
    Shutdown,

    #[error("operation cancelled")]
    Cancelled,

    #[error("zero-length writes are reserved")]
    EmptyWrite,
}
