//! Framed transport over a message carrier
//!
//! Turns the carrier's message stream into a frame stream. Carrier
//! messages may each hold one frame, several frames, or part of one; the
//! read buffer reassembles across message boundaries. Writes always emit
//! one frame as one carrier message.

use super::{Frame, TunnelError};
use crate::carrier::{CarrierError, MessageCarrier};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Transport {
    carrier: Arc<dyn MessageCarrier>,
    rbuf: Mutex<BytesMut>,
}

impl Transport {
    pub fn new(carrier: Arc<dyn MessageCarrier>) -> Self {
        Self {
            carrier,
            rbuf: Mutex::new(BytesMut::with_capacity(8 * 1024)),
        }
    }

    /// Read the next frame. Only one task reads at a time (the dispatcher's
    /// demultiplex loop); the buffer lock enforces that.
    pub async fn read(&self) -> Result<Frame, TunnelError> {
        let mut rbuf = self.rbuf.lock().await;
        loop {
            if let Some(frame) = Frame::decode(&mut rbuf) {
                return Ok(frame);
            }
            match self.carrier.read_message().await {
                Ok(msg) => rbuf.extend_from_slice(&msg),
                // A partial frame left behind means the peer violated the
                // framing protocol.
                Err(CarrierError::Closed) if !rbuf.is_empty() => {
                    return Err(TunnelError::DecodeShort)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write one frame as one atomic carrier message. May be called from
    /// any task; the carrier serializes concurrent writers.
    pub async fn write(&self, frame: &Frame) -> Result<(), TunnelError> {
        self.carrier.write_message(frame.encode()).await?;
        Ok(())
    }

    /// Close the carrier. Idempotent.
    pub async fn close(&self) {
        let _ = self.carrier.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::loopback_pair;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_frame_crosses_as_one_message() {
        let (a, b) = loopback_pair();
        let left = Transport::new(Arc::new(a));
        let right = Transport::new(Arc::new(b));

        let frame = Frame::new(3, Bytes::from_static(b"payload"));
        left.write(&frame).await.unwrap();

        assert_eq!(right.read().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_coalesced_messages_split_into_frames() {
        let (a, b) = loopback_pair();
        let right = Transport::new(Arc::new(b));

        // Two frames delivered in a single carrier message.
        let first = Frame::new(1, Bytes::from_static(b"one"));
        let second = Frame::fin(2);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&first.encode());
        wire.extend_from_slice(&second.encode());
        a.write_message(wire.freeze()).await.unwrap();

        assert_eq!(right.read().await.unwrap(), first);
        assert_eq!(right.read().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_short_tail_is_a_protocol_error() {
        let (a, b) = loopback_pair();
        let right = Transport::new(Arc::new(b));

        // Header promises 16 bytes but the carrier dies after 2.
        a.write_message(Bytes::from_static(&[0, 1, 0, 16, 0xAA, 0xBB]))
            .await
            .unwrap();
        a.close().await.unwrap();

        assert!(matches!(
            right.read().await,
            Err(TunnelError::DecodeShort)
        ));
    }
}
