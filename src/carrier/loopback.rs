//! In-memory carrier for tests
//!
//! A pair of bounded queues wired back to back. Each end behaves like one
//! side of a connected socket: messages written on one end come out of
//! `read_message` on the other, in order.

use super::{CarrierError, MessageCarrier};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const LOOPBACK_DEPTH: usize = 256;

/// One end of an in-memory carrier pair.
pub struct LoopbackCarrier {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
}

/// Create a connected pair of loopback carriers.
pub fn loopback_pair() -> (LoopbackCarrier, LoopbackCarrier) {
    let (a_tx, b_rx) = mpsc::channel(LOOPBACK_DEPTH);
    let (b_tx, a_rx) = mpsc::channel(LOOPBACK_DEPTH);
    let a = LoopbackCarrier {
        tx: Mutex::new(Some(a_tx)),
        rx: Mutex::new(a_rx),
        closed: CancellationToken::new(),
    };
    let b = LoopbackCarrier {
        tx: Mutex::new(Some(b_tx)),
        rx: Mutex::new(b_rx),
        closed: CancellationToken::new(),
    };
    (a, b)
}

#[async_trait]
impl MessageCarrier for LoopbackCarrier {
    async fn read_message(&self) -> Result<Bytes, CarrierError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg.ok_or(CarrierError::Closed),
            _ = self.closed.cancelled() => Err(CarrierError::Closed),
        }
    }

    async fn write_message(&self, msg: Bytes) -> Result<(), CarrierError> {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx.send(msg).await.map_err(|_| CarrierError::Closed),
            None => Err(CarrierError::Closed),
        }
    }

    async fn close(&self) -> Result<(), CarrierError> {
        // Dropping the sender gives the peer EOF; the token unblocks our
        // own pending reader.
        self.tx.lock().await.take();
        self.closed.cancel();
        Ok(())
    }
}
