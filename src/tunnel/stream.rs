//! Per-tunnel byte stream
//!
//! A [`Tunnel`] is one logical ordered byte channel multiplexed onto the
//! shared carrier. The dispatcher's demultiplex loop is the only producer
//! on its inbound queue; the owning task is the only consumer. Reads drain
//! a residual buffer before touching the queue, writes fan out into frames,
//! and close emits exactly one FIN.

use super::dispatcher::DispatcherShared;
use super::{Frame, TunnelError, MAX_FRAME_PAYLOAD};
use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Reader-side state: the inbound frame queue plus payload bytes from the
/// most recent frame that a short read did not consume.
struct ReadHalf {
    rx: mpsc::Receiver<Frame>,
    residual: Bytes,
}

pub struct Tunnel {
    id: u16,
    dispatcher: Weak<DispatcherShared>,
    read: Mutex<ReadHalf>,
    eof: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Tunnel {
    pub(crate) fn new(
        id: u16,
        dispatcher: Weak<DispatcherShared>,
        rx: mpsc::Receiver<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            dispatcher,
            read: Mutex::new(ReadHalf {
                rx,
                residual: Bytes::new(),
            }),
            eof: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Read up to `buf.len()` bytes. Never blocks while residual bytes are
    /// available; otherwise waits for the next frame. Returns `Ok(0)` once
    /// the peer sent FIN, the tunnel was closed, or the dispatcher went
    /// away.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut read = self.read.lock().await;
        if !read.residual.is_empty() {
            let n = buf.len().min(read.residual.len());
            buf[..n].copy_from_slice(&read.residual[..n]);
            read.residual.advance(n);
            return Ok(n);
        }

        match self.next_frame(&mut read).await? {
            None => Ok(0),
            Some(data) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    read.residual = data.slice(n..);
                }
                Ok(n)
            }
        }
    }

    /// Read one whole message: all residual bytes if any, else the next
    /// frame's entire payload. The SOCKS5 handshake depends on these
    /// message-aligned boundaries.
    pub async fn read_whole(&self) -> Result<Bytes, TunnelError> {
        let mut read = self.read.lock().await;
        if !read.residual.is_empty() {
            return Ok(std::mem::take(&mut read.residual));
        }

        match self.next_frame(&mut read).await? {
            None => Err(TunnelError::Eof),
            Some(data) => Ok(data),
        }
    }

    /// Dequeue the next data payload; `None` means end-of-stream. A FIN
    /// frame and a dropped sender (tunnel removed from the dispatcher
    /// table) both latch `eof`.
    async fn next_frame(&self, read: &mut ReadHalf) -> Result<Option<Bytes>, TunnelError> {
        if self.eof.load(Ordering::Acquire) {
            return Ok(None);
        }

        let frame = tokio::select! {
            frame = read.rx.recv() => frame,
            _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled),
        };

        match frame {
            Some(frame) if !frame.is_fin() => Ok(Some(frame.data)),
            _ => {
                self.eof.store(true, Ordering::Release);
                Ok(None)
            }
        }
    }

    /// Write `buf` to the peer, splitting into frames as needed. Empty
    /// writes are rejected: on the wire they would read as FIN.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Closed);
        }
        if buf.is_empty() {
            return Err(TunnelError::EmptyWrite);
        }

        let dispatcher = self.dispatcher.upgrade().ok_or(TunnelError::Shutdown)?;
        for chunk in buf.chunks(MAX_FRAME_PAYLOAD) {
            let frame = Frame::new(self.id, Bytes::copy_from_slice(chunk));
            dispatcher.write_frame(&frame).await?;
        }
        Ok(buf.len())
    }

    /// Close the tunnel. The first call emits one FIN frame and removes
    /// the tunnel from the dispatcher's table, which also wakes a pending
    /// reader with end-of-stream; later calls are no-ops.
    pub async fn close(&self) -> Result<(), TunnelError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.eof.store(true, Ordering::Release);

        if let Some(dispatcher) = self.dispatcher.upgrade() {
            // FIN goes out before the table entry disappears, so the peer
            // sees it as the last frame for this id.
            let sent = dispatcher.write_frame(&Frame::fin(self.id)).await;
            dispatcher.remove_tunnel(self.id).await;
            sent?;
        }
        Ok(())
    }
}
