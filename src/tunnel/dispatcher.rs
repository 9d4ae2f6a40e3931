//! Frame dispatcher
//!
//! Owns the transport and the tunnel table, runs the single demultiplex
//! loop, and hands out tunnels via `open_tunnel` (locally initiated) and
//! `accept_tunnel` (peer initiated). A peer-initiated tunnel announces
//! itself with its first frame, which must parse as a SOCKS5 method
//! request; there is no separate SYN frame.

use super::{
    Frame, Transport, Tunnel, TunnelError, ACCEPT_QUEUE_DEPTH, READ_QUEUE_DEPTH,
};
use crate::carrier::MessageCarrier;
use crate::socks::MethodRequest;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct TableEntry {
    /// Producer end of the tunnel's inbound queue. Dropping it is how the
    /// dispatcher signals end-of-stream to a blocked reader.
    tx: mpsc::Sender<Frame>,
    tunnel: Arc<Tunnel>,
}

#[derive(Default)]
struct Table {
    tunnels: HashMap<u16, TableEntry>,
    /// Allocation hint; wraps modulo 2^16.
    next_id: u16,
}

pub(crate) struct DispatcherShared {
    transport: Transport,
    table: RwLock<Table>,
    accept_tx: mpsc::Sender<Arc<Tunnel>>,
    accept_rx: Mutex<mpsc::Receiver<Arc<Tunnel>>>,
    alive: AtomicBool,
    shutdown: CancellationToken,
}

impl DispatcherShared {
    pub(crate) async fn write_frame(&self, frame: &Frame) -> Result<(), TunnelError> {
        self.transport.write(frame).await
    }

    /// Drop the table entry for `id`. No frame is emitted here; the tunnel
    /// itself sends FIN before calling this.
    pub(crate) async fn remove_tunnel(&self, id: u16) {
        self.table.write().await.tunnels.remove(&id);
    }

    /// One-shot teardown: flips `alive`, wakes blocked acceptors, drops
    /// every tunnel's queue sender (readers see end-of-stream), and closes
    /// the carrier.
    async fn close(&self) {
        if self
            .alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Senders drop before any cancellation fires, so a blocked reader
        // resolves to end-of-stream rather than a cancelled error.
        self.table.write().await.tunnels.clear();
        self.shutdown.cancel();
        self.transport.close().await;
    }
}

/// Demultiplexes carrier frames onto per-tunnel queues.
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    /// Build a dispatcher over `carrier` and start its demultiplex loop.
    /// Must be called from within a tokio runtime.
    pub fn new(carrier: Arc<dyn MessageCarrier>) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let shared = Arc::new(DispatcherShared {
            transport: Transport::new(carrier),
            table: RwLock::new(Table::default()),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            alive: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run(Arc::clone(&shared)));

        Self { shared }
    }

    /// Whether the demultiplex loop is still running. A dead dispatcher
    /// never recovers; callers build a fresh one.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Allocate an id and register a new locally initiated tunnel. Scans at
    /// most 2^16 candidates from the allocation hint; fails only when every
    /// id is live. `cancel` aborts this tunnel's future blocking reads.
    pub async fn open_tunnel(&self, cancel: CancellationToken) -> Result<Arc<Tunnel>, TunnelError> {
        let mut table = self.shared.table.write().await;
        for _ in 0..=u16::MAX as u32 {
            let id = table.next_id;
            table.next_id = table.next_id.wrapping_add(1);
            if table.tunnels.contains_key(&id) {
                continue;
            }
            let (tunnel, _) = insert_tunnel(&mut table, &self.shared, id, cancel);
            debug!("opened tunnel {}", id);
            return Ok(tunnel);
        }
        Err(TunnelError::NoAvailableId)
    }

    /// Wait for the next peer-initiated tunnel. Fails immediately once the
    /// dispatcher is closed or the carrier died.
    pub async fn accept_tunnel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        if !self.is_alive() {
            return Err(TunnelError::Shutdown);
        }
        let mut accept_rx = self.shared.accept_rx.lock().await;
        tokio::select! {
            tunnel = accept_rx.recv() => tunnel.ok_or(TunnelError::Shutdown),
            _ = self.shared.shutdown.cancelled() => Err(TunnelError::Shutdown),
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        }
    }

    /// Look up a live tunnel by id.
    pub async fn get_tunnel(&self, id: u16) -> Option<Arc<Tunnel>> {
        self.shared
            .table
            .read()
            .await
            .tunnels
            .get(&id)
            .map(|entry| Arc::clone(&entry.tunnel))
    }

    /// Close the dispatcher: stops the loop via carrier close, releases all
    /// blocked acceptors and readers. Idempotent.
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

fn insert_tunnel(
    table: &mut Table,
    shared: &Arc<DispatcherShared>,
    id: u16,
    cancel: CancellationToken,
) -> (Arc<Tunnel>, mpsc::Sender<Frame>) {
    let (tx, rx) = mpsc::channel(READ_QUEUE_DEPTH);
    let tunnel = Arc::new(Tunnel::new(id, Arc::downgrade(shared), rx, cancel));
    table.tunnels.insert(
        id,
        TableEntry {
            tx: tx.clone(),
            tunnel: Arc::clone(&tunnel),
        },
    );
    (tunnel, tx)
}

/// The demultiplex loop: sole producer for every tunnel's read queue and
/// for the accept queue. Exits on carrier failure and tears the dispatcher
/// down behind itself.
async fn run(shared: Arc<DispatcherShared>) {
    loop {
        let frame = match shared.transport.read().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dispatch read failed: {}", e);
                break;
            }
        };

        let sender = shared
            .table
            .read()
            .await
            .tunnels
            .get(&frame.id)
            .map(|entry| entry.tx.clone());

        match sender {
            Some(tx) => {
                // Blocks when the queue is full: back-pressure is applied
                // to the whole carrier, not per tunnel.
                let _ = tx.send(frame).await;
            }
            None if frame.is_fin() => {
                debug!("late FIN for forgotten tunnel {}", frame.id);
            }
            None => accept_frame(&shared, frame).await,
        }
    }

    shared.close().await;
}

/// First frame on an unknown id: it must be a well-formed SOCKS5 method
/// selection, which doubles as the open signal. Anything else is dropped.
async fn accept_frame(shared: &Arc<DispatcherShared>, frame: Frame) {
    match MethodRequest::parse(&frame.data) {
        Ok(request) if frame.data.len() == 2 + request.nmethods as usize => {
            let id = frame.id;
            // Accepted tunnels get a standalone token: dispatcher teardown
            // reaches their readers as sender drop (end-of-stream), never
            // as a cancelled error.
            let (tunnel, tx) = {
                let mut table = shared.table.write().await;
                insert_tunnel(&mut table, shared, id, CancellationToken::new())
            };
            // The method request stays on the queue for the server-side
            // handshake to consume.
            let _ = tx.send(frame).await;
            debug!("accepted tunnel {}", id);
            let _ = shared.accept_tx.send(tunnel).await;
        }
        Ok(request) => {
            warn!(
                "tunnel {} opening frame length {} does not match {} methods; dropped",
                frame.id,
                frame.data.len(),
                request.nmethods
            );
        }
        Err(e) => {
            warn!(
                "tunnel {} opening frame is not a method request: {}; dropped",
                frame.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::loopback_pair;
    use std::time::Duration;

    fn dispatcher_pair() -> (Dispatcher, Dispatcher) {
        let (a, b) = loopback_pair();
        (Dispatcher::new(Arc::new(a)), Dispatcher::new(Arc::new(b)))
    }

    #[tokio::test]
    async fn test_open_allocates_sequential_ids() {
        let (left, _right) = dispatcher_pair();

        let first = left.open_tunnel(CancellationToken::new()).await.unwrap();
        let second = left.open_tunnel(CancellationToken::new()).await.unwrap();

        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
        assert!(left.get_tunnel(0).await.is_some());
    }

    #[tokio::test]
    async fn test_close_removes_tunnel_and_frees_id() {
        let (left, _right) = dispatcher_pair();

        let tunnel = left.open_tunnel(CancellationToken::new()).await.unwrap();
        assert_eq!(tunnel.id(), 0);
        tunnel.close().await.unwrap();
        assert!(left.get_tunnel(0).await.is_none());

        // The hint has moved on, but id 0 is reusable once the hint wraps.
        let next = left.open_tunnel(CancellationToken::new()).await.unwrap();
        assert_eq!(next.id(), 1);
    }

    #[tokio::test]
    async fn test_accept_requires_method_request() {
        let (left, right) = dispatcher_pair();

        // A method request whose length disagrees with its nmethods field
        // must not produce a tunnel.
        let bogus = left.open_tunnel(CancellationToken::new()).await.unwrap();
        bogus.write(b"\x05\x02\x00").await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waiter.cancel();
        });
        assert!(matches!(
            right.accept_tunnel(&cancel).await,
            Err(TunnelError::Cancelled)
        ));

        // A well-formed method selection is accepted and kept readable.
        let good = left.open_tunnel(CancellationToken::new()).await.unwrap();
        good.write(b"\x05\x01\x00").await.unwrap();

        let accepted = right
            .accept_tunnel(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(accepted.id(), good.id());
        assert_eq!(accepted.read_whole().await.unwrap(), &b"\x05\x01\x00"[..]);
    }

    #[tokio::test]
    async fn test_dispatcher_close_gives_readers_eof() {
        let (left, right) = dispatcher_pair();

        let tunnel = left.open_tunnel(CancellationToken::new()).await.unwrap();
        tunnel.write(b"\x05\x01\x00").await.unwrap();
        let accepted = right
            .accept_tunnel(&CancellationToken::new())
            .await
            .unwrap();
        accepted.read_whole().await.unwrap();

        left.close().await;
        assert!(!left.is_alive());

        // Blocked reader on the closed side unblocks with end-of-stream,
        // not an error.
        let mut buf = [0u8; 16];
        assert_eq!(tunnel.read(&mut buf).await.unwrap(), 0);

        // Acceptors fail immediately from now on.
        assert!(matches!(
            left.accept_tunnel(&CancellationToken::new()).await,
            Err(TunnelError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_accepted_reader_gets_eof_on_dispatcher_close() {
        let (left, right) = dispatcher_pair();

        let tunnel = left.open_tunnel(CancellationToken::new()).await.unwrap();
        tunnel.write(b"\x05\x01\x00").await.unwrap();
        let accepted = right
            .accept_tunnel(&CancellationToken::new())
            .await
            .unwrap();
        accepted.read_whole().await.unwrap();

        // Reader blocked on the accepted side while its own dispatcher
        // tears down must observe end-of-stream, never a cancelled error.
        let reader = tokio::spawn({
            let accepted = Arc::clone(&accepted);
            async move {
                let mut buf = [0u8; 16];
                accepted.read(&mut buf).await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        right.close().await;

        let result = reader.await.unwrap();
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_carrier_death_flips_alive() {
        let (a, b) = loopback_pair();
        let left = Dispatcher::new(Arc::new(a));
        let right = Dispatcher::new(Arc::new(b));

        right.close().await;

        // The left loop notices the closed carrier and tears down.
        for _ in 0..50 {
            if !left.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatcher stayed alive after carrier close");
    }

    #[tokio::test]
    async fn test_empty_write_is_rejected() {
        let (left, _right) = dispatcher_pair();
        let tunnel = left.open_tunnel(CancellationToken::new()).await.unwrap();

        assert!(matches!(
            tunnel.write(b"").await,
            Err(TunnelError::EmptyWrite)
        ));
    }

    #[tokio::test]
    async fn test_oversize_write_splits_into_frames() {
        let (left, right) = dispatcher_pair();

        let tunnel = left.open_tunnel(CancellationToken::new()).await.unwrap();
        tunnel.write(b"\x05\x01\x00").await.unwrap();
        let accepted = right
            .accept_tunnel(&CancellationToken::new())
            .await
            .unwrap();
        accepted.read_whole().await.unwrap();

        let big = vec![0x5A; super::super::MAX_FRAME_PAYLOAD + 1000];
        let written = tunnel.write(&big).await.unwrap();
        assert_eq!(written, big.len());

        let first = accepted.read_whole().await.unwrap();
        let second = accepted.read_whole().await.unwrap();
        assert_eq!(first.len(), super::super::MAX_FRAME_PAYLOAD);
        assert_eq!(second.len(), 1000);

        let mut joined = first.to_vec();
        joined.extend_from_slice(&second);
        assert_eq!(joined, big);
    }
}
