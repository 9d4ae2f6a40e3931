//! Bidirectional byte pump between a tunnel and a peer socket
//!
//! Each pipe spawns two copy tasks, one per direction. A direction that
//! ends closes the tunnel on its way out, which makes the other direction
//! fail its next read or write and exit too. The tunnel's close is
//! idempotent, so the pipe never emits a second FIN no matter which side
//! finishes first. Tasks are never aborted: a carrier write in flight
//! always completes, keeping the shared sink framing intact.

use crate::tunnel::Tunnel;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

/// Uplink read buffer; tunnel writes split larger chunks themselves.
const COPY_BUF: usize = 32 * 1024;

/// The socket-side endpoint of a pipe.
pub enum Peer {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

pub struct Pipe {
    tunnel: Arc<Tunnel>,
    peer: Peer,
}

impl Pipe {
    pub fn new(tunnel: Arc<Tunnel>, peer: Peer) -> Self {
        Self { tunnel, peer }
    }

    /// Spawn both copy directions and return once either finishes. The
    /// surviving task winds down on its own: the tunnel is closed here,
    /// so its next tunnel operation fails.
    pub async fn run(self) {
        let Pipe { tunnel, peer } = self;

        let (uplink, downlink) = match peer {
            Peer::Tcp(stream) => {
                let (rd, wr) = stream.into_split();
                (
                    tokio::spawn(tcp_uplink(Arc::clone(&tunnel), rd)),
                    tokio::spawn(tcp_downlink(Arc::clone(&tunnel), wr)),
                )
            }
            Peer::Udp(socket) => {
                let socket = Arc::new(socket);
                (
                    tokio::spawn(udp_uplink(Arc::clone(&tunnel), Arc::clone(&socket))),
                    tokio::spawn(udp_downlink(Arc::clone(&tunnel), socket)),
                )
            }
        };

        tokio::select! {
            _ = uplink => {}
            _ = downlink => {}
        }

        let _ = tunnel.close().await;
        trace!("pipe for tunnel {} finished", tunnel.id());
    }
}

async fn tcp_uplink(tunnel: Arc<Tunnel>, mut rd: OwnedReadHalf) {
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if tunnel.write(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = tunnel.close().await;
}

async fn tcp_downlink(tunnel: Arc<Tunnel>, mut wr: OwnedWriteHalf) {
    loop {
        let data = match tunnel.read_whole().await {
            Ok(data) => data,
            Err(_) => break,
        };
        if wr.write_all(&data).await.is_err() {
            break;
        }
    }
    let _ = wr.shutdown().await;
    let _ = tunnel.close().await;
}

/// UDP relay keeps datagram boundaries: one datagram in, one frame out.
async fn udp_uplink(tunnel: Arc<Tunnel>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; crate::tunnel::MAX_FRAME_PAYLOAD];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if tunnel.write(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = tunnel.close().await;
}

/// Each inbound frame becomes exactly one datagram.
async fn udp_downlink(tunnel: Arc<Tunnel>, socket: Arc<UdpSocket>) {
    loop {
        let data = match tunnel.read_whole().await {
            Ok(data) => data,
            Err(_) => break,
        };
        if socket.send(&data).await.is_err() {
            break;
        }
    }
    let _ = tunnel.close().await;
}
