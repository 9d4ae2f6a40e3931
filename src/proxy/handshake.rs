//! SOCKS5 handshake drivers
//!
//! Two state machines, each run once per tunnel. The client driver speaks
//! SOCKS5 with a local application on one side and relays the negotiation
//! over a freshly opened tunnel on the other; the server driver answers
//! the negotiation coming out of a tunnel and dials the real destination.
//! Every failure is tagged with the phase it happened in, which is the
//! error taxonomy operators see in logs.

use crate::socks::{
    Message, MethodReply, MethodRequest, Request, SocksError, CMD_UDP_ASSOCIATE,
    REP_CONNECTION_REFUSED, REP_NETWORK_UNREACHABLE, REP_SUCCEEDED,
};
use crate::tunnel::{Dispatcher, Tunnel, TunnelError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pipe::Peer;

/// Handshake buffer size; SOCKS5 negotiation messages are far smaller.
const HANDSHAKE_BUF: usize = 1024;

/// A named step of the handshake, used as the error tag for failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ReadMethodRequest,
    ParseMethodRequest,
    WriteMethodReply,
    ReadRequest,
    ParseRequest,
    WriteMethodRequest,
    ReadMethodReply,
    ParseMethodReply,
    WriteRequest,
    ReadReply,
    ParseReply,
    WriteReply,
    Dial,
    FailureReply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::ReadMethodRequest => "read-method-request",
            Phase::ParseMethodRequest => "parse-method-request",
            Phase::WriteMethodReply => "write-method-reply",
            Phase::ReadRequest => "read-request",
            Phase::ParseRequest => "parse-request",
            Phase::WriteMethodRequest => "write-method-request",
            Phase::ReadMethodReply => "read-method-reply",
            Phase::ParseMethodReply => "parse-method-reply",
            Phase::WriteRequest => "write-request",
            Phase::ReadReply => "read-reply",
            Phase::ParseReply => "parse-reply",
            Phase::WriteReply => "write-reply",
            Phase::Dial => "dial",
            Phase::FailureReply => "failure-reply",
        };
        f.write_str(name)
    }
}

/// What went wrong inside a phase.
#[derive(Debug, Error)]
pub enum HandshakeFailure {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Tunnel(#[from] TunnelError),

    #[error("{0}")]
    Socks(#[from] SocksError),

    #[error("peer replied with code {0:#04x}")]
    Refused(u8),
}

#[derive(Debug, Error)]
#[error("handshake failed at phase {phase}: {source}")]
pub struct HandshakeError {
    pub phase: Phase,
    #[source]
    source: HandshakeFailure,
}

impl HandshakeError {
    fn new(phase: Phase, source: impl Into<HandshakeFailure>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }
}

/// Write a failure/success reply without masking the error being handled.
async fn send_reply(conn: &mut TcpStream, req: Option<&Request>, rep: u8) {
    let _ = conn.write_all(&Message::reply_to(req, rep).encode()).await;
}

/// Client side: negotiate with the local application on `conn`, open a
/// tunnel on `dispatcher`, and relay the negotiation to the server.
/// On success the tunnel carries an established session; on failure an
/// already-opened tunnel is closed (emitting FIN) before returning.
pub async fn client_handshake(
    conn: &mut TcpStream,
    dispatcher: &Dispatcher,
    cancel: CancellationToken,
) -> Result<Arc<Tunnel>, HandshakeError> {
    let mut buf = [0u8; HANDSHAKE_BUF];

    let n = conn
        .read(&mut buf)
        .await
        .map_err(|e| HandshakeError::new(Phase::ReadMethodRequest, e))?;
    MethodRequest::parse(&buf[..n])
        .map_err(|e| HandshakeError::new(Phase::ParseMethodRequest, e))?;

    conn.write_all(&MethodReply::noauth().encode())
        .await
        .map_err(|e| HandshakeError::new(Phase::WriteMethodReply, e))?;

    let n = conn
        .read(&mut buf)
        .await
        .map_err(|e| HandshakeError::new(Phase::ReadRequest, e))?;
    let req = match Message::parse(&buf[..n]) {
        Ok(req) => req,
        Err(e) => {
            send_reply(conn, None, REP_CONNECTION_REFUSED).await;
            return Err(HandshakeError::new(Phase::ParseRequest, e));
        }
    };

    debug!("client - tunneling to {}", req.address());

    let tunnel = match dispatcher.open_tunnel(cancel).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            send_reply(conn, Some(&req), REP_CONNECTION_REFUSED).await;
            return Err(HandshakeError::new(Phase::Init, e));
        }
    };

    match relay_negotiation(conn, &tunnel, &req).await {
        Ok(()) => Ok(tunnel),
        Err(e) => {
            let _ = tunnel.close().await;
            Err(e)
        }
    }
}

/// Steps 4-7 of the client handshake: everything after the tunnel exists.
/// Each failure refuses the local application before propagating.
async fn relay_negotiation(
    conn: &mut TcpStream,
    tunnel: &Tunnel,
    req: &Request,
) -> Result<(), HandshakeError> {
    let result = negotiate_over_tunnel(conn, tunnel, req).await;
    if let Err(e) = &result {
        match e.phase {
            // The local application already got its reply bytes.
            Phase::WriteReply | Phase::FailureReply => {}
            _ => send_reply(conn, Some(req), REP_CONNECTION_REFUSED).await,
        }
    }
    result
}

async fn negotiate_over_tunnel(
    conn: &mut TcpStream,
    tunnel: &Tunnel,
    req: &Request,
) -> Result<(), HandshakeError> {
    tunnel
        .write(&MethodRequest::noauth().encode())
        .await
        .map_err(|e| HandshakeError::new(Phase::WriteMethodRequest, e))?;

    let data = tunnel
        .read_whole()
        .await
        .map_err(|e| HandshakeError::new(Phase::ReadMethodReply, e))?;
    MethodReply::parse(&data).map_err(|e| HandshakeError::new(Phase::ParseMethodReply, e))?;

    tunnel
        .write(&req.encode())
        .await
        .map_err(|e| HandshakeError::new(Phase::WriteRequest, e))?;

    let data = tunnel
        .read_whole()
        .await
        .map_err(|e| HandshakeError::new(Phase::ReadReply, e))?;
    let reply = Message::parse(&data).map_err(|e| HandshakeError::new(Phase::ParseReply, e))?;

    // The server's reply bytes are forwarded verbatim.
    conn.write_all(&data)
        .await
        .map_err(|e| HandshakeError::new(Phase::WriteReply, e))?;

    if reply.cmd_or_rep != REP_SUCCEEDED {
        return Err(HandshakeError::new(
            Phase::FailureReply,
            HandshakeFailure::Refused(reply.cmd_or_rep),
        ));
    }

    Ok(())
}

/// Server side: answer the negotiation arriving on `tunnel` and dial the
/// requested destination. Reads are message-aligned; each negotiation
/// message arrived as exactly one frame.
pub async fn server_handshake(tunnel: &Tunnel) -> Result<Peer, HandshakeError> {
    let data = tunnel
        .read_whole()
        .await
        .map_err(|e| HandshakeError::new(Phase::ReadMethodRequest, e))?;
    MethodRequest::parse(&data).map_err(|e| HandshakeError::new(Phase::ParseMethodRequest, e))?;

    tunnel
        .write(&MethodReply::noauth().encode())
        .await
        .map_err(|e| HandshakeError::new(Phase::WriteMethodReply, e))?;

    let data = tunnel
        .read_whole()
        .await
        .map_err(|e| HandshakeError::new(Phase::ReadRequest, e))?;
    let req = match Message::parse(&data) {
        Ok(req) => req,
        Err(e) => {
            let _ = tunnel
                .write(&Message::reply_to(None, REP_CONNECTION_REFUSED).encode())
                .await;
            return Err(HandshakeError::new(Phase::ParseRequest, e));
        }
    };

    let peer = match dial(&req).await {
        Ok(peer) => peer,
        Err(e) => {
            let _ = tunnel
                .write(&Message::reply_to(Some(&req), REP_NETWORK_UNREACHABLE).encode())
                .await;
            return Err(HandshakeError::new(Phase::Dial, e));
        }
    };

    tunnel
        .write(&Message::reply_to(Some(&req), REP_SUCCEEDED).encode())
        .await
        .map_err(|e| HandshakeError::new(Phase::WriteReply, e))?;

    Ok(peer)
}

async fn dial(req: &Request) -> Result<Peer, std::io::Error> {
    let address = req.address();
    if req.cmd_or_rep == CMD_UDP_ASSOCIATE {
        debug!("server - connecting udp://{}", address);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(address.as_str()).await?;
        Ok(Peer::Udp(socket))
    } else {
        debug!("server - connecting tcp://{}", address);
        Ok(Peer::Tcp(TcpStream::connect(address.as_str()).await?))
    }
}
