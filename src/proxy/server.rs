//! Remote end of the proxy
//!
//! Accepts WebSocket connections (optionally behind TLS), checks the
//! shared secret during the HTTP upgrade, and runs one dispatcher per
//! connection. Every accepted tunnel is handshaken and piped to its real
//! destination in its own task.

use super::{server_handshake, Pipe};
use crate::carrier::{MessageCarrier, WsCarrier, AUTH_TOKEN_HEADER};
use crate::tunnel::{Dispatcher, Tunnel};
use crate::Error;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// PEM certificate chain and key for `wss://` listeners. Certificate
/// generation is the operator's business.
pub struct TlsIdentity {
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub struct Server {
    url: String,
    secret: Option<String>,
    tls: Option<TlsIdentity>,
}

impl Server {
    pub fn new(url: impl Into<String>, secret: Option<String>, tls: Option<TlsIdentity>) -> Self {
        Self {
            url: url.into(),
            secret,
            tls,
        }
    }

    /// Listen per the configured URL and serve until ctrl-c. Fails fast on
    /// a bad URL, unreadable TLS identity, or an unbindable port.
    pub async fn run(&self) -> crate::Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid url {}: {}", self.url, e)))?;

        let (default_port, tls_enabled) = match url.scheme() {
            "ws" => (80, false),
            "wss" => (443, true),
            other => {
                return Err(Error::Config(format!("unsupported scheme {}", other)));
            }
        };
        let port = url.port().unwrap_or(default_port);
        let path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        let acceptor = if tls_enabled {
            let identity = self.tls.as_ref().ok_or_else(|| {
                Error::Config("wss:// requires --tls-cert and --tls-key".to_string())
            })?;
            Some(load_tls_acceptor(&identity.cert, &identity.key)?)
        } else {
            None
        };

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("listening on port {} path {}", port, path);

        loop {
            let (stream, peer) = tokio::select! {
                result = listener.accept() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
            };
            debug!("connection from {}", peer);

            let path = path.clone();
            let secret = self.secret.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => serve_connection(tls, path, secret).await,
                        Err(e) => debug!("TLS accept from {} failed: {}", peer, e),
                    },
                    None => serve_connection(stream, path, secret).await,
                }
            });
        }
    }
}

/// Upgrade one inbound connection to a WebSocket and demultiplex tunnels
/// off it until the carrier dies.
async fn serve_connection<S>(stream: S, path: String, secret: Option<String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let callback = move |request: &Request, response: Response| {
        if request.uri().path() != path {
            return Err(error_response(StatusCode::NOT_FOUND, "Not Found"));
        }
        if let Some(secret) = &secret {
            let presented = request
                .headers()
                .get(AUTH_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if !presented.eq_ignore_ascii_case(secret) {
                return Err(error_response(StatusCode::FORBIDDEN, "Auth Failure!"));
            }
        }
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("upgrade failed: {}", e);
            return;
        }
    };

    let carrier: Arc<dyn MessageCarrier> = Arc::new(WsCarrier::new(ws));
    serve_dispatcher(Arc::new(Dispatcher::new(carrier))).await;
}

/// Accept tunnels off one dispatcher until it shuts down.
pub async fn serve_dispatcher(dispatcher: Arc<Dispatcher>) {
    let cancel = CancellationToken::new();
    loop {
        match dispatcher.accept_tunnel(&cancel).await {
            Ok(tunnel) => {
                tokio::spawn(handle_tunnel(tunnel));
            }
            Err(e) => {
                debug!("dispatcher finished: {}", e);
                break;
            }
        }
    }
}

async fn handle_tunnel(tunnel: Arc<Tunnel>) {
    match server_handshake(&tunnel).await {
        Ok(peer) => Pipe::new(tunnel, peer).run().await,
        Err(e) => {
            warn!("{}", e);
            let _ = tunnel.close().await;
        }
    }
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> crate::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", key_path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("bad TLS identity: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
