//! Local SOCKS5 proxy, client side
//!
//! Listens for SOCKS5 connections from local applications and carries each
//! one as a tunnel over a WebSocket link. `--client-count` links share one
//! listener; each link owns its dispatcher and rebuilds it when the
//! carrier dies, with a fixed backoff after repeated failures.

use super::{client_handshake, Peer, Pipe, REBUILD_BACKOFF, REBUILD_FREE_RETRIES};
use crate::carrier::CarrierConnector;
use crate::tunnel::Dispatcher;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ClientProxy {
    listen_port: u16,
    client_count: usize,
    connector: Arc<dyn CarrierConnector>,
}

impl ClientProxy {
    pub fn new(
        listen_port: u16,
        client_count: usize,
        connector: Arc<dyn CarrierConnector>,
    ) -> Self {
        Self {
            listen_port,
            client_count: client_count.max(1),
            connector,
        }
    }

    /// Bind the listener, dial one carrier per link, and serve until
    /// ctrl-c. Fails fast when the listener cannot bind or no initial
    /// carrier connection succeeds.
    pub async fn run(&self) -> crate::Result<()> {
        let listener = Arc::new(TcpListener::bind(("0.0.0.0", self.listen_port)).await?);
        info!("SOCKS5 proxy listening on port {}", self.listen_port);

        let shutdown = CancellationToken::new();
        let mut links = Vec::with_capacity(self.client_count);
        for index in 0..self.client_count {
            let link = Arc::new(
                Link::connect(
                    Arc::clone(&listener),
                    Arc::clone(&self.connector),
                    shutdown.child_token(),
                )
                .await?,
            );
            debug!("link {} established", index);
            links.push(Arc::clone(&link));
            tokio::spawn(async move { link.serve().await });
        }

        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        shutdown.cancel();
        for link in &links {
            link.close().await;
        }
        Ok(())
    }
}

struct LinkState {
    dispatcher: Arc<Dispatcher>,
    /// Consecutive rebuild failures; reset on success.
    failures: u32,
}

/// One carrier connection plus its dispatcher and rebuild bookkeeping.
struct Link {
    listener: Arc<TcpListener>,
    connector: Arc<dyn CarrierConnector>,
    state: Mutex<LinkState>,
    shutdown: CancellationToken,
}

impl Link {
    async fn connect(
        listener: Arc<TcpListener>,
        connector: Arc<dyn CarrierConnector>,
        shutdown: CancellationToken,
    ) -> crate::Result<Self> {
        let carrier = connector.connect().await?;
        let dispatcher = Arc::new(Dispatcher::new(carrier));
        Ok(Self {
            listener,
            connector,
            state: Mutex::new(LinkState {
                dispatcher,
                failures: 0,
            }),
            shutdown,
        })
    }

    async fn serve(self: Arc<Self>) {
        loop {
            let conn = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((conn, _)) => conn,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        break;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            let link = Arc::clone(&self);
            tokio::spawn(async move { link.handle(conn).await });
        }
    }

    async fn handle(&self, mut conn: TcpStream) {
        let dispatcher = match self.dispatcher().await {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                warn!("no usable link: {}", e);
                return;
            }
        };

        match client_handshake(&mut conn, &dispatcher, self.shutdown.child_token()).await {
            Ok(tunnel) => Pipe::new(tunnel, Peer::Tcp(conn)).run().await,
            Err(e) => warn!("{}", e),
        }
    }

    /// Current dispatcher, rebuilding it first if its carrier died. The
    /// state lock serializes rebuilds, so concurrent sessions share one
    /// reconnection attempt instead of racing the server.
    async fn dispatcher(&self) -> crate::Result<Arc<Dispatcher>> {
        let mut state = self.state.lock().await;
        if state.dispatcher.is_alive() {
            return Ok(Arc::clone(&state.dispatcher));
        }

        if state.failures >= REBUILD_FREE_RETRIES {
            tokio::time::sleep(REBUILD_BACKOFF).await;
        }

        match self.connector.connect().await {
            Ok(carrier) => {
                info!("link re-established");
                state.dispatcher = Arc::new(Dispatcher::new(carrier));
                state.failures = 0;
                Ok(Arc::clone(&state.dispatcher))
            }
            Err(e) => {
                state.failures += 1;
                debug!("rebuild attempt {} failed: {}", state.failures, e);
                Err(e.into())
            }
        }
    }

    async fn close(&self) {
        self.state.lock().await.dispatcher.close().await;
    }
}
