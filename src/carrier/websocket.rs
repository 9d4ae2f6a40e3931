//! WebSocket carrier
//!
//! Adapts a `tokio-tungstenite` WebSocket to the [`MessageCarrier`]
//! contract: every binary frame is one carrier message. Writes from
//! concurrent tunnels are serialized by the sink mutex.

use super::{CarrierConnector, CarrierError, MessageCarrier, AUTH_TOKEN_HEADER};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, WebSocketStream};
use tracing::trace;

/// A WebSocket wrapped as a message carrier.
pub struct WsCarrier<S> {
    reader: Mutex<SplitStream<WebSocketStream<S>>>,
    writer: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    closed: AtomicBool,
}

impl<S> WsCarrier<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (writer, reader) = ws.split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> MessageCarrier for WsCarrier<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_message(&self) -> Result<Bytes, CarrierError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                None => return Err(CarrierError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Binary(data))) => return Ok(data.into()),
                Some(Ok(Message::Close(_))) => return Err(CarrierError::Closed),
                // Pings are answered by tungstenite itself; anything else
                // is not part of the protocol.
                Some(Ok(other)) => trace!("ignoring non-binary message: {:?}", other),
            }
        }
    }

    async fn write_message(&self, msg: Bytes) -> Result<(), CarrierError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CarrierError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(Message::Binary(msg.to_vec())).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CarrierError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
        Ok(())
    }
}

/// Dials the configured `ws://` or `wss://` URL and hands back the
/// connection as a carrier.
///
/// The shared secret, when present, travels in the `x-auth-token` request
/// header. Servers commonly run with self-signed certificates, so the TLS
/// client does not verify the peer certificate.
pub struct WsConnector {
    url: String,
    secret: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            url: url.into(),
            secret,
        }
    }
}

#[async_trait]
impl CarrierConnector for WsConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageCarrier>, CarrierError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(secret) = &self.secret {
            let value = HeaderValue::from_str(secret)
                .map_err(|e| CarrierError::Connect(format!("invalid secret: {}", e)))?;
            request.headers_mut().insert(AUTH_TOKEN_HEADER, value);
        }

        let connector = Connector::Rustls(Arc::new(insecure_tls_config()));
        let (ws, _response) =
            connect_async_tls_with_config(request, None, false, Some(connector)).await?;

        trace!("WebSocket connected to {}", self.url);
        Ok(Arc::new(WsCarrier::new(ws)))
    }
}

fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
        .with_no_client_auth()
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Signatures are still checked so a
    /// broken handshake fails instead of silently passing garbage.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
