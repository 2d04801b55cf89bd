//! TLS control channel: ordered, reliable, length-framed messages.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CipherSuite, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace};

use voxlink_protocol::codec::{frame, try_decode_frame};
use voxlink_protocol::ProtocolError;

use crate::config::ConfigError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate verifier setup failed: {0}")]
    Verifier(#[from] rustls::client::VerifierBuilderError),

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decides whether to continue a handshake whose certificate chain failed
/// native validation. Called synchronously from inside the handshake.
pub trait CertificateReviewer: Send + Sync {
    /// `chain` is leaf first. Return `true` to proceed anyway.
    fn review(&self, chain: &[CertificateDer<'static>], error: &rustls::Error) -> bool;
}

/// Runs the standard WebPKI verification and, instead of failing outright,
/// hands rejected chains to a [`CertificateReviewer`]. Handshake signatures
/// are always checked by the WebPKI verifier, pinned or not.
struct ReviewingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    reviewer: Arc<dyn CertificateReviewer>,
}

impl fmt::Debug for ReviewingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewingVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for ReviewingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(e) => {
                debug!("native certificate validation failed: {}", e);
                let mut chain = Vec::with_capacity(1 + intermediates.len());
                chain.push(end_entity.clone().into_owned());
                chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
                if self.reviewer.review(&chain, &e) {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// An established TLS control connection.
pub struct ControlChannel {
    stream: TlsStream<TcpStream>,
    peer_addr: SocketAddr,
}

impl ControlChannel {
    /// Connect and complete the TLS handshake. Chains the trust store rejects
    /// are passed to `reviewer` before the handshake gives up.
    pub async fn connect(
        host: &str,
        port: u16,
        roots: RootCertStore,
        reviewer: Arc<dyn CertificateReviewer>,
    ) -> Result<Self, TransportError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|source| TransportError::Connect {
                addr: format!("{host}:{port}"),
                source,
            })?;
        tcp.set_nodelay(true)?;
        let peer_addr = tcp.peer_addr()?;

        info!(%peer_addr, "TCP connected to {}:{}", host, port);

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let inner =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone()).build()?;
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ReviewingVerifier { inner, reviewer }))
            .with_no_client_auth();

        let stream = TlsConnector::from(Arc::new(config))
            .connect(server_name(host)?, tcp)
            .await
            .map_err(TransportError::Handshake)?;

        let channel = Self { stream, peer_addr };
        info!(
            cipher = ?channel.cipher_suite(),
            "TLS handshake complete"
        );
        Ok(channel)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Leaf first.
    pub fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        let (_, conn) = self.stream.get_ref();
        conn.peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default()
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        let (_, conn) = self.stream.get_ref();
        conn.negotiated_cipher_suite().map(|s| s.suite())
    }

    pub fn split(self) -> (FrameReader, ControlWriter) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            FrameReader {
                read_half,
                buf: BytesMut::with_capacity(4096),
            },
            ControlWriter {
                write_half: Some(write_half),
            },
        )
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned())
        .map_err(|_| TransportError::InvalidServerName(host.to_owned()))
}

/// Inbound half: yields one length-framed message at a time.
pub struct FrameReader {
    read_half: ReadHalf<TlsStream<TcpStream>>,
    buf: BytesMut,
}

impl FrameReader {
    /// Next complete frame, or `None` once the peer closed the stream.
    ///
    /// Cancel safe: partial data stays buffered in `self`.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if let Some(payload) = try_decode_frame(&mut self.buf)? {
                return Ok(Some(payload));
            }
            if self.read_half.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}

/// Outbound half. Writes after [`close`](Self::close) are dropped.
pub struct ControlWriter {
    write_half: Option<WriteHalf<TlsStream<TcpStream>>>,
}

impl ControlWriter {
    pub fn is_open(&self) -> bool {
        self.write_half.is_some()
    }

    /// Frame and write one encoded message. With `flush` unset the TLS layer
    /// may coalesce it with later writes.
    pub async fn send(&mut self, payload: &[u8], flush: bool) -> Result<(), TransportError> {
        let Some(write_half) = self.write_half.as_mut() else {
            trace!(len = payload.len(), "control channel closed, dropping message");
            return Ok(());
        };
        let framed = frame(payload)?;
        write_half.write_all(&framed).await?;
        if flush {
            write_half.flush().await?;
        }
        Ok(())
    }

    /// Send close_notify and drop the stream. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut write_half) = self.write_half.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, write_half.shutdown()).await {
                Ok(Ok(())) => debug!("control channel closed"),
                Ok(Err(e)) => debug!("control channel shutdown error: {}", e),
                Err(_) => debug!("control channel shutdown timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_accepts_ip_and_dns() {
        assert!(matches!(
            server_name("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("::1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("voice.example.org").unwrap(),
            ServerName::DnsName(_)
        ));
    }

    #[test]
    fn server_name_rejects_garbage() {
        assert!(matches!(
            server_name("not a host!"),
            Err(TransportError::InvalidServerName(_))
        ));
    }

    #[tokio::test]
    async fn connect_refused_is_reported() {
        struct Never;
        impl CertificateReviewer for Never {
            fn review(&self, _: &[CertificateDer<'static>], _: &rustls::Error) -> bool {
                false
            }
        }

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let roots = crate::config::TrustSettings::default().root_store().unwrap();
        let result = ControlChannel::connect("127.0.0.1", port, roots, Arc::new(Never)).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
