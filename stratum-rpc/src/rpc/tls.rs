//! TLS over the TCP connector.
//!
//! Most public Electrum servers only listen on the `s` (TLS) port. Their
//! certificates are checked against the Mozilla root set unless the caller
//! turns verification off, which is the norm for onion services: few of them
//! have CA-signed certificates and Tor already authenticates the endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tracing::debug;

use super::error::{RpcError, RpcResult};
use super::transport::{Connector, TcpConnector, TransportStreams};

/// TLS connector, direct or through the TCP connector's SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct TlsConnector {
    tcp: TcpConnector,
    verify_certificates: bool,
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Wrap `tcp` in TLS. With `verify_certificates` off any certificate the
    /// server presents is accepted.
    pub fn new(tcp: TcpConnector, verify_certificates: bool) -> RpcResult<Self> {
        Ok(Self {
            config: Arc::new(client_config(verify_certificates)?),
            tcp,
            verify_certificates,
        })
    }

    /// Underlying TCP connector.
    pub fn tcp(&self) -> &TcpConnector {
        &self.tcp
    }

    /// Whether server certificates are checked.
    pub fn verifies_certificates(&self) -> bool {
        self.verify_certificates
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> RpcResult<TransportStreams> {
        let server_name = ServerName::try_from(self.tcp.host().to_string())
            .map_err(|e| RpcError::Tls(format!("{}: {}", self.tcp.host(), e)))?;

        let stream = self.tcp.open().await?;
        let peer = stream.peer_addr().ok();

        let tls = tokio_rustls::TlsConnector::from(Arc::clone(&self.config))
            .connect(server_name, stream)
            .await
            .map_err(|e| RpcError::Tls(e.to_string()))?;

        debug!(
            host = %self.tcp.host(),
            verified = self.verify_certificates,
            "TLS session established"
        );
        Ok(TransportStreams::from_stream(tls, peer))
    }

    fn describe(&self) -> String {
        format!("tls://{}", self.tcp.describe())
    }
}

fn client_config(verify_certificates: bool) -> RpcResult<ClientConfig> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| RpcError::Tls(e.to_string()))?;

    let config = if verify_certificates {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Accepts every certificate but still checks handshake signatures, so the
/// session is at least bound to the key the server presented.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        let algorithms = &self.0.signature_verification_algorithms;
        crypto::verify_tls12_signature(message, cert, dss, algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algorithms = &self.0.signature_verification_algorithms;
        crypto::verify_tls13_signature(message, cert, dss, algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
