//! Minimal rustls-based TLS wrapper, used when `ClientOptions::tls` is enabled
//! (spec.md §6, `ssl`/`tls` URI option).

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream as RustlsClientStream, TlsConnector};

use crate::error::{Error, ErrorKind, Result};

pub(crate) type TlsStream = RustlsClientStream<TcpStream>;

/// Cached rustls client configuration, built once per [`ConnectionEstablisher`](crate::cmap::establish::ConnectionEstablisher).
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

impl TlsConfig {
    pub(crate) fn new(verify_certificates: bool) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let builder = ClientConfig::builder();
        let config = if verify_certificates {
            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

pub(crate) async fn tls_connect(
    host: &str,
    tcp: TcpStream,
    config: &TlsConfig,
) -> Result<TlsStream> {
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| Error::from(ErrorKind::Internal {
            message: format!("invalid TLS server name: {host}"),
        }))?;
    config
        .connector
        .connect(server_name, tcp)
        .await
        .map_err(Error::from)
}

/// Certificate verifier used when `sslVerify=false` (spec.md §6). Only meaningful for
/// local/test deployments; never the default.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureVerified, rustls::Error>
    {
        Ok(rustls::client::danger::HandshakeSignatureVerified::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureVerified, rustls::Error>
    {
        Ok(rustls::client::danger::HandshakeSignatureVerified::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
