//! TLS client configuration for relay connections.
//!
//! Builds on the caller's override config when present, otherwise on the
//! webpki root set. Region nodes can pin an expected certificate name or
//! (tests only) disable verification entirely. When `SSLKEYLOGFILE` is set,
//! session keys are appended there for debugging.

use std::{io::Write, sync::Arc, sync::Mutex};

use n0_error::{AnyError, StdResultExt, anyerr};
use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::WebPkiServerVerifier,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tracing::warn;

use crate::region::RelayNode;

/// Assembles the TLS configuration for one connection attempt.
pub(crate) fn client_config(
    override_config: Option<&rustls::ClientConfig>,
    node: Option<&RelayNode>,
) -> Result<rustls::ClientConfig, AnyError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = match override_config {
        Some(config) => config.clone(),
        None => default_config(),
    };

    if let Some(node) = node {
        if node.insecure_for_tests {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerification::new()));
        } else if let Some(cert_name) = &node.cert_name {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(ExpectedNameVerifier::new(cert_name)?));
        }
    }

    if let Ok(path) = std::env::var("SSLKEYLOGFILE")
        && !path.is_empty()
    {
        warn!("writing TLS session keys to SSLKEYLOGFILE {path}");
        config.key_log = Arc::new(KeyLogAppend::open(&path)?);
    }

    Ok(config)
}

/// Wraps a transport in TLS and completes the handshake, so the peer
/// certificate chain is available for inspection afterwards.
pub(crate) async fn connect<S>(
    config: rustls::ClientConfig,
    server_name: &str,
    io: S,
) -> Result<tokio_rustls::client::TlsStream<S>, AnyError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| anyerr!("invalid TLS server name {server_name:?}"))?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    connector
        .connect(name, io)
        .await
        .std_context("TLS handshake failed")
}

fn default_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Session key log sink: append-only, created 0600.
#[derive(Debug)]
struct KeyLogAppend(Mutex<std::fs::File>);

impl KeyLogAppend {
    fn open(path: &str) -> Result<Self, AnyError> {
        let mut opts = std::fs::OpenOptions::new();
        opts.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts
            .open(path)
            .std_context("failed to open SSLKEYLOGFILE")?;
        Ok(Self(Mutex::new(file)))
    }
}

impl rustls::KeyLog for KeyLogAppend {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let Ok(mut file) = self.0.lock() else {
            return;
        };
        let _ = writeln!(
            file,
            "{label} {} {}",
            hex::encode(client_random),
            hex::encode(secret)
        );
    }
}

/// Verifies the chain against the webpki roots but for a pinned certificate
/// name instead of the dialed server name. The SNI still carries the host
/// name of the node.
#[derive(Debug)]
struct ExpectedNameVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected: ServerName<'static>,
}

impl ExpectedNameVerifier {
    fn new(cert_name: &str) -> Result<Self, AnyError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .std_context("failed to build certificate verifier")?;
        let expected = ServerName::try_from(cert_name.to_string())
            .map_err(|_| anyerr!("invalid expected certificate name {cert_name:?}"))?;
        Ok(Self { inner, expected })
    }
}

impl ServerCertVerifier for ExpectedNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.expected, ocsp_response, now)
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

/// Accepts any certificate. Only reachable through
/// [`RelayNode::insecure_for_tests`].
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl NoVerification {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::ring::default_provider()))
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
