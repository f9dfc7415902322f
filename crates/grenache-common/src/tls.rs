//! Secure Context Builder
//!
//! Turns raw key/cert/CA material into rustls client and server configurations.
//! Material is taken as bytes (PEM, or a single DER item); reading files is the
//! caller's concern.
//!
//! # Verification Modes
//!
//! | side   | `request_cert` | `reject_unauthorized` | behaviour                                      |
//! |--------|----------------|-----------------------|------------------------------------------------|
//! | server | false          | any                   | no client certificate requested                |
//! | server | true           | true                  | client certificate required, chained to `ca`   |
//! | server | true           | false                 | client certificate requested, accepted as-is   |
//! | client | n/a            | true                  | server chain and name verified against `ca`    |
//! | client | n/a            | false                 | server chain not verified                      |
//!
//! With `reject_unauthorized` off, handshake signatures are still checked, so
//! a peer must hold the private key of the certificate it presents. The
//! certificate itself is trusted blindly; this mode exists for self-signed
//! development topologies.
//!
//! # Example
//!
//! ```no_run
//! use grenache_common::tls::{build_server_context, SecureCredentials};
//!
//! # fn main() -> grenache_common::Result<()> {
//! let key = std::fs::read("key.pem")?;
//! let cert = std::fs::read("cert.pem")?;
//! let ca = std::fs::read("ca.pem")?;
//!
//! let creds = SecureCredentials::new(key, cert, ca)
//!     .request_cert(true)
//!     .reject_unauthorized(false);
//! let context = build_server_context(&creds)?;
//! let _acceptor = context.acceptor();
//! # Ok(())
//! # }
//! ```

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use std::fmt;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::protocol::error::{GrenacheError, Result};

/// Key, certificate and CA material plus verification switches.
#[derive(Clone, PartialEq, Eq)]
pub struct SecureCredentials {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
    pub ca: Vec<u8>,
    pub reject_unauthorized: bool,
    pub request_cert: bool,
}

impl SecureCredentials {
    /// Verification defaults to on; client certificates are not requested.
    pub fn new(key: impl Into<Vec<u8>>, cert: impl Into<Vec<u8>>, ca: impl Into<Vec<u8>>) -> Self {
        SecureCredentials {
            key: key.into(),
            cert: cert.into(),
            ca: ca.into(),
            reject_unauthorized: true,
            request_cert: false,
        }
    }

    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = reject;
        self
    }

    pub fn request_cert(mut self, request: bool) -> Self {
        self.request_cert = request;
        self
    }
}

impl fmt::Debug for SecureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCredentials")
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .field("cert", &format_args!("<{} bytes>", self.cert.len()))
            .field("ca", &format_args!("<{} bytes>", self.ca.len()))
            .field("reject_unauthorized", &self.reject_unauthorized)
            .field("request_cert", &self.request_cert)
            .finish()
    }
}

/// Server-side TLS configuration ready to accept connections.
#[derive(Clone, Debug)]
pub struct ServerTlsContext {
    config: Arc<ServerConfig>,
}

impl ServerTlsContext {
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }
}

/// Client-side TLS configuration ready to dial.
#[derive(Clone, Debug)]
pub struct ClientTlsContext {
    config: Arc<ClientConfig>,
}

impl ClientTlsContext {
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }
}

/// Builds the server context.
///
/// # Errors
///
/// [`GrenacheError::TlsConfig`] when any of key, cert or ca is empty or
/// cannot be parsed, or when rustls rejects the key/cert pair.
pub fn build_server_context(creds: &SecureCredentials) -> Result<ServerTlsContext> {
    let certs = parse_certs("cert", &creds.cert)?;
    let key = parse_key(&creds.key)?;
    let roots = parse_roots(&creds.ca)?;
    let provider = Arc::new(ring::default_provider());

    let verifier: Arc<dyn ClientCertVerifier> = match (creds.request_cert, creds.reject_unauthorized) {
        (false, _) => WebPkiClientVerifier::no_client_auth(),
        (true, true) => WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| GrenacheError::TlsConfig(format!("client verifier: {}", e)))?,
        (true, false) => Arc::new(AcceptAnyClientCert::new(provider.clone())),
    };

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(ServerTlsContext {
        config: Arc::new(config),
    })
}

/// Builds the client context. The client always presents its certificate.
///
/// # Errors
///
/// [`GrenacheError::TlsConfig`] under the same conditions as
/// [`build_server_context`].
pub fn build_client_context(creds: &SecureCredentials) -> Result<ClientTlsContext> {
    let certs = parse_certs("cert", &creds.cert)?;
    let key = parse_key(&creds.key)?;
    let roots = parse_roots(&creds.ca)?;
    let provider = Arc::new(ring::default_provider());

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;
    let builder = if creds.reject_unauthorized {
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(provider)))
    };

    let mut config = builder.with_client_auth_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(ClientTlsContext {
        config: Arc::new(config),
    })
}

/// TLS server name for a `host:port` destination. IP literals are allowed.
pub fn server_name(destination: &str) -> Result<ServerName<'static>> {
    let host = match destination.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => destination,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    ServerName::try_from(host.to_string())
        .map_err(|e| GrenacheError::TlsConfig(format!("invalid server name {}: {}", host, e)))
}

fn ensure_material(label: &str, material: &[u8]) -> Result<()> {
    if material.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(GrenacheError::TlsConfig(format!("{} material is empty", label)));
    }
    Ok(())
}

fn looks_like_der(material: &[u8]) -> bool {
    material.first() == Some(&0x30)
}

fn parse_certs(label: &str, material: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    ensure_material(label, material)?;

    let certs = rustls_pemfile::certs(&mut &material[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GrenacheError::TlsConfig(format!("{}: {}", label, e)))?;

    if !certs.is_empty() {
        return Ok(certs);
    }
    if looks_like_der(material) {
        return Ok(vec![CertificateDer::from(material.to_vec())]);
    }
    Err(GrenacheError::TlsConfig(format!("{} contains no certificate", label)))
}

fn parse_key(material: &[u8]) -> Result<PrivateKeyDer<'static>> {
    ensure_material("key", material)?;

    match rustls_pemfile::private_key(&mut &material[..]) {
        Ok(Some(key)) => Ok(key),
        Ok(None) if looks_like_der(material) => {
            Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(material.to_vec())))
        }
        Ok(None) => Err(GrenacheError::TlsConfig("key contains no private key".into())),
        Err(e) => Err(GrenacheError::TlsConfig(format!("key: {}", e))),
    }
}

fn parse_roots(material: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs("ca", material)? {
        roots
            .add(cert)
            .map_err(|e| GrenacheError::TlsConfig(format!("ca: {}", e)))?;
    }
    Ok(roots)
}

/// Accepts any server certificate; handshake signatures are still verified.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Requests a client certificate without requiring or chaining it.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyClientCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
