//! TLS transport manager
//!
//! Builds client and server TLS contexts from the configured material and
//! establishes encrypted byte streams. Material is loaded once at startup;
//! anything missing or malformed is a [`ConfigError`], anything that goes
//! wrong on the wire is a [`TransportError`].

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{ConfigError, TransportError};

/// How a client verifies the server certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustMode {
    /// Bundled web PKI roots
    SystemRoots,
    /// Only certificates chaining to this PEM bundle
    CustomCa(PathBuf),
    /// Accept anything
    Insecure,
}

/// Certificate chain plus private key presented by this process
pub struct Identity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Load a PEM certificate chain and its private key
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, ConfigError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        Ok(Self { certs, key })
    }

    /// Load the identity only if both files exist
    pub fn load_optional(cert_path: &Path, key_path: &Path) -> Result<Option<Self>, ConfigError> {
        if cert_path.exists() && key_path.exists() {
            Self::load(cert_path, key_path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// SHA-256 fingerprint of the leaf certificate
    pub fn fingerprint(&self) -> Option<String> {
        self.certs.first().map(fingerprint)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// Client side: dials a server and completes the handshake
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    /// Build a client context
    pub fn new(trust: &TrustMode, identity: Option<Identity>) -> Result<Self, ConfigError> {
        ensure_crypto_provider();

        let builder = match trust {
            TrustMode::Insecure => {
                tracing::warn!("TLS server verification disabled");
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(SkipVerification::new())
            }
            TrustMode::SystemRoots => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                rustls::ClientConfig::builder().with_root_certificates(roots)
            }
            TrustMode::CustomCa(path) => {
                rustls::ClientConfig::builder().with_root_certificates(load_roots(path)?)
            }
        };

        let config = match identity {
            Some(Identity { certs, key }) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ConfigError::Invalid(format!("Invalid client certificate: {}", e)))?,
            None => builder.with_no_client_auth(),
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Connect to `addr` and verify the server as `server_name`.
    ///
    /// The whole exchange (TCP connect plus handshake) is bounded by
    /// `timeout`.
    pub async fn connect(
        &self,
        addr: &str,
        server_name: &str,
        timeout: Duration,
    ) -> Result<client::TlsStream<TcpStream>, TransportError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TransportError::InvalidServerName(server_name.to_string()))?;

        let attempt = async {
            let tcp = TcpStream::connect(addr)
                .await
                .map_err(|source| TransportError::Connect {
                    addr: addr.to_string(),
                    source,
                })?;
            let _ = tcp.set_nodelay(true);

            self.connector
                .connect(name, tcp)
                .await
                .map_err(|e| TransportError::Handshake {
                    peer: addr.to_string(),
                    message: e.to_string(),
                })
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => {
                if let Ok(stream) = &result {
                    tracing::debug!(
                        %addr,
                        fingerprint = peer_fingerprint(stream.get_ref().1).as_deref().unwrap_or("-"),
                        "TLS connection established"
                    );
                }
                result
            }
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// Server side: completes handshakes on accepted sockets
#[derive(Clone)]
pub struct TlsServer {
    acceptor: TlsAcceptor,
}

impl TlsServer {
    /// Build a server context. With `client_ca` set, clients must present
    /// a certificate chaining to it.
    pub fn new(identity: Identity, client_ca: Option<&Path>) -> Result<Self, ConfigError> {
        ensure_crypto_provider();

        let builder = rustls::ServerConfig::builder();
        let builder = match client_ca {
            Some(path) => {
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(
                    load_roots(path)?,
                ))
                .build()
                .map_err(|e| ConfigError::tls(path, e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let config = builder
            .with_single_cert(identity.certs, identity.key)
            .map_err(|e| ConfigError::Invalid(format!("Invalid server certificate: {}", e)))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Complete the handshake on an accepted socket within `timeout`
    pub async fn accept(
        &self,
        tcp: TcpStream,
        timeout: Duration,
    ) -> Result<server::TlsStream<TcpStream>, TransportError> {
        let peer = tcp
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = tcp.set_nodelay(true);

        match tokio::time::timeout(timeout, self.acceptor.accept(tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::Handshake {
                peer,
                message: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// Hex SHA-256 of the peer's leaf certificate, if it presented one
pub fn peer_fingerprint(state: &rustls::CommonState) -> Option<String> {
    state
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(fingerprint)
}

fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_roots(path: &Path) -> Result<rustls::RootCertStore, ConfigError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ConfigError::tls(path, format!("invalid CA certificate: {}", e)))?;
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::tls(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::tls(path, format!("failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(ConfigError::tls(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::tls(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::tls(path, format!("failed to parse key: {}", e)))?
        .ok_or_else(|| ConfigError::tls(path, "no private key found"))
}

#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
