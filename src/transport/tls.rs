//! # TLS Transport
//!
//! rustls configuration for the TLS listener and the companion client.
//!
//! The server needs a PEM certificate chain and a PKCS#8 (or RSA) private key; an
//! optional client CA turns on mutual TLS. Clients either trust a CA file, pin the
//! server certificate by SHA-256 fingerprint, or (tests only) accept anything.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument, warn};

use crate::error::{ProtocolError, Result};

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path).map_err(|e| {
        ProtocolError::TlsError(format!("Failed to open cert file {}: {e}", path.display()))
    })?;
    let chain = certs(&mut BufReader::new(file))
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;
    if chain.is_empty() {
        return Err(ProtocolError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let open = || {
        File::open(path).map(BufReader::new).map_err(|e| {
            ProtocolError::TlsError(format!("Failed to open key file {}: {e}", path.display()))
        })
    };

    let keys = pkcs8_private_keys(&mut open()?)
        .map_err(|_| ProtocolError::TlsError("Failed to parse PKCS8 private key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let keys = rsa_private_keys(&mut open()?)
        .map_err(|_| ProtocolError::TlsError("Failed to parse RSA private key".into()))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ProtocolError::TlsError("No private keys found".into()))
}

fn root_store(path: &Path) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(&cert)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to add CA cert: {e}")))?;
    }
    Ok(store)
}

/// SHA-256 fingerprint of a DER certificate, as used for pinning
pub fn cert_fingerprint(cert: &Certificate) -> Vec<u8> {
    Sha256::digest(&cert.0).to_vec()
}

/// Fingerprint of the first certificate in a PEM file
pub fn pem_fingerprint<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let chain = load_certs(path.as_ref())?;
    chain
        .first()
        .map(cert_fingerprint)
        .ok_or_else(|| ProtocolError::TlsError("Empty certificate chain".into()))
}

/// Identity for the TLS listener
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: PathBuf,
    key_path: PathBuf,
    /// Client CA for mutual TLS
    client_ca_path: Option<PathBuf>,
}

impl TlsServerConfig {
    pub fn new<P: Into<PathBuf>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            client_ca_path: None,
        }
    }

    /// Require clients to present a certificate signed by this CA.
    pub fn with_client_auth<P: Into<PathBuf>>(mut self, client_ca_path: P) -> Self {
        self.client_ca_path = Some(client_ca_path.into());
        self
    }

    /// Write a self-signed `localhost` certificate and key, for development and tests.
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        File::create(&cert_path)?.write_all(cert.cert.pem().as_bytes())?;
        File::create(&key_path)?.write_all(cert.signing_key.serialize_pem().as_bytes())?;

        Ok(Self::new(
            cert_path.as_ref().to_path_buf(),
            key_path.as_ref().to_path_buf(),
        ))
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert_path)?;
        let private_key = load_private_key(&self.key_path)?;
        let builder = ServerConfig::builder().with_safe_defaults();

        let config = match &self.client_ca_path {
            Some(ca) => {
                let verifier = rustls::server::AllowAnyAuthenticatedClient::new(root_store(ca)?);
                debug!(client_ca = %ca.display(), "mTLS enabled");
                builder
                    .with_client_cert_verifier(Arc::new(verifier))
                    .with_single_cert(cert_chain, private_key)
            }
            None => builder
                .with_no_client_auth()
                .with_single_cert(cert_chain, private_key),
        };
        config.map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

/// Accepts a server certificate whose SHA-256 matches the pinned fingerprint
struct PinnedCertVerifier {
    fingerprint: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if cert_fingerprint(end_entity) == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "Pinned certificate hash mismatch".into(),
            ))
        }
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn client_cert_error(e: rustls::Error) -> ProtocolError {
    ProtocolError::TlsError(format!("Failed to set client certificate: {e}"))
}

/// How a client decides to trust the server
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    ca_path: Option<PathBuf>,
    pinned_cert_hash: Option<Vec<u8>>,
    insecure: bool,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            ca_path: None,
            pinned_cert_hash: None,
            insecure: false,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// Trust certificates signed by the CA(s) in this PEM file.
    pub fn with_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// Accept only a server certificate with this SHA-256 fingerprint.
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        if hash.len() != 32 {
            warn!(
                len = hash.len(),
                "Certificate hash has unexpected length (expected 32 bytes for SHA-256)"
            );
        }
        self.pinned_cert_hash = Some(hash);
        self
    }

    /// Skip certificate verification entirely. Development and tests only.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: certificate verification is disabled");
        self.insecure = true;
        self
    }

    pub fn with_client_certificate<P: Into<PathBuf>>(mut self, cert_path: P, key_path: P) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    /// Build the rustls client config. Root-store and custom-verifier builders are
    /// distinct types in rustls, so each branch finishes client auth on its own.
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let identity = self.client_identity()?;
        let builder = ClientConfig::builder().with_safe_defaults();

        let verifier: Option<Arc<dyn ServerCertVerifier>> =
            if let Some(hash) = &self.pinned_cert_hash {
                Some(Arc::new(PinnedCertVerifier {
                    fingerprint: hash.clone(),
                }))
            } else if self.insecure {
                Some(Arc::new(AcceptAnyServerCert))
            } else {
                None
            };

        match verifier {
            Some(verifier) => {
                let builder = builder.with_custom_certificate_verifier(verifier);
                match identity {
                    Some((chain, key)) => builder
                        .with_client_auth_cert(chain, key)
                        .map_err(client_cert_error),
                    None => Ok(builder.with_no_client_auth()),
                }
            }
            None => {
                let ca = self.ca_path.as_ref().ok_or_else(|| {
                    ProtocolError::TlsError(
                        "A CA file, a pinned certificate or insecure mode is required".into(),
                    )
                })?;
                let builder = builder.with_root_certificates(root_store(ca)?);
                match identity {
                    Some((chain, key)) => builder
                        .with_client_auth_cert(chain, key)
                        .map_err(client_cert_error),
                    None => Ok(builder.with_no_client_auth()),
                }
            }
        }
    }

    fn client_identity(&self) -> Result<Option<(Vec<Certificate>, PrivateKey)>> {
        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Ok(Some((load_certs(cert)?, load_private_key(key)?))),
            _ => Ok(None),
        }
    }

    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }

    /// Dial `addr` and complete the TLS handshake.
    #[instrument(skip(self), fields(server_name = %self.server_name))]
    pub async fn connect(&self, addr: &str) -> Result<ClientTlsStream<TcpStream>> {
        let connector = TlsConnector::from(Arc::new(self.load_client_config()?));
        let stream = TcpStream::connect(addr).await?;
        connector
            .connect(self.server_name()?, stream)
            .await
            .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))
    }
}
