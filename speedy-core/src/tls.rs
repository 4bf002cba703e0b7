//! TLS credentials for the relay
//!
//! A [`CertificateProvider`] produces a [`TlsCredential`] (certificate chain plus
//! private key) or fails; failure is fatal at startup. The credential is turned
//! into a rustls server configuration that negotiates HTTP/2 via ALPN.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// ALPN identifiers offered by the server, most preferred first.
///
/// HTTP/1.1 stays negotiable so that such clients reach the HTTP layer and get
/// a proper "version not supported" response instead of a handshake failure.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Source of the relay's TLS credential
pub trait CertificateProvider: Send + Sync {
    fn load(&self) -> Result<TlsCredential>;
}

/// Certificate chain and private key, DER encoded
#[derive(Debug)]
pub struct TlsCredential {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsCredential {
    /// Build a rustls server configuration (ring provider, no client auth)
    pub fn into_server_config(self) -> Result<Arc<ServerConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls("unsupported protocol versions", e))?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain, self.key)
            .map_err(|e| Error::tls("invalid certificate or key", e))?;

        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

        Ok(Arc::new(config))
    }
}

/// Loads a PEM certificate chain and private key from two files
#[derive(Debug, Clone)]
pub struct PemFileProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl PemFileProvider {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

impl From<&TlsConfig> for PemFileProvider {
    fn from(config: &TlsConfig) -> Self {
        Self::new(&config.cert_path, &config.key_path)
    }
}

impl CertificateProvider for PemFileProvider {
    fn load(&self) -> Result<TlsCredential> {
        let open = |path: &PathBuf| {
            File::open(path)
                .map(BufReader::new)
                .map_err(|e| Error::tls(format!("cannot open {}", path.display()), e))
        };

        let cert_chain = read_cert_chain(&mut open(&self.cert_path)?)
            .map_err(|e| Error::tls(self.cert_path.display(), e))?;
        let key = read_private_key(&mut open(&self.key_path)?)
            .map_err(|e| Error::tls(self.key_path.display(), e))?;

        Ok(TlsCredential { cert_chain, key })
    }
}

/// In-memory PEM credential
#[derive(Debug, Clone)]
pub struct PemProvider {
    cert_pem: String,
    key_pem: String,
}

impl PemProvider {
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }
}

impl CertificateProvider for PemProvider {
    fn load(&self) -> Result<TlsCredential> {
        let cert_chain = read_cert_chain(&mut Cursor::new(self.cert_pem.as_bytes()))
            .map_err(|e| Error::tls("certificate", e))?;
        let key = read_private_key(&mut Cursor::new(self.key_pem.as_bytes()))
            .map_err(|e| Error::tls("private key", e))?;

        Ok(TlsCredential { cert_chain, key })
    }
}

/// Load the provider's credential and build the server configuration
pub fn load_server_config(provider: &dyn CertificateProvider) -> Result<Arc<ServerConfig>> {
    provider.load()?.into_server_config()
}

fn read_cert_chain(reader: &mut dyn BufRead) -> std::result::Result<Vec<CertificateDer<'static>>, String> {
    let chain = rustls_pemfile::certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("malformed certificate: {e}"))?;

    if chain.is_empty() {
        return Err("no certificate found".to_string());
    }
    Ok(chain)
}

fn read_private_key(reader: &mut dyn BufRead) -> std::result::Result<PrivateKeyDer<'static>, String> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| format!("malformed private key: {e}"))?
        .ok_or_else(|| "no private key found".to_string())
}
