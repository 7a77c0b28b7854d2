//! The TLS capability consumed by the server
//!
//! The engine never provisions certificates itself. Callers hand it a
//! [`TlsContext`] built from whatever key material they manage; the
//! same context serves implicit TLS at accept time and STARTTLS
//! upgrades.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Server-side TLS configuration.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
}

impl TlsContext {
    /// Wrap an already-built rustls configuration.
    #[must_use]
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    /// Build a context from a DER certificate chain and private key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if rustls rejects the key material.
    pub fn from_der(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self::new(Arc::new(config)))
    }

    /// Build a context from PEM-encoded certificate chain and key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the PEM data holds no certificate, no
    /// private key, or key material rustls rejects.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("Invalid certificate PEM: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Tls("No certificate found in PEM data".into()));
        }

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| Error::Tls(format!("Invalid key PEM: {e}")))?
            .ok_or_else(|| Error::Tls("No private key found in PEM data".into()))?;

        Self::from_der(certs, key)
    }

    /// Load PEM certificate chain and key from files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a file cannot be read, otherwise as
    /// [`Self::from_pem`].
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub(crate) const fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}
