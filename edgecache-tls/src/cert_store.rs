//! Certificate store for statically configured hosts
//!
//! Holds one loaded certificate/key bundle per domain, populated during
//! startup and read concurrently at handshake time.

use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Certificate store errors
#[derive(Debug, Error)]
pub enum CertStoreError {
    #[error("Failed to read certificate material for {domain}: {source}")]
    Load {
        domain: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid certificate material for {domain}: {reason}")]
    Invalid { domain: String, reason: String },
}

/// On-disk source for one domain's credentials: a PEM certificate chain
/// and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertificatePair {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

/// In-memory mapping from domain name to its loaded certificate.
///
/// Writes happen during startup configuration only; lookups are safe under
/// unbounded concurrent handshakes.
pub struct CertStore {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            certs: RwLock::new(HashMap::new()),
        }
    }

    /// Load the certificate/key pair from disk and insert it under `domain`,
    /// overwriting any prior entry.
    ///
    /// A failed load leaves the store untouched for that domain.
    pub fn put(&self, domain: &str, pair: &CertificatePair) -> Result<(), CertStoreError> {
        let cert_pem = std::fs::read(&pair.cert_path).map_err(|source| CertStoreError::Load {
            domain: domain.to_string(),
            source,
        })?;
        let key_pem = std::fs::read(&pair.key_path).map_err(|source| CertStoreError::Load {
            domain: domain.to_string(),
            source,
        })?;

        let key = parse_certified_key(&cert_pem, &key_pem).map_err(|reason| {
            CertStoreError::Invalid {
                domain: domain.to_string(),
                reason,
            }
        })?;

        tracing::info!("📜 Loaded certificate for {} from {:?}", domain, pair.cert_path);

        self.certs.write().insert(domain.to_string(), Arc::new(key));
        Ok(())
    }

    /// Look up the certificate for a domain. Pure read, no side effects.
    pub fn get(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.read().get(domain).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.certs.read().len()
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a PEM certificate chain and private key into a rustls
/// [`CertifiedKey`].
pub(crate) fn parse_certified_key(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<CertifiedKey, String> {
    use rustls::pki_types::CertificateDer;

    let mut reader = std::io::Cursor::new(cert_pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("bad certificate PEM: {}", e))?;

    if certs.is_empty() {
        return Err("no certificates found in PEM".to_string());
    }

    let mut reader = std::io::Cursor::new(key_pem);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| format!("bad key PEM: {}", e))?
        .ok_or("no private key found in PEM")?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|_| "unsupported key type".to_string())?;

    Ok(CertifiedKey::new(certs, signing_key))
}
