//! SNI-based certificate resolution
//!
//! Selects which certificate to present during the TLS handshake, based on
//! the server name announced in the ClientHello.

use crate::cert_store::CertStore;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use thiserror::Error;

/// Handshake-time resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Missing certificate for {0}")]
    CertificateNotFound(String),
}

/// Resolver backed by the [`CertStore`].
///
/// Lookup is an exact match on the requested name. No wildcard or suffix
/// matching: a domain not present verbatim fails resolution, and only the
/// offending handshake is affected.
pub struct SniResolver {
    store: Arc<CertStore>,
}

impl SniResolver {
    pub fn new(store: Arc<CertStore>) -> Self {
        Self { store }
    }

    /// Resolve a certificate for the requested server name.
    pub fn lookup(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ResolveError> {
        self.store
            .get(server_name)
            .ok_or_else(|| ResolveError::CertificateNotFound(server_name.to_string()))
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = match client_hello.server_name() {
            Some(name) => name.to_string(),
            None => {
                tracing::warn!("❌ No SNI in ClientHello, rejecting handshake");
                return None;
            }
        };

        tracing::debug!("🔍 Resolving certificate for SNI: {}", server_name);

        match self.lookup(&server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("❌ {}", e);
                None
            }
        }
    }
}

/// Resolver that always presents one already-resolved certificate.
///
/// Used on the automatic-provisioning path where the certificate for the
/// connection has been resolved before the handshake completes.
#[derive(Debug)]
pub struct SingleCertResolver(pub Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_store::test_support::write_self_signed;
    use crate::cert_store::CertificatePair;
    use tempfile::TempDir;

    fn store_with(domains: &[&str]) -> Arc<CertStore> {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CertStore::new());
        for domain in domains {
            let (cert, key) = write_self_signed(&dir, domain);
            store.put(domain, &CertificatePair::new(cert, key)).unwrap();
        }
        store
    }

    #[test]
    fn test_lookup_exact_match() {
        let store = store_with(&["static.example.com"]);
        let resolver = SniResolver::new(store);

        assert!(resolver.lookup("static.example.com").is_ok());
    }

    #[test]
    fn test_lookup_unknown_host_is_named_error() {
        let store = store_with(&["static.example.com"]);
        let resolver = SniResolver::new(store);

        let err = resolver.lookup("unknown.example.com").unwrap_err();
        match err {
            ResolveError::CertificateNotFound(host) => {
                assert_eq!(host, "unknown.example.com")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_wildcard_matching() {
        let store = store_with(&["example.com"]);
        let resolver = SniResolver::new(store);

        // A subdomain must not resolve against the apex entry.
        assert!(resolver.lookup("api.example.com").is_err());
    }

    #[test]
    fn test_failed_lookup_leaves_other_hosts_resolvable() {
        let store = store_with(&["static.example.com"]);
        let resolver = SniResolver::new(store);

        assert!(resolver.lookup("unknown.example.com").is_err());
        assert!(resolver.lookup("static.example.com").is_ok());
    }

    #[test]
    fn test_single_cert_resolver_returns_same_key() {
        let store = store_with(&["example.com"]);
        let key = store.get("example.com").unwrap();
        let resolver = SingleCertResolver(key.clone());

        assert!(Arc::ptr_eq(&resolver.0, &key));
    }
}
