//! Server TLS configuration builder
//!
//! Composes the per-listener TLS configuration: a process-wide handshake
//! policy (cipher suites, protocol versions, curve preferences) plus one
//! certificate-resolution path per virtual host. Static hosts are loaded
//! into the certificate store up front; automatically provisioned hosts
//! get their own [`AutoCertManager`].

use crate::cert_store::{CertStore, CertStoreError, CertificatePair};
use crate::manager::{AutoCertError, AutoCertManager};
use crate::resolver::{ResolveError, SingleCertResolver, SniResolver};
use parking_lot::RwLock;
use rustls::crypto::ring as provider;
use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor};

/// TLS configuration errors (startup time)
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Invalid TLS policy: {0}")]
    Policy(String),

    #[error(transparent)]
    CertStore(#[from] CertStoreError),

    #[error(transparent)]
    AutoCert(#[from] AutoCertError),

    #[error("Host {0}: static TLS requires both certificate and key paths")]
    IncompleteStatic(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("No TLS hosts configured")]
    NoHosts,
}

/// Handshake errors (per connection; never fatal to the listener)
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Client did not announce a server name")]
    NoServerName,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Issuance(#[from] AutoCertError),

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),

    #[error("Handshake IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-wide handshake policy, applied uniformly to every host served
/// by one listener. Only certificate resolution is per-host.
#[derive(Clone)]
pub struct TlsPolicy {
    cipher_suites: Vec<SupportedCipherSuite>,
    kx_groups: Vec<&'static dyn SupportedKxGroup>,
    versions: Vec<&'static SupportedProtocolVersion>,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        let defaults = provider::default_provider();
        Self {
            cipher_suites: defaults.cipher_suites,
            kx_groups: defaults.kx_groups,
            versions: rustls::ALL_VERSIONS.to_vec(),
        }
    }
}

impl TlsPolicy {
    /// Build a policy from configuration strings. `None` falls back to the
    /// provider defaults for that setting.
    pub fn from_settings(
        min_version: Option<&str>,
        max_version: Option<&str>,
        cipher_suites: Option<&[String]>,
        curves: Option<&[String]>,
    ) -> Result<Self, TlsError> {
        let mut policy = Self::default();

        if min_version.is_some() || max_version.is_some() {
            let min = min_version.map(parse_version).transpose()?;
            let max = max_version.map(parse_version).transpose()?;

            if let (Some(min), Some(max)) = (min, max) {
                if version_ord(min) > version_ord(max) {
                    return Err(TlsError::Policy(format!(
                        "min_version {:?} is above max_version {:?}",
                        min.version, max.version
                    )));
                }
            }

            policy.versions = rustls::ALL_VERSIONS
                .iter()
                .copied()
                .filter(|v| {
                    min.is_none_or(|m| version_ord(v) >= version_ord(m))
                        && max.is_none_or(|m| version_ord(v) <= version_ord(m))
                })
                .collect();

            if policy.versions.is_empty() {
                return Err(TlsError::Policy(
                    "version bounds leave no enabled protocol version".to_string(),
                ));
            }
        }

        if let Some(names) = cipher_suites {
            policy.cipher_suites = names
                .iter()
                .map(|name| parse_cipher_suite(name))
                .collect::<Result<_, _>>()?;
        }

        if let Some(names) = curves {
            policy.kx_groups = names
                .iter()
                .map(|name| parse_curve(name))
                .collect::<Result<_, _>>()?;
        }

        Ok(policy)
    }

    /// Build a rustls server configuration enforcing this policy, with the
    /// given certificate-resolution strategy.
    pub fn server_config(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<ServerConfig, rustls::Error> {
        let crypto = CryptoProvider {
            cipher_suites: self.cipher_suites.clone(),
            kx_groups: self.kx_groups.clone(),
            ..provider::default_provider()
        };

        let config = ServerConfig::builder_with_provider(Arc::new(crypto))
            .with_protocol_versions(&self.versions)?
            .with_no_client_auth()
            .with_cert_resolver(resolver);

        Ok(config)
    }
}

fn version_ord(v: &SupportedProtocolVersion) -> u16 {
    u16::from(v.version)
}

fn parse_version(name: &str) -> Result<&'static SupportedProtocolVersion, TlsError> {
    match name.trim().trim_start_matches("TLSv").trim_start_matches("tls") {
        "1.2" => Ok(&rustls::version::TLS12),
        "1.3" => Ok(&rustls::version::TLS13),
        _ => Err(TlsError::Policy(format!("unknown TLS version: {}", name))),
    }
}

fn parse_cipher_suite(name: &str) -> Result<SupportedCipherSuite, TlsError> {
    provider::ALL_CIPHER_SUITES
        .iter()
        .find(|suite| format!("{:?}", suite.suite()) == name)
        .copied()
        .ok_or_else(|| TlsError::Policy(format!("unknown cipher suite: {}", name)))
}

fn parse_curve(name: &str) -> Result<&'static dyn SupportedKxGroup, TlsError> {
    match name.to_ascii_lowercase().as_str() {
        "x25519" => Ok(provider::kx_group::X25519),
        "p-256" | "p256" | "secp256r1" | "prime256v1" => Ok(provider::kx_group::SECP256R1),
        "p-384" | "p384" | "secp384r1" => Ok(provider::kx_group::SECP384R1),
        _ => Err(TlsError::Policy(format!("unknown curve: {}", name))),
    }
}

/// Per-host TLS source
#[derive(Debug, Clone)]
pub struct HostTls {
    pub host: String,
    pub auto: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub email: Option<String>,
    pub staging: bool,
}

impl HostTls {
    /// Host served from a static certificate/key pair on disk.
    pub fn static_pair(
        host: impl Into<String>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            auto: false,
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
            email: None,
            staging: false,
        }
    }

    /// Host with automatically provisioned certificates.
    pub fn auto(host: impl Into<String>, email: Option<String>) -> Self {
        Self {
            host: host.into(),
            auto: true,
            cert_path: None,
            key_path: None,
            email,
            staging: false,
        }
    }
}

/// Builds the TLS termination state for one listener.
///
/// Any failure here (unreadable static pair, uninitializable certificate
/// cache) aborts startup: there is no safe partial-TLS state to run with.
pub struct ServerTlsBuilder {
    policy: TlsPolicy,
    store: Arc<CertStore>,
    cache_root: PathBuf,
    auto: HashMap<String, Arc<AutoCertManager>>,
}

impl ServerTlsBuilder {
    pub fn new(policy: TlsPolicy, store: Arc<CertStore>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            store,
            cache_root: cache_root.into(),
            auto: HashMap::new(),
        }
    }

    /// Configure one virtual host.
    pub fn add_host(&mut self, host: &HostTls) -> Result<&mut Self, TlsError> {
        if host.auto {
            let manager = AutoCertManager::new(
                &host.host,
                host.email.as_deref(),
                host.staging,
                &self.cache_root,
            )?;
            self.attach_manager(Arc::new(manager));
        } else {
            let (cert_path, key_path) = match (&host.cert_path, &host.key_path) {
                (Some(cert), Some(key)) => (cert, key),
                _ => return Err(TlsError::IncompleteStatic(host.host.clone())),
            };
            self.store
                .put(&host.host, &CertificatePair::new(cert_path, key_path))?;
        }
        Ok(self)
    }

    /// Attach a pre-built certificate manager for its host.
    pub fn attach_manager(&mut self, manager: Arc<AutoCertManager>) -> &mut Self {
        self.auto.insert(manager.host().to_string(), manager);
        self
    }

    /// Finish, producing the terminator for this listener.
    pub fn build(self) -> Result<TlsTerminator, TlsError> {
        if self.store.is_empty() && self.auto.is_empty() {
            return Err(TlsError::NoHosts);
        }

        let sni = Arc::new(SniResolver::new(self.store.clone()));
        let static_config = Arc::new(self.policy.server_config(sni.clone())?);

        tracing::info!(
            "🔐 TLS configured: {} static host(s), {} auto host(s)",
            self.store.len(),
            self.auto.len()
        );

        Ok(TlsTerminator {
            policy: self.policy,
            sni,
            static_config,
            auto: self.auto,
            auto_configs: RwLock::new(HashMap::new()),
        })
    }
}

/// Cached per-host server configuration for the auto path, keyed by the
/// identity of the certificate it was built around.
struct CachedAutoConfig {
    /// Address of the [`CertifiedKey`] allocation, compared only.
    key_id: usize,
    config: Arc<ServerConfig>,
}

/// Terminates TLS for one listener.
///
/// The certificate-resolution strategy is chosen per connection from the
/// announced server name: hosts with an attached [`AutoCertManager`] go
/// through on-demand issuance, everything else through the exact-match
/// [`SniResolver`] over the certificate store.
pub struct TlsTerminator {
    policy: TlsPolicy,
    sni: Arc<SniResolver>,
    static_config: Arc<ServerConfig>,
    auto: HashMap<String, Arc<AutoCertManager>>,
    auto_configs: RwLock<HashMap<String, CachedAutoConfig>>,
}

impl TlsTerminator {
    /// The listener-wide rustls configuration (static resolution path).
    pub fn rustls_config(&self) -> Arc<ServerConfig> {
        self.static_config.clone()
    }

    /// Manager attached for `host`, if it is automatically provisioned.
    pub fn manager(&self, host: &str) -> Option<&Arc<AutoCertManager>> {
        self.auto.get(host)
    }

    /// Perform the TLS handshake on an accepted connection.
    ///
    /// Failures are scoped to this one connection; the listener and all
    /// other connections are unaffected.
    pub async fn terminate<IO>(
        &self,
        stream: IO,
    ) -> Result<tokio_rustls::server::TlsStream<IO>, HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        // No auto hosts: the store-backed resolver handles everything
        // inside the handshake itself.
        if self.auto.is_empty() {
            let acceptor = TlsAcceptor::from(self.static_config.clone());
            return Ok(acceptor.accept(stream).await?);
        }

        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;

        let server_name = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .ok_or(HandshakeError::NoServerName)?;

        let config = self.resolve_config(&server_name).await?;
        Ok(start.into_stream(config).await?)
    }

    /// Pick the resolution path for one handshake.
    async fn resolve_config(&self, server_name: &str) -> Result<Arc<ServerConfig>, HandshakeError> {
        if let Some(manager) = self.auto.get(server_name) {
            let key = manager.certificate(server_name).await?;
            return Ok(self.auto_config_for(server_name, key)?);
        }

        // Fail the handshake early with a named error when the store has
        // no entry; otherwise let the store resolver present it.
        self.sni.lookup(server_name)?;
        Ok(self.static_config.clone())
    }

    /// Reuse the per-host server configuration until the manager rotates
    /// the certificate underneath it.
    fn auto_config_for(
        &self,
        host: &str,
        key: Arc<CertifiedKey>,
    ) -> Result<Arc<ServerConfig>, rustls::Error> {
        let key_id = Arc::as_ptr(&key) as usize;

        if let Some(cached) = self.auto_configs.read().get(host) {
            if cached.key_id == key_id {
                return Ok(cached.config.clone());
            }
        }

        let config = Arc::new(
            self.policy
                .server_config(Arc::new(SingleCertResolver(key)))?,
        );

        self.auto_configs.write().insert(
            host.to_string(),
            CachedAutoConfig {
                key_id,
                config: config.clone(),
            },
        );

        Ok(config)
    }
}
