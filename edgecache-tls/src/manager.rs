//! Automatic certificate manager
//!
//! One manager instance per auto-provisioned host. Each instance owns a
//! scoped filesystem cache for issued certificates, an allow-list
//! containing exactly its host, and the issuance machinery; nothing is
//! shared between managers, so an issuance failure for one host cannot
//! leak into another.

use crate::acme::{
    unix_now, AcmeError, AcmeIssuer, IssuedCertificate, Issuer, MemoryChallengeHandler,
    RENEWAL_WINDOW_SECS,
};
use crate::cert_store::parse_certified_key;
use parking_lot::{Mutex, RwLock};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long a single handshake-time issuance may take before the
/// triggering handshake is failed instead of left hanging.
const ISSUE_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum delay between issuance attempts after a failure, so a
/// sustained outage does not turn every handshake into a request storm
/// against the authority.
const RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Automatic certificate management errors
#[derive(Debug, Error)]
pub enum AutoCertError {
    #[error("Failed to initialize certificate cache at {path:?}: {source}")]
    CacheInit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Host {0} is not in the allow-list")]
    NotAllowed(String),

    #[error("Issuance failed for {host}: {source}")]
    Issuance {
        host: String,
        #[source]
        source: AcmeError,
    },

    #[error("Issuance timed out for {0}")]
    Timeout(String),

    #[error("Issuance for {0} is backing off after a recent failure")]
    Backoff(String),

    #[error("Authority returned unusable certificate for {host}: {reason}")]
    Invalid { host: String, reason: String },
}

/// Persisted form of an issued certificate, stored in the scoped cache
/// directory so it survives process restarts.
#[derive(Serialize, Deserialize)]
struct CertificateData {
    cert_pem: String,
    key_pem: String,
    domains: Vec<String>,
    expires_at: i64,
}

const CERTIFICATE_FILE: &str = "certificate.json";

struct CachedCert {
    key: Arc<CertifiedKey>,
    expires_at: i64,
}

impl CachedCert {
    fn is_expired(&self) -> bool {
        self.expires_at <= unix_now()
    }

    fn needs_renewal(&self) -> bool {
        self.expires_at - unix_now() < RENEWAL_WINDOW_SECS
    }
}

/// Manages the certificate lifecycle for one automatically provisioned
/// host: on-demand issuance on the first handshake, cached reuse, lazy
/// renewal ahead of expiry, persistence across restarts.
pub struct AutoCertManager {
    host: String,
    /// Hosts eligible for issuance. Grown only during startup
    /// configuration; in this design it contains exactly `host`.
    allowed_hosts: HashSet<String>,
    cache_dir: PathBuf,
    issuer: Arc<dyn Issuer>,
    challenges: Arc<MemoryChallengeHandler>,
    cached: RwLock<Option<CachedCert>>,
    /// Serializes issuance for this host so concurrent first handshakes
    /// coalesce into a single order.
    issue_gate: tokio::sync::Mutex<()>,
    last_failure: Mutex<Option<Instant>>,
    renewing: AtomicBool,
    issue_timeout: Duration,
    retry_backoff: Duration,
}

impl AutoCertManager {
    /// Create a manager for `host`, backed by the real ACME issuer.
    ///
    /// Fails if the scoped cache directory under `cache_root` cannot be
    /// created; that is a startup error, not a handshake error.
    pub fn new(
        host: impl Into<String>,
        email: Option<&str>,
        staging: bool,
        cache_root: &Path,
    ) -> Result<Self, AutoCertError> {
        let mut issuer = if staging {
            AcmeIssuer::staging()
        } else {
            AcmeIssuer::new()
        };
        if let Some(email) = email {
            issuer = issuer.with_email(email);
        }

        Self::with_issuer(host, cache_root, Arc::new(issuer))
    }

    /// Create a manager with a custom issuance strategy.
    pub fn with_issuer(
        host: impl Into<String>,
        cache_root: &Path,
        issuer: Arc<dyn Issuer>,
    ) -> Result<Self, AutoCertError> {
        let host = host.into();
        let cache_dir = cache_root.join(&host);

        std::fs::create_dir_all(&cache_dir).map_err(|source| AutoCertError::CacheInit {
            path: cache_dir.clone(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&cache_dir, std::fs::Permissions::from_mode(0o700)).map_err(
                |source| AutoCertError::CacheInit {
                    path: cache_dir.clone(),
                    source,
                },
            )?;
        }

        let mut allowed_hosts = HashSet::new();
        allowed_hosts.insert(host.clone());

        let manager = Self {
            cached: RwLock::new(Self::load_persisted(&host, &cache_dir)),
            host,
            allowed_hosts,
            cache_dir,
            issuer,
            challenges: Arc::new(MemoryChallengeHandler::new()),
            issue_gate: tokio::sync::Mutex::new(()),
            last_failure: Mutex::new(None),
            renewing: AtomicBool::new(false),
            issue_timeout: ISSUE_TIMEOUT,
            retry_backoff: RETRY_BACKOFF,
        };

        Ok(manager)
    }

    /// Override the handshake-time issuance timeout.
    pub fn with_issue_timeout(mut self, timeout: Duration) -> Self {
        self.issue_timeout = timeout;
        self
    }

    /// Override the minimum delay between failed issuance attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Scoped cache directory, exclusive to this manager.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Whether `server_name` may be issued for by this manager.
    pub fn is_allowed(&self, server_name: &str) -> bool {
        self.allowed_hosts.contains(server_name)
    }

    /// HTTP-01 token store, for the fronting HTTP listener to serve.
    pub fn challenge_handler(&self) -> Arc<MemoryChallengeHandler> {
        self.challenges.clone()
    }

    /// Whether a still-valid certificate is cached.
    pub fn has_certificate(&self) -> bool {
        self.cached.read().as_ref().is_some_and(|c| !c.is_expired())
    }

    /// Resolve the certificate for one handshake.
    ///
    /// Serves the cached certificate when it is still valid (kicking off a
    /// background renewal when it is close to expiry); otherwise performs
    /// issuance inline, blocking only the calling handshake, bounded by the
    /// issuance timeout.
    pub async fn certificate(
        self: &Arc<Self>,
        server_name: &str,
    ) -> Result<Arc<CertifiedKey>, AutoCertError> {
        if !self.is_allowed(server_name) {
            return Err(AutoCertError::NotAllowed(server_name.to_string()));
        }

        if let Some(key) = self.cached_valid_key() {
            return Ok(key);
        }

        if self.in_backoff() {
            return Err(AutoCertError::Backoff(self.host.clone()));
        }

        let _gate = self.issue_gate.lock().await;

        // Another handshake may have finished issuance while we waited.
        if let Some(cached) = self.cached.read().as_ref() {
            if !cached.is_expired() {
                return Ok(cached.key.clone());
            }
        }

        // Or failed while we waited; a gate waiter must not retry inside
        // the backoff window either.
        if self.in_backoff() {
            return Err(AutoCertError::Backoff(self.host.clone()));
        }

        tracing::info!("🔐 Obtaining certificate for {} on demand", self.host);
        self.obtain().await
    }

    /// Return the cached key when usable, scheduling renewal when the
    /// validity window is closing.
    fn cached_valid_key(self: &Arc<Self>) -> Option<Arc<CertifiedKey>> {
        let cached = self.cached.read();
        let cert = cached.as_ref()?;
        if cert.is_expired() {
            return None;
        }
        if cert.needs_renewal() {
            self.spawn_renewal();
        }
        Some(cert.key.clone())
    }

    fn in_backoff(&self) -> bool {
        self.last_failure
            .lock()
            .is_some_and(|at| at.elapsed() < self.retry_backoff)
    }

    /// Run one issuance attempt and cache + persist the result.
    async fn obtain(&self) -> Result<Arc<CertifiedKey>, AutoCertError> {
        let domains = vec![self.host.clone()];

        let issued = match tokio::time::timeout(
            self.issue_timeout,
            self.issuer.issue(&domains, self.challenges.as_ref()),
        )
        .await
        {
            Err(_) => {
                *self.last_failure.lock() = Some(Instant::now());
                tracing::warn!("⏰ Issuance timed out for {}", self.host);
                return Err(AutoCertError::Timeout(self.host.clone()));
            }
            Ok(Err(source)) => {
                *self.last_failure.lock() = Some(Instant::now());
                tracing::warn!("❌ Issuance failed for {}: {}", self.host, source);
                return Err(AutoCertError::Issuance {
                    host: self.host.clone(),
                    source,
                });
            }
            Ok(Ok(issued)) => issued,
        };

        let key = parse_certified_key(issued.cert_pem.as_bytes(), issued.key_pem.as_bytes())
            .map_err(|reason| AutoCertError::Invalid {
                host: self.host.clone(),
                reason,
            })?;
        let key = Arc::new(key);

        if let Err(e) = self.persist(&issued).await {
            // The certificate is still usable for this process lifetime.
            tracing::warn!("⚠️ Failed to persist certificate for {}: {}", self.host, e);
        }

        *self.cached.write() = Some(CachedCert {
            key: key.clone(),
            expires_at: issued.expires_at,
        });
        *self.last_failure.lock() = None;

        tracing::info!("🎉 Certificate ready for {}", self.host);
        Ok(key)
    }

    /// Renew out of band. Handshakes keep being served the still-valid
    /// cached certificate while this runs.
    fn spawn_renewal(self: &Arc<Self>) {
        if self.renewing.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _gate = manager.issue_gate.lock().await;

            let still_needed = manager
                .cached
                .read()
                .as_ref()
                .map(|c| c.needs_renewal())
                .unwrap_or(true);

            if still_needed && !manager.in_backoff() {
                tracing::info!("🔄 Renewing certificate for {}", manager.host);
                if let Err(e) = manager.obtain().await {
                    tracing::warn!("❌ Renewal failed for {}: {}", manager.host, e);
                }
            }

            manager.renewing.store(false, Ordering::SeqCst);
        });
    }

    async fn persist(&self, issued: &IssuedCertificate) -> std::io::Result<()> {
        let data = CertificateData {
            cert_pem: issued.cert_pem.clone(),
            key_pem: issued.key_pem.clone(),
            domains: issued.domains.clone(),
            expires_at: issued.expires_at,
        };

        let json = serde_json::to_string_pretty(&data)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        tokio::fs::write(self.cache_dir.join(CERTIFICATE_FILE), json).await
    }

    /// Load a previously issued certificate from the cache directory.
    /// Unreadable or expired state is discarded, not fatal.
    fn load_persisted(host: &str, cache_dir: &Path) -> Option<CachedCert> {
        let raw = std::fs::read(cache_dir.join(CERTIFICATE_FILE)).ok()?;

        let data: CertificateData = match serde_json::from_slice(&raw) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("🗑️ Discarding unreadable certificate cache for {}: {}", host, e);
                return None;
            }
        };

        if data.expires_at <= unix_now() {
            tracing::info!("⏰ Persisted certificate for {} has expired", host);
            return None;
        }

        match parse_certified_key(data.cert_pem.as_bytes(), data.key_pem.as_bytes()) {
            Ok(key) => {
                tracing::info!("💾 Reusing persisted certificate for {}", host);
                Some(CachedCert {
                    key: Arc::new(key),
                    expires_at: data.expires_at,
                })
            }
            Err(reason) => {
                tracing::warn!("🗑️ Discarding invalid certificate cache for {}: {}", host, reason);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{AcmeError, ChallengeHandler, Issuer};
    use crate::cert_store::test_support::self_signed_pem;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Issuer stub that mints self-signed certificates and counts calls.
    struct StubIssuer {
        calls: AtomicUsize,
        delay: Duration,
        lifetime_secs: i64,
    }

    impl StubIssuer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                lifetime_secs: 90 * 24 * 60 * 60,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Issuer for StubIssuer {
        async fn issue(
            &self,
            domains: &[String],
            _challenges: &dyn ChallengeHandler,
        ) -> Result<IssuedCertificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let (cert_pem, key_pem) = self_signed_pem(&domains[0]);
            Ok(IssuedCertificate {
                cert_pem,
                key_pem,
                domains: domains.to_vec(),
                expires_at: unix_now() + self.lifetime_secs,
            })
        }
    }

    /// Issuer stub that always fails.
    struct FailingIssuer {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FailingIssuer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Issuer for FailingIssuer {
        async fn issue(
            &self,
            _domains: &[String],
            _challenges: &dyn ChallengeHandler,
        ) -> Result<IssuedCertificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Err(AcmeError::OrderFailed("authority unreachable".to_string()))
        }
    }

    fn manager_with(
        host: &str,
        root: &TempDir,
        issuer: Arc<dyn Issuer>,
    ) -> Arc<AutoCertManager> {
        Arc::new(AutoCertManager::with_issuer(host, root.path(), issuer).unwrap())
    }

    #[test]
    fn test_scoped_cache_dirs_never_shared() {
        let root = TempDir::new().unwrap();
        let a = manager_with("a.example.com", &root, Arc::new(StubIssuer::new()));
        let b = manager_with("b.example.com", &root, Arc::new(StubIssuer::new()));

        assert_ne!(a.cache_dir(), b.cache_dir());
        assert!(a.cache_dir().is_dir());
        assert!(b.cache_dir().is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_dir_permissions_restrictive() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let manager = manager_with("a.example.com", &root, Arc::new(StubIssuer::new()));

        let mode = std::fs::metadata(manager.cache_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_cache_init_failure_is_fatal_at_construction() {
        let root = TempDir::new().unwrap();
        let blocking_file = root.path().join("not-a-dir");
        std::fs::write(&blocking_file, b"x").unwrap();

        let result =
            AutoCertManager::with_issuer("a.example.com", &blocking_file, Arc::new(StubIssuer::new()));
        assert!(matches!(result, Err(AutoCertError::CacheInit { .. })));
    }

    #[tokio::test]
    async fn test_host_policy_rejects_unlisted_names() {
        let root = TempDir::new().unwrap();
        let stub = Arc::new(StubIssuer::new());
        let manager = manager_with("a.example.com", &root, stub.clone());

        let err = manager.certificate("evil.example.com").await.unwrap_err();
        assert!(matches!(err, AutoCertError::NotAllowed(_)));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_first_handshake_issues_second_hits_cache() {
        let root = TempDir::new().unwrap();
        let stub = Arc::new(StubIssuer::new());
        let manager = manager_with("a.example.com", &root, stub.clone());

        let first = manager.certificate("a.example.com").await.unwrap();
        assert_eq!(stub.calls(), 1);

        let second = manager.certificate("a.example.com").await.unwrap();
        assert_eq!(stub.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_concurrent_first_handshakes_coalesce() {
        let root = TempDir::new().unwrap();
        let stub = Arc::new(StubIssuer::new().with_delay(Duration::from_millis(50)));
        let manager = manager_with("a.example.com", &root, stub.clone());

        let (r1, r2) = tokio::join!(
            manager.certificate("a.example.com"),
            manager.certificate("a.example.com"),
        );

        assert!(r1.is_ok());
        assert!(r2.is_ok());
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_issuance_failure_fails_only_that_handshake() {
        let root = TempDir::new().unwrap();
        let failing = Arc::new(FailingIssuer::new());
        let a = manager_with("a.example.com", &root, failing);

        let stub = Arc::new(StubIssuer::new());
        let b = manager_with("b.example.com", &root, stub.clone());

        assert!(matches!(
            a.certificate("a.example.com").await,
            Err(AutoCertError::Issuance { .. })
        ));

        // Host B is unaffected by A's failure.
        assert!(b.certificate("b.example.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_backoff_between_failed_attempts() {
        let root = TempDir::new().unwrap();
        let failing = Arc::new(FailingIssuer::new());
        let manager = manager_with("a.example.com", &root, failing.clone());

        assert!(matches!(
            manager.certificate("a.example.com").await,
            Err(AutoCertError::Issuance { .. })
        ));
        assert!(matches!(
            manager.certificate("a.example.com").await,
            Err(AutoCertError::Backoff(_))
        ));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gate_waiter_respects_backoff_after_failure() {
        let root = TempDir::new().unwrap();
        let failing = Arc::new(FailingIssuer::new().with_delay(Duration::from_millis(50)));
        let manager = manager_with("a.example.com", &root, failing.clone());

        // Both handshakes start before the first attempt fails. The one
        // queued on the gate must observe the failure backoff instead of
        // contacting the authority again.
        let (r1, r2) = tokio::join!(
            manager.certificate("a.example.com"),
            manager.certificate("a.example.com"),
        );

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);

        let results = [r1, r2];
        let backoffs = results
            .iter()
            .filter(|r| matches!(r, Err(AutoCertError::Backoff(_))))
            .count();
        let issuances = results
            .iter()
            .filter(|r| matches!(r, Err(AutoCertError::Issuance { .. })))
            .count();
        assert_eq!(backoffs, 1);
        assert_eq!(issuances, 1);
    }

    #[tokio::test]
    async fn test_retry_after_backoff_elapsed() {
        let root = TempDir::new().unwrap();
        let failing = Arc::new(FailingIssuer::new());
        let manager = Arc::new(
            AutoCertManager::with_issuer("a.example.com", root.path(), failing.clone())
                .unwrap()
                .with_retry_backoff(Duration::ZERO),
        );

        let _ = manager.certificate("a.example.com").await;
        let _ = manager.certificate("a.example.com").await;
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_issuance_timeout_bounds_the_handshake() {
        let root = TempDir::new().unwrap();
        let slow = Arc::new(StubIssuer::new().with_delay(Duration::from_secs(5)));
        let manager = Arc::new(
            AutoCertManager::with_issuer("a.example.com", root.path(), slow)
                .unwrap()
                .with_issue_timeout(Duration::from_millis(20)),
        );

        let err = manager.certificate("a.example.com").await.unwrap_err();
        assert!(matches!(err, AutoCertError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_certificate_survives_restart() {
        let root = TempDir::new().unwrap();

        {
            let stub = Arc::new(StubIssuer::new());
            let manager = manager_with("a.example.com", &root, stub);
            manager.certificate("a.example.com").await.unwrap();
        }

        // A fresh manager for the same host finds the persisted state and
        // never contacts the authority.
        let failing = Arc::new(FailingIssuer::new());
        let manager = manager_with("a.example.com", &root, failing.clone());

        assert!(manager.has_certificate());
        assert!(manager.certificate("a.example.com").await.is_ok());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_persisted_state_is_discarded() {
        let root = TempDir::new().unwrap();
        let cache_dir = root.path().join("a.example.com");
        std::fs::create_dir_all(&cache_dir).unwrap();

        let (cert_pem, key_pem) = self_signed_pem("a.example.com");
        let data = CertificateData {
            cert_pem,
            key_pem,
            domains: vec!["a.example.com".to_string()],
            expires_at: unix_now() - 60,
        };
        std::fs::write(
            cache_dir.join(CERTIFICATE_FILE),
            serde_json::to_string(&data).unwrap(),
        )
        .unwrap();

        let stub = Arc::new(StubIssuer::new());
        let manager = manager_with("a.example.com", &root, stub.clone());

        assert!(!manager.has_certificate());
        manager.certificate("a.example.com").await.unwrap();
        assert_eq!(stub.calls(), 1);
    }
}
