//! ACME protocol client for Let's Encrypt using instant-acme
//!
//! Issues and renews certificates on behalf of the automatic certificate
//! manager. The manager talks to this module through the [`Issuer`] trait
//! so issuance can be stubbed out in tests.

use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType as AcmeChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use x509_parser::prelude::*;

/// ACME directory URLs
pub mod directory {
    /// Let's Encrypt production - for real certificates
    pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
    /// Let's Encrypt staging - for testing (not trusted)
    pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
}

/// Renew when less than 30 days of validity remain.
pub(crate) const RENEWAL_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

/// ACME error types
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Order failed: {0}")]
    OrderFailed(String),

    #[error("Certificate generation error: {0}")]
    CertGeneration(String),

    #[error("Account error: {0}")]
    Account(String),
}

/// ACME challenge types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    /// HTTP-01 challenge (port 80)
    Http01,
    /// DNS-01 challenge
    Dns01,
    /// TLS-ALPN-01 challenge (port 443)
    TlsAlpn01,
}

/// Challenge response data
#[derive(Debug, Clone)]
pub struct ChallengeResponse {
    /// Domain being validated
    pub domain: String,
    /// Challenge type
    pub challenge_type: ChallengeType,
    /// Token for HTTP-01
    pub token: String,
    /// Key authorization
    pub key_authorization: String,
}

/// An issued certificate, as returned by the authority.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Certificate chain (PEM)
    pub cert_pem: String,
    /// Private key (PEM)
    pub key_pem: String,
    /// Domains covered
    pub domains: Vec<String>,
    /// Expiry timestamp (Unix seconds)
    pub expires_at: i64,
}

impl IssuedCertificate {
    /// Whether the validity window has closed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= unix_now()
    }

    /// Whether the certificate is close enough to expiry that renewal
    /// should be attempted.
    pub fn needs_renewal(&self) -> bool {
        self.expires_at - unix_now() < RENEWAL_WINDOW_SECS
    }
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Extract the expiry of the leaf certificate from a PEM chain.
pub(crate) fn expiry_from_pem(cert_pem: &[u8]) -> Result<i64, AcmeError> {
    for pem in Pem::iter_from_buffer(cert_pem) {
        let pem = pem.map_err(|e| AcmeError::CertGeneration(e.to_string()))?;
        if pem.label == "CERTIFICATE" {
            let (_, cert) = X509Certificate::from_der(&pem.contents)
                .map_err(|e| AcmeError::CertGeneration(e.to_string()))?;
            return Ok(cert.validity().not_after.timestamp());
        }
    }

    Err(AcmeError::CertGeneration(
        "no certificate found in PEM chain".to_string(),
    ))
}

/// Callback for handling ACME challenges
pub trait ChallengeHandler: Send + Sync {
    /// Deploy a challenge response (make it accessible to the authority)
    fn deploy(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError>;

    /// Clean up a challenge response
    fn cleanup(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError>;
}

/// HTTP-01 challenge handler that stores tokens in memory.
///
/// The fronting HTTP listener serves these tokens under
/// `/.well-known/acme-challenge/<token>`.
pub struct MemoryChallengeHandler {
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryChallengeHandler {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Get the key authorization for a token
    pub fn get_token(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }
}

impl Default for MemoryChallengeHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeHandler for MemoryChallengeHandler {
    fn deploy(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError> {
        self.tokens
            .write()
            .insert(challenge.token.clone(), challenge.key_authorization.clone());
        Ok(())
    }

    fn cleanup(&self, challenge: &ChallengeResponse) -> Result<(), AcmeError> {
        self.tokens.write().remove(&challenge.token);
        Ok(())
    }
}

/// Certificate issuance strategy.
///
/// Production uses [`AcmeIssuer`]; tests substitute a stub to observe how
/// often issuance is attempted.
#[async_trait]
pub trait Issuer: Send + Sync {
    async fn issue(
        &self,
        domains: &[String],
        challenges: &dyn ChallengeHandler,
    ) -> Result<IssuedCertificate, AcmeError>;
}

/// ACME issuer backed by instant-acme
pub struct AcmeIssuer {
    /// Use the staging environment
    staging: bool,
    /// Account email
    email: Option<String>,
    /// Preferred challenge type
    challenge_type: ChallengeType,
}

impl AcmeIssuer {
    /// Create a new production issuer
    pub fn new() -> Self {
        Self {
            staging: false,
            email: None,
            challenge_type: ChallengeType::Http01,
        }
    }

    /// Create a staging issuer (for testing)
    pub fn staging() -> Self {
        Self {
            staging: true,
            email: None,
            challenge_type: ChallengeType::Http01,
        }
    }

    /// Set the account email
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the preferred challenge type
    pub fn with_challenge_type(mut self, challenge_type: ChallengeType) -> Self {
        self.challenge_type = challenge_type;
        self
    }

    fn directory_url(&self) -> &'static str {
        if self.staging {
            directory::LETS_ENCRYPT_STAGING
        } else {
            directory::LETS_ENCRYPT_PRODUCTION
        }
    }

    /// Register an account with the authority.
    ///
    /// Terms of service are accepted unconditionally: this runs inside a
    /// server process, there is nobody to prompt.
    async fn create_account(&self) -> Result<Account, AcmeError> {
        let builder = Account::builder()
            .map_err(|e| AcmeError::Account(format!("Failed to create account builder: {}", e)))?;

        let contact: Vec<String> = self
            .email
            .as_ref()
            .map(|e| vec![format!("mailto:{}", e)])
            .unwrap_or_default();
        let contact_refs: Vec<&str> = contact.iter().map(|s| s.as_str()).collect();

        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, _credentials) = builder
            .create(&new_account, self.directory_url().to_string(), None)
            .await
            .map_err(|e| AcmeError::Account(format!("Failed to create account: {}", e)))?;

        Ok(account)
    }
}

impl Default for AcmeIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Issuer for AcmeIssuer {
    async fn issue(
        &self,
        domains: &[String],
        challenges: &dyn ChallengeHandler,
    ) -> Result<IssuedCertificate, AcmeError> {
        tracing::info!("🔐 Requesting certificate for {:?} from {}", domains, self.directory_url());

        let account = self.create_account().await?;

        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderFailed(format!("Failed to create order: {}", e)))?;

        let mut auths_stream = order.authorizations();
        let mut deployed = Vec::new();

        while let Some(auth_result) = auths_stream.next().await {
            let mut auth_handle = auth_result
                .map_err(|e| AcmeError::OrderFailed(format!("Failed to get authorization: {}", e)))?;

            if auth_handle.status == AuthorizationStatus::Valid {
                continue;
            }

            let domain = auth_handle.identifier().to_string();
            tracing::debug!("🎯 Processing authorization for {}", domain);

            let challenge_type = match self.challenge_type {
                ChallengeType::Http01 => AcmeChallengeType::Http01,
                ChallengeType::Dns01 => AcmeChallengeType::Dns01,
                ChallengeType::TlsAlpn01 => AcmeChallengeType::TlsAlpn01,
            };

            let mut challenge_handle = auth_handle.challenge(challenge_type).ok_or_else(|| {
                AcmeError::ChallengeFailed(format!(
                    "No {:?} challenge available for {}",
                    self.challenge_type, domain
                ))
            })?;

            let token = challenge_handle.token.clone();
            let key_authorization = challenge_handle.key_authorization().as_str().to_string();

            let response = ChallengeResponse {
                domain: domain.clone(),
                challenge_type: self.challenge_type,
                token,
                key_authorization,
            };

            challenges.deploy(&response)?;
            tracing::debug!("🚀 Challenge deployed for {}", domain);

            challenge_handle.set_ready().await.map_err(|e| {
                AcmeError::ChallengeFailed(format!("Failed to set challenge ready: {}", e))
            })?;

            deployed.push(response);
        }

        let retry_policy = instant_acme::RetryPolicy::default();
        let status = order
            .poll_ready(&retry_policy)
            .await
            .map_err(|e| AcmeError::ChallengeFailed(format!("Order validation failed: {}", e)));

        for response in &deployed {
            let _ = challenges.cleanup(response);
        }

        let status = status?;
        if status != OrderStatus::Ready && status != OrderStatus::Valid {
            return Err(AcmeError::OrderFailed(format!(
                "Order status is {:?} (not Ready or Valid)",
                status
            )));
        }

        let key_pem = order
            .finalize()
            .await
            .map_err(|e| AcmeError::OrderFailed(format!("Failed to finalize order: {}", e)))?;

        let cert_pem = order
            .poll_certificate(&retry_policy)
            .await
            .map_err(|e| AcmeError::OrderFailed(format!("Failed to get certificate: {}", e)))?;

        let expires_at = expiry_from_pem(cert_pem.as_bytes())?;

        tracing::info!("🎉 Certificate obtained for {:?}", domains);

        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            domains: domains.to_vec(),
            expires_at,
        })
    }
}
