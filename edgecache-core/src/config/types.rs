//! Configuration type definitions
//!
//! These types represent the runtime configuration for Edgecache.

use serde::{Deserialize, Serialize};

/// Root configuration for Edgecache
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EdgecacheConfig {
    /// Debug mode
    #[serde(default)]
    pub debug: bool,

    /// TLS listen address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Root directory for automatic-certificate state.
    /// Each auto-provisioned host gets its own subdirectory.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Process-wide TLS policy, applied uniformly to every host
    /// served by one listener.
    #[serde(default)]
    pub tls: TlsPolicyConfig,

    /// Virtual host configurations
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

fn default_bind() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_cache_dir() -> String {
    "/var/lib/edgecache/certs".to_string()
}

/// Process-wide TLS handshake policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsPolicyConfig {
    /// Minimum protocol version ("1.2" or "1.3")
    pub min_version: Option<String>,

    /// Maximum protocol version ("1.2" or "1.3")
    pub max_version: Option<String>,

    /// Cipher suite names (IANA form); None = provider defaults
    pub cipher_suites: Option<Vec<String>>,

    /// Elliptic-curve preference order; None = provider defaults
    pub curves: Option<Vec<String>>,
}

/// Virtual host configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    /// Hostname served by this entry (exact SNI match)
    pub host: String,

    /// TLS configuration for this host
    #[serde(default)]
    pub tls: Option<TlsHostConfig>,
}

/// Per-host TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsHostConfig {
    /// Provision the certificate automatically via ACME
    #[serde(default)]
    pub auto: bool,

    /// Certificate file path (static hosts)
    pub cert: Option<String>,

    /// Key file path (static hosts)
    pub key: Option<String>,

    /// ACME account email (auto hosts)
    pub acme_email: Option<String>,

    /// Use the Let's Encrypt staging directory (auto hosts, testing)
    #[serde(default)]
    pub acme_staging: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: EdgecacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.bind, "0.0.0.0:8443");
        assert!(config.hosts.is_empty());
        assert!(config.tls.min_version.is_none());
    }

    #[test]
    fn test_host_tls_defaults() {
        let host: HostConfig =
            serde_json::from_str(r#"{"host": "example.com", "tls": {}}"#).unwrap();
        let tls = host.tls.unwrap();
        assert!(!tls.auto);
        assert!(tls.cert.is_none());
    }
}
