//! Configuration loader

use crate::config::EdgecacheConfig;
use crate::error::{Error, Result};
use std::path::Path;

/// Configuration loader for various formats
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<EdgecacheConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config = match ext {
            "json" => Self::from_json(&content),
            "toml" => Self::from_toml(&content),
            _ => Err(Error::Config(format!("Unknown config format: {}", ext))),
        }?;

        tracing::info!("📋 Loaded configuration from {} ({} host(s))", path.display(), config.hosts.len());
        Ok(config)
    }

    /// Parse JSON configuration
    pub fn from_json(content: &str) -> Result<EdgecacheConfig> {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("Invalid JSON: {}", e)))
    }

    /// Parse TOML configuration
    pub fn from_toml(content: &str) -> Result<EdgecacheConfig> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_loading() {
        let json = r#"{"hosts": []}"#;
        let config = ConfigLoader::from_json(json).unwrap();
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_toml_loading() {
        let toml = r#"
bind = "127.0.0.1:8443"

[[hosts]]
host = "example.com"

[hosts.tls]
auto = true
acme_email = "ops@example.com"

[[hosts]]
host = "static.example.com"

[hosts.tls]
cert = "/etc/ssl/static.pem"
key = "/etc/ssl/static.key"
"#;
        let config = ConfigLoader::from_toml(toml).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8443");
        assert_eq!(config.hosts.len(), 2);
        assert!(config.hosts[0].tls.as_ref().unwrap().auto);
        assert!(!config.hosts[1].tls.as_ref().unwrap().auto);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(ConfigLoader::from_json("{not json").is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("edgecache.toml");
        std::fs::write(&path, "bind = \"127.0.0.1:9443\"\n").unwrap();

        let config = ConfigLoader::load(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9443");
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("edgecache.yaml");
        std::fs::write(&path, "bind: nope").unwrap();

        assert!(ConfigLoader::load(&path).is_err());
    }
}
