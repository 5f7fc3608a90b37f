//! Configuration for the keyless signing server
//!
//! The configuration is a single TOML file describing the zone the server is
//! authoritative for, the key material it signs with, the HTTPS API surface,
//! and the ACME account used to keep both certificates current.
//!
//! Everything here is immutable after [`Config::load`] returns; the rest of
//! the server receives it behind an `Arc` and never writes back.
//!
//! # Example
//!
//! ```toml
//! domain = "example.com."
//! nameserver = "ns.example.com."
//! cname = "edge.example.net."
//!
//! certificate = "/var/lib/keyless/certificate.pem"
//! master_key = "/var/lib/keyless/master.key"
//! legacy_keys = "/var/lib/keyless/legacy/*.key"
//!
//! [api]
//! handler = "api.example.com/keyless"
//! certificate = "/var/lib/keyless/api.pem"
//! key = "/var/lib/keyless/api.key"
//! client_ca = "/var/lib/keyless/clients.pem"
//!
//! [letsencrypt]
//! account = "/var/lib/keyless/account.json"
//! account_key = "/var/lib/keyless/account.key"
//! email = "hostmaster@example.com"
//! production = true
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or is missing required fields
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required field is empty
    #[error("{0} is not configured")]
    Missing(&'static str),
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Top-level server configuration, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Fully-qualified zone this server is authoritative for
    pub domain: String,

    /// FQDN advertised in SOA and NS answers
    pub nameserver: String,

    /// Optional apex delegate, answered as a CNAME for unmatched apex queries
    #[serde(default)]
    pub cname: Option<String>,

    /// Wildcard certificate chain, PEM, leaf first
    pub certificate: PathBuf,

    /// Private key backing the wildcard certificate
    pub master_key: PathBuf,

    /// Glob of retired keys that must stay addressable by fingerprint
    #[serde(default)]
    pub legacy_keys: Option<String>,

    /// HTTPS signing API
    pub api: ApiConfig,

    /// ACME account used for both certificates
    pub letsencrypt: AccountConfig,

    /// Optional peer answering challenges on our behalf (UDP address)
    #[serde(default)]
    pub replica: Option<String>,
}

/// HTTPS API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// `host/path-prefix` the API is served under
    pub handler: String,

    /// API certificate chain, PEM
    pub certificate: PathBuf,

    /// Private key backing the API certificate
    pub key: PathBuf,

    /// CA bundle for mutual TLS; client certificates are required when set
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
}

/// ACME account configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Registered account object, JSON
    pub account: PathBuf,

    /// Account private key, EC P-256 PEM
    pub account_key: PathBuf,

    /// Contact address registered with the CA during `init`
    #[serde(default)]
    pub email: Option<String>,

    /// Register against the production directory instead of staging
    #[serde(default)]
    pub production: bool,
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every required field, naming the first one that is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.is_empty() {
            return Err(ConfigError::Missing("domain"));
        }
        if self.nameserver.is_empty() {
            return Err(ConfigError::Missing("nameserver"));
        }
        if self.certificate.as_os_str().is_empty() {
            return Err(ConfigError::Missing("certificate file path"));
        }
        if self.master_key.as_os_str().is_empty() {
            return Err(ConfigError::Missing("master_key file path"));
        }
        if self.api.handler.is_empty() {
            return Err(ConfigError::Missing("api.handler"));
        }
        if self.api.certificate.as_os_str().is_empty() {
            return Err(ConfigError::Missing("api.certificate file path"));
        }
        if self.api.key.as_os_str().is_empty() {
            return Err(ConfigError::Missing("api.key file path"));
        }
        if self.letsencrypt.account.as_os_str().is_empty() {
            return Err(ConfigError::Missing("letsencrypt.account file path"));
        }
        if self.letsencrypt.account_key.as_os_str().is_empty() {
            return Err(ConfigError::Missing("letsencrypt.account_key file path"));
        }
        Ok(())
    }

    /// The zone name, lowercased with the trailing dot stripped.
    pub fn zone(&self) -> String {
        self.domain.trim_end_matches('.').to_ascii_lowercase()
    }

    /// The nameserver FQDN with the trailing dot stripped.
    pub fn nameserver_host(&self) -> String {
        self.nameserver.trim_end_matches('.').to_ascii_lowercase()
    }

    /// Hostname part of `api.handler`, if the handler carries one.
    ///
    /// The API certificate is only managed when a hostname is present.
    pub fn api_hostname(&self) -> Option<&str> {
        match self.api.handler.split_once('/') {
            Some((host, _)) if !host.is_empty() => Some(host),
            _ => None,
        }
    }

    /// Path prefix the API routes are mounted under, `""` or `/{prefix}`.
    pub fn api_path_prefix(&self) -> String {
        let path = match self.api.handler.split_once('/') {
            Some((_, rest)) => rest,
            None => return String::new(),
        };
        let path = path.trim_matches('/');
        if path.is_empty() {
            String::new()
        } else {
            format!("/{path}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        domain = "example.com."
        nameserver = "ns.example.com."
        certificate = "/tmp/cert.pem"
        master_key = "/tmp/master.key"

        [api]
        handler = "api.example.com/keyless"
        certificate = "/tmp/api.pem"
        key = "/tmp/api.key"

        [letsencrypt]
        account = "/tmp/account.json"
        account_key = "/tmp/account.key"
    "#;

    fn minimal() -> Config {
        toml::from_str(MINIMAL).unwrap()
    }

    #[test]
    fn parses_minimal_config() {
        let config = minimal();
        assert!(config.validate().is_ok());
        assert!(config.cname.is_none());
        assert!(config.replica.is_none());
        assert!(!config.letsencrypt.production);
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.domain, "example.com.");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::load("/nonexistent/keyless.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn empty_domain_is_rejected() {
        let mut config = minimal();
        config.domain.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("domain"));
    }

    #[test]
    fn empty_handler_is_rejected() {
        let mut config = minimal();
        config.api.handler.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api.handler"));
    }

    #[test]
    fn zone_strips_dot_and_case() {
        let mut config = minimal();
        config.domain = "Example.COM.".to_string();
        assert_eq!(config.zone(), "example.com");
    }

    #[test]
    fn handler_with_prefix_splits() {
        let config = minimal();
        assert_eq!(config.api_hostname(), Some("api.example.com"));
        assert_eq!(config.api_path_prefix(), "/keyless");
    }

    #[test]
    fn bare_handler_has_no_hostname_prefix() {
        let mut config = minimal();
        config.api.handler = "api.example.com".to_string();
        assert_eq!(config.api_hostname(), None);
        assert_eq!(config.api_path_prefix(), "");
    }

    #[test]
    fn handler_with_leading_slash_has_no_hostname() {
        let mut config = minimal();
        config.api.handler = "/keyless".to_string();
        assert_eq!(config.api_hostname(), None);
        assert_eq!(config.api_path_prefix(), "/keyless");
    }

    #[test]
    fn nested_prefix_is_preserved() {
        let mut config = minimal();
        config.api.handler = "api.example.com/internal/keyless/".to_string();
        assert_eq!(config.api_path_prefix(), "/internal/keyless");
    }
}
