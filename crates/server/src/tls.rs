//! TLS configuration and handshake-time certificate selection
//!
//! Every inbound handshake picks its certificate here: an `acme-tls/1`-only
//! client gets the broker's challenge certificate, a first-boot server with
//! keys but no certificate gets a one-day self-signed stand-in, and everyone
//! else gets the current API bundle, verified to actually cover the server
//! name. The bundle lives in a mutex'd cell that renewal swaps atomically.

use crate::acme::broker::ChallengeBroker;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

/// ALPN protocol reserved for TLS-ALPN-01 validation handshakes.
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// Errors raised while loading or building TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load certificate {path}: {message}")]
    CertificateLoad { path: PathBuf, message: String },

    #[error("failed to load private key {path}: {message}")]
    KeyLoad { path: PathBuf, message: String },

    #[error("certificate/key mismatch: {0}")]
    CertKeyMismatch(String),

    #[error("failed to build TLS config: {0}")]
    ConfigBuild(String),

    #[error("failed to generate certificate: {0}")]
    Generate(String),
}

// ============================================================================
// Certificate Cell
// ============================================================================

/// The current API certificate bundle, swapped whole by renewal.
pub struct ApiCertCell {
    inner: Mutex<Option<Arc<CertifiedKey>>>,
}

impl ApiCertCell {
    pub fn new(initial: Option<Arc<CertifiedKey>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(initial),
        })
    }

    pub fn get(&self) -> Option<Arc<CertifiedKey>> {
        self.inner.lock().clone()
    }

    pub fn replace(&self, certified: Arc<CertifiedKey>) {
        *self.inner.lock() = Some(certified);
    }
}

// ============================================================================
// Certificate Loading
// ============================================================================

/// Load a certificate chain and private key into a rustls `CertifiedKey`.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let cert_file = File::open(cert_path).map_err(|e| TlsError::CertificateLoad {
        path: cert_path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut cert_reader = BufReader::new(cert_file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad {
            path: cert_path.to_path_buf(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad {
            path: cert_path.to_path_buf(),
            message: "no certificates found in file".into(),
        });
    }

    let key_file = File::open(key_path).map_err(|e| TlsError::KeyLoad {
        path: key_path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut key_reader = BufReader::new(key_file);

    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| TlsError::KeyLoad {
            path: key_path.to_path_buf(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::KeyLoad {
            path: key_path.to_path_buf(),
            message: "no private key found in file".into(),
        })?;

    certified_key(certs, key)
}

/// Pair certificates with a signing key using the process crypto provider.
pub fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, TlsError> {
    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| TlsError::CertKeyMismatch(format!("failed to load private key: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Load CA certificates for client verification (mTLS).
pub fn load_client_ca(ca_path: &Path) -> Result<RootCertStore, TlsError> {
    let ca_file = File::open(ca_path).map_err(|e| TlsError::CertificateLoad {
        path: ca_path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut ca_reader = BufReader::new(ca_file);

    let mut root_store = RootCertStore::empty();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut ca_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad {
            path: ca_path.to_path_buf(),
            message: e.to_string(),
        })?;

    for cert in certs {
        root_store.add(cert).map_err(|e| TlsError::CertificateLoad {
            path: ca_path.to_path_buf(),
            message: format!("failed to add CA certificate: {e}"),
        })?;
    }

    if root_store.is_empty() {
        return Err(TlsError::CertificateLoad {
            path: ca_path.to_path_buf(),
            message: "no CA certificates found".into(),
        });
    }

    Ok(root_store)
}

// ============================================================================
// Generated Certificates
// ============================================================================

/// Self-signed certificate for a TLS-ALPN-01 validation handshake: the
/// `acmeIdentifier` extension carries SHA-256 of the key authorization, the
/// SAN names the validated host.
pub fn alpn_challenge_certificate(
    server_name: &str,
    key_authorization: &str,
) -> Result<Arc<CertifiedKey>, TlsError> {
    let digest = Sha256::digest(key_authorization.as_bytes());

    let mut params = rcgen::CertificateParams::new(vec![server_name.to_string()])
        .map_err(|e| TlsError::Generate(e.to_string()))?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(&digest)];

    let key_pair = rcgen::KeyPair::generate().map_err(|e| TlsError::Generate(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::Generate(e.to_string()))?;

    debug!(
        server_name,
        digest = %URL_SAFE_NO_PAD.encode(digest),
        "built tls-alpn-01 challenge certificate"
    );

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok(Arc::new(certified_key(vec![cert.der().clone()], key)?))
}

/// One-day self-signed certificate over an existing key, served while the
/// real API certificate does not exist yet so the CA's own TLS probe can
/// complete.
pub fn self_signed_for_key(key_pkcs8_der: &[u8]) -> Result<Arc<CertifiedKey>, TlsError> {
    let key_pair =
        rcgen::KeyPair::try_from(key_pkcs8_der).map_err(|e| TlsError::Generate(e.to_string()))?;

    let mut params = rcgen::CertificateParams::default();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(1);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::Generate(e.to_string()))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pkcs8_der.to_vec()));
    Ok(Arc::new(certified_key(vec![cert.der().clone()], key)?))
}

// ============================================================================
// Name Coverage
// ============================================================================

/// Whether a leaf certificate covers a server name, by exact or single-label
/// wildcard SAN match.
pub fn cert_covers(leaf_der: &[u8], server_name: &str) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(leaf_der) else {
        return false;
    };
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return false;
    };

    let name = server_name.to_ascii_lowercase();
    for general_name in &san.value.general_names {
        let GeneralName::DNSName(dns) = general_name else {
            continue;
        };
        let dns = dns.to_ascii_lowercase();
        if dns == name {
            return true;
        }
        if let (Some(wildcard_base), Some((_, parent))) =
            (dns.strip_prefix("*."), name.split_once('.'))
        {
            if wildcard_base == parent {
                return true;
            }
        }
    }
    false
}

// ============================================================================
// Handshake Resolver
// ============================================================================

/// Exactly `{"acme-tls/1"}` identifies a validation handshake.
pub fn is_acme_alpn<'a>(mut protocols: impl Iterator<Item = &'a [u8]>) -> bool {
    match (protocols.next(), protocols.next()) {
        (Some(first), None) => first == ACME_TLS_ALPN,
        _ => false,
    }
}

/// Per-handshake certificate selection.
pub struct CertResolver {
    cell: Arc<ApiCertCell>,
    broker: Arc<ChallengeBroker>,
    api_key_pkcs8: Vec<u8>,
}

impl CertResolver {
    pub fn new(cell: Arc<ApiCertCell>, broker: Arc<ChallengeBroker>, api_key_pkcs8: Vec<u8>) -> Self {
        Self {
            cell,
            broker,
            api_key_pkcs8,
        }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        // SNI is required; certificates are selected by name.
        let server_name = client_hello.server_name()?.to_owned();

        if client_hello.alpn().is_some_and(is_acme_alpn) {
            return self.broker.tls_alpn_certificate(&server_name);
        }

        match self.cell.get() {
            Some(certified) => {
                let leaf = certified.end_entity_cert().ok()?;
                if cert_covers(leaf.as_ref(), &server_name) {
                    Some(certified)
                } else {
                    debug!(server_name, "api certificate does not cover server name");
                    None
                }
            }
            None => match self_signed_for_key(&self.api_key_pkcs8) {
                Ok(certified) => Some(certified),
                Err(e) => {
                    warn!(error = %e, "failed to build first-boot certificate");
                    None
                }
            },
        }
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("has_bundle", &self.cell.get().is_some())
            .finish()
    }
}

/// Build the API listener's TLS configuration: our resolver, optional mTLS,
/// and the three allowed ALPN protocols.
pub fn build_server_config(
    resolver: Arc<CertResolver>,
    client_ca: Option<&Path>,
) -> Result<ServerConfig, TlsError> {
    let builder = ServerConfig::builder();

    let mut config = match client_ca {
        Some(ca_path) => {
            let root_store = load_client_ca(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
                .build()
                .map_err(|e| TlsError::ConfigBuild(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_cert_resolver(resolver)
        }
        None => builder.with_no_client_auth().with_cert_resolver(resolver),
    };

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec(), ACME_TLS_ALPN.to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_der_for(names: &[&str]) -> Vec<u8> {
        let params =
            rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let key_pair = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().der().to_vec()
    }

    #[test]
    fn exact_san_match() {
        let der = leaf_der_for(&["api.example.com"]);
        assert!(cert_covers(&der, "api.example.com"));
        assert!(cert_covers(&der, "API.EXAMPLE.COM"));
        assert!(!cert_covers(&der, "other.example.com"));
    }

    #[test]
    fn wildcard_san_matches_one_label() {
        let der = leaf_der_for(&["*.example.com"]);
        assert!(cert_covers(&der, "foo.example.com"));
        assert!(cert_covers(&der, "*.example.com"));
        assert!(!cert_covers(&der, "example.com"));
        assert!(!cert_covers(&der, "a.b.example.com"));
    }

    #[test]
    fn acme_alpn_detection_is_exact() {
        assert!(is_acme_alpn([ACME_TLS_ALPN].into_iter()));
        assert!(!is_acme_alpn([&b"h2"[..]].into_iter()));
        assert!(!is_acme_alpn(
            [ACME_TLS_ALPN, &b"http/1.1"[..]].into_iter()
        ));
        assert!(!is_acme_alpn(std::iter::empty()));
    }

    #[test]
    fn challenge_certificate_carries_the_san() {
        let certified = alpn_challenge_certificate("example.com", "token.thumbprint").unwrap();
        let leaf = certified.end_entity_cert().unwrap();
        assert!(cert_covers(leaf.as_ref(), "example.com"));
    }

    #[test]
    fn cell_replacement_is_visible() {
        let cell = ApiCertCell::new(None);
        assert!(cell.get().is_none());

        let certified = alpn_challenge_certificate("example.com", "ka").unwrap();
        cell.replace(certified);
        assert!(cell.get().is_some());
    }
}
