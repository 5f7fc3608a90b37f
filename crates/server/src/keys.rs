//! Private key store and signing operations
//!
//! The store maps an SPKI fingerprint to the signer holding that key. It is
//! populated once at startup from the master key plus any legacy-key glob
//! matches and is read-only afterwards, so the signing path takes no locks.
//!
//! Rotating the master key retires it into the legacy set; certificates
//! already cached at the edges keep resolving through their fingerprint until
//! their own renewal.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::Signer as _;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Largest digest accepted by [`Signer::sign`]; anything longer is a caller
/// error, not a signable input.
pub const MAX_DIGEST_LEN: usize = 65;

/// Errors raised while loading keys or signing.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: not a supported private key (EC P-256, Ed25519 or RSA PEM)")]
    UnsupportedKey { path: PathBuf },

    #[error("invalid legacy_keys glob: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("key encoding error: {0}")]
    Encoding(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

// ============================================================================
// Hash Algorithms
// ============================================================================

/// Hash algorithms the signing endpoint understands, addressed by the
/// canonical textual name the TLS stack uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    /// Every supported algorithm, in resolution order.
    pub const ALL: [HashAlg; 4] = [
        HashAlg::Sha1,
        HashAlg::Sha256,
        HashAlg::Sha384,
        HashAlg::Sha512,
    ];

    /// Canonical name, as the edge sends it in the `hash` query parameter.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlg::Sha1 => "SHA-1",
            HashAlg::Sha256 => "SHA-256",
            HashAlg::Sha384 => "SHA-384",
            HashAlg::Sha512 => "SHA-512",
        }
    }

    /// Resolve a textual name by scanning the supported set, so callers never
    /// need to know this implementation's internal numbering.
    pub fn by_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|alg| alg.name() == name)
    }
}

// ============================================================================
// Signer
// ============================================================================

/// A private key with the one operation the signing service needs.
///
/// The three supported families cover what public CAs issue for; a closed
/// enum keeps the dispatch visible at the call site.
pub enum Signer {
    EcdsaP256(p256::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
    Rsa(rsa::RsaPrivateKey),
}

impl Signer {
    /// Parse a PEM-encoded private key (PKCS#8 for all families, SEC1 for EC).
    pub fn from_pem(pem: &str, path: &Path) -> Result<Self, KeyError> {
        if let Ok(key) = p256::SecretKey::from_pkcs8_pem(pem) {
            return Ok(Signer::EcdsaP256(key.into()));
        }
        if let Ok(key) = p256::SecretKey::from_sec1_pem(pem) {
            return Ok(Signer::EcdsaP256(key.into()));
        }
        if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_pem(pem) {
            return Ok(Signer::Ed25519(key));
        }
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(Signer::Rsa(key));
        }
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs1_pem(pem) {
            return Ok(Signer::Rsa(key));
        }
        Err(KeyError::UnsupportedKey {
            path: path.to_path_buf(),
        })
    }

    /// Read and parse a key file.
    pub fn from_file(path: &Path) -> Result<Self, KeyError> {
        let pem = std::fs::read_to_string(path).map_err(|source| KeyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_pem(&pem, path)
    }

    /// DER-encoded SubjectPublicKeyInfo of the public half.
    pub fn public_key_der(&self) -> Result<Vec<u8>, KeyError> {
        let doc = match self {
            Signer::EcdsaP256(key) => key.verifying_key().to_public_key_der(),
            Signer::Ed25519(key) => key.verifying_key().to_public_key_der(),
            Signer::Rsa(key) => key.to_public_key().to_public_key_der(),
        }
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Stable handle for this key: base64url-nopad SHA-256 of the SPKI DER.
    pub fn fingerprint(&self) -> Result<String, KeyError> {
        Ok(spki_fingerprint(&self.public_key_der()?))
    }

    /// PKCS#8 DER of the private key, for handing to the CSR builder.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, KeyError> {
        let doc = match self {
            Signer::EcdsaP256(key) => key.to_pkcs8_der(),
            Signer::Ed25519(key) => key.to_pkcs8_der(),
            Signer::Rsa(key) => key.to_pkcs8_der(),
        }
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Sign a caller-supplied digest.
    ///
    /// ECDSA signs the digest as a prehash and returns an ASN.1 DER
    /// signature. Ed25519 takes the bytes as the message itself and refuses
    /// a named hash. RSA produces a PKCS#1 v1.5 signature with the named
    /// hash's DigestInfo prefix, or an unprefixed one when no hash is given.
    pub fn sign(&self, digest: &[u8], hash: Option<HashAlg>) -> Result<Vec<u8>, KeyError> {
        match self {
            Signer::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| KeyError::Signing(e.to_string()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            Signer::Ed25519(key) => {
                if hash.is_some() {
                    return Err(KeyError::Signing(
                        "ed25519 cannot sign a pre-hashed message".into(),
                    ));
                }
                Ok(key.sign(digest).to_bytes().to_vec())
            }
            Signer::Rsa(key) => {
                let padding = match hash {
                    None => Pkcs1v15Sign::new_unprefixed(),
                    Some(HashAlg::Sha1) => Pkcs1v15Sign::new::<sha1::Sha1>(),
                    Some(HashAlg::Sha256) => Pkcs1v15Sign::new::<Sha256>(),
                    Some(HashAlg::Sha384) => Pkcs1v15Sign::new::<sha2::Sha384>(),
                    Some(HashAlg::Sha512) => Pkcs1v15Sign::new::<sha2::Sha512>(),
                };
                key.sign(padding, digest)
                    .map_err(|e| KeyError::Signing(e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let family = match self {
            Signer::EcdsaP256(_) => "ecdsa-p256",
            Signer::Ed25519(_) => "ed25519",
            Signer::Rsa(_) => "rsa",
        };
        f.debug_struct("Signer").field("family", &family).finish()
    }
}

/// base64url-nopad SHA-256 over a DER-encoded SubjectPublicKeyInfo.
pub fn spki_fingerprint(spki_der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(spki_der))
}

/// Write a secret file with restrictive permissions, creating parent
/// directories mode 0700 as needed.
pub(crate) fn write_private(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(bytes)
}

/// Load a key file, generating a fresh EC P-256 key first when it is absent.
pub fn create_key_if_missing(name: &str, path: &Path) -> Result<Signer, KeyError> {
    if path.exists() {
        info!(key = name, path = %path.display(), "using the existing private key");
        return Signer::from_file(path);
    }

    info!(key = name, path = %path.display(), "creating a new private key");
    let secret = p256::SecretKey::random(&mut rand::thread_rng());
    let pem = secret
        .to_pkcs8_pem(pkcs8::LineEnding::LF)
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
    write_private(path, pem.as_bytes(), 0o400).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Signer::EcdsaP256(secret.into()))
}

// ============================================================================
// Key Store
// ============================================================================

/// Fingerprint-addressed key store, read-only after startup.
pub struct KeyStore {
    keys: HashMap<String, Signer>,
}

impl KeyStore {
    /// Build an empty store. Used by `insert` callers and tests.
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    /// Load the master key plus every legacy glob match.
    ///
    /// The glob expansion order is irrelevant: the map is content-addressed,
    /// so duplicates collapse onto the same fingerprint.
    pub fn load(master_key: &Path, legacy_keys: Option<&str>) -> Result<Self, KeyError> {
        let mut store = Self::new();

        let fingerprint = store.insert(Signer::from_file(master_key)?)?;
        debug!(fingerprint = %fingerprint, path = %master_key.display(), "loaded master key");

        if let Some(pattern) = legacy_keys {
            for entry in glob::glob(pattern)? {
                let path = entry.map_err(|e| KeyError::Io {
                    path: e.path().to_path_buf(),
                    source: e.into_error(),
                })?;
                let fingerprint = store.insert(Signer::from_file(&path)?)?;
                debug!(fingerprint = %fingerprint, path = %path.display(), "loaded legacy key");
            }
        }

        info!(keys = store.len(), "key store loaded");
        Ok(store)
    }

    /// Add a signer, returning the fingerprint it is now addressable by.
    pub fn insert(&mut self, signer: Signer) -> Result<String, KeyError> {
        let fingerprint = signer.fingerprint()?;
        self.keys.insert(fingerprint.clone(), signer);
        Ok(fingerprint)
    }

    /// Look up a signer by fingerprint.
    pub fn lookup(&self, fingerprint: &str) -> Option<&Signer> {
        self.keys.get(fingerprint)
    }

    /// Whether a key with this fingerprint is present.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.keys.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;

    fn test_signer() -> Signer {
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        Signer::EcdsaP256(secret.into())
    }

    #[test]
    fn hash_resolution_by_canonical_name() {
        assert_eq!(HashAlg::by_name("SHA-256"), Some(HashAlg::Sha256));
        assert_eq!(HashAlg::by_name("SHA-384"), Some(HashAlg::Sha384));
        assert_eq!(HashAlg::by_name("sha-256"), None);
        assert_eq!(HashAlg::by_name("SHA256"), None);
        assert_eq!(HashAlg::by_name(""), None);
    }

    #[test]
    fn fingerprint_matches_spki_digest() {
        let signer = test_signer();
        let spki = signer.public_key_der().unwrap();

        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(&spki));
        assert_eq!(signer.fingerprint().unwrap(), expected);

        // base64url-nopad alphabet only
        let fp = signer.fingerprint().unwrap();
        assert!(!fp.contains('+') && !fp.contains('/') && !fp.contains('='));
        assert_eq!(fp.len(), 43); // 32 bytes, unpadded
    }

    #[test]
    fn store_lookup_by_fingerprint() {
        let mut store = KeyStore::new();
        let fingerprint = store.insert(test_signer()).unwrap();

        assert!(store.lookup(&fingerprint).is_some());
        assert!(store.lookup("bogus").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_keys_collapse() {
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let mut store = KeyStore::new();
        let a = store
            .insert(Signer::EcdsaP256(secret.clone().into()))
            .unwrap();
        let b = store.insert(Signer::EcdsaP256(secret.into())).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ecdsa_signature_verifies_over_digest() {
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let signing_key: p256::ecdsa::SigningKey = secret.clone().into();
        let verifying_key = *signing_key.verifying_key();
        let signer = Signer::EcdsaP256(signing_key);

        let digest = Sha256::digest(b"hello");
        let der = signer.sign(&digest, Some(HashAlg::Sha256)).unwrap();

        let signature = p256::ecdsa::Signature::from_der(&der).unwrap();
        verifying_key.verify_prehash(&digest, &signature).unwrap();
    }

    #[test]
    fn ed25519_rejects_named_hash() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let signer = Signer::Ed25519(key);
        assert!(signer.sign(b"message", Some(HashAlg::Sha256)).is_err());
        assert!(signer.sign(b"message", None).is_ok());
    }

    #[test]
    fn pem_roundtrip_through_pkcs8() {
        let signer = test_signer();
        let der = signer.to_pkcs8_der().unwrap();

        let secret = p256::SecretKey::from_pkcs8_der(&der).unwrap();
        let reloaded = Signer::EcdsaP256(secret.into());
        assert_eq!(
            signer.fingerprint().unwrap(),
            reloaded.fingerprint().unwrap()
        );
    }

    #[test]
    fn sec1_pem_is_accepted() {
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let pem = secret.to_sec1_pem(pkcs8::LineEnding::LF).unwrap();
        let signer = Signer::from_pem(&pem, Path::new("test.key")).unwrap();
        assert!(matches!(signer, Signer::EcdsaP256(_)));
    }
}
