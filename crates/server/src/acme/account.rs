//! ACME account storage and bootstrap
//!
//! The account lives in two files: the registered account object as JSON and
//! the account private key as EC P-256 PEM. Loading reconstructs client
//! credentials from those, picking the directory URL by prefix-matching the
//! account location against the Let's Encrypt bases, so renewals keep
//! targeting the CA the account was created on.

use super::error::AcmeError;
use crate::keys::Signer;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use instant_acme::{Account, AccountCredentials, NewAccount};
use keyless_config::AccountConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Let's Encrypt API bases; the account location URL starts with one of them.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/";

/// The on-disk account object.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAccount {
    #[serde(default)]
    pub contact: Vec<String>,
    pub status: String,
    pub location: String,
    pub terms_of_service_agreed: bool,
}

/// Directory URL for the CA an account location belongs to.
fn directory_for(location: &str) -> String {
    if location.starts_with(LETS_ENCRYPT_PRODUCTION) {
        format!("{LETS_ENCRYPT_PRODUCTION}directory")
    } else {
        format!("{LETS_ENCRYPT_STAGING}directory")
    }
}

/// Load the persisted account.
///
/// Both files must exist; a missing account is a setup problem, reported to
/// the operator as "run init".
pub async fn load(config: &AccountConfig) -> Result<Account, AcmeError> {
    let stored = read_stored(&config.account)?;

    let key_pem = std::fs::read_to_string(&config.account_key).map_err(|source| AcmeError::Io {
        path: config.account_key.clone(),
        source,
    })?;
    let signer = Signer::from_pem(&key_pem, &config.account_key)?;
    let key_pkcs8 = signer.to_pkcs8_der()?;

    let credentials: AccountCredentials = serde_json::from_value(serde_json::json!({
        "id": stored.location,
        "key_pkcs8": URL_SAFE_NO_PAD.encode(&key_pkcs8),
        "directory": directory_for(&stored.location),
    }))?;

    let account = Account::builder()
        .map_err(|e| AcmeError::Account(e.to_string()))?
        .from_credentials(credentials)
        .await
        .map_err(|e| AcmeError::Account(e.to_string()))?;

    Ok(account)
}

/// Register a new account and persist it, or return the existing one.
///
/// Non-interactive replacement for a setup wizard: contact and directory
/// choice come from the configuration, terms are agreed by running `init`.
pub async fn load_or_bootstrap(config: &AccountConfig) -> Result<Account, AcmeError> {
    if config.account.exists() && config.account_key.exists() {
        info!("using the existing ACME account");
        return load(config).await;
    }

    let directory_url = if config.production {
        format!("{LETS_ENCRYPT_PRODUCTION}directory")
    } else {
        format!("{LETS_ENCRYPT_STAGING}directory")
    };

    let contact: Vec<String> = config
        .email
        .iter()
        .map(|email| format!("mailto:{email}"))
        .collect();
    let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

    info!(directory = %directory_url, "registering new ACME account");

    let (account, credentials) = Account::builder()
        .map_err(|e| AcmeError::Account(e.to_string()))?
        .create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::Account(e.to_string()))?;

    persist(config, &contact, &credentials)?;
    info!(path = %config.account.display(), "ACME account registered");

    Ok(account)
}

/// Write the account object and its private key, modes 0400.
fn persist(
    config: &AccountConfig,
    contact: &[String],
    credentials: &AccountCredentials,
) -> Result<(), AcmeError> {
    let value = serde_json::to_value(credentials)?;
    let location = value
        .get("id")
        .and_then(|id| id.as_str())
        .ok_or_else(|| AcmeError::Account("credentials carry no account URL".into()))?
        .to_string();
    let key_b64 = value
        .get("key_pkcs8")
        .and_then(|key| key.as_str())
        .ok_or_else(|| AcmeError::Account("credentials carry no private key".into()))?;
    let key_der = URL_SAFE_NO_PAD
        .decode(key_b64)
        .or_else(|_| STANDARD.decode(key_b64))
        .map_err(|e| AcmeError::Account(format!("credential key encoding: {e}")))?;

    let key_pem = key_pem_from_pkcs8(&key_der)?;
    crate::keys::write_private(&config.account_key, key_pem.as_bytes(), 0o400).map_err(
        |source| AcmeError::Io {
            path: config.account_key.clone(),
            source,
        },
    )?;

    let stored = StoredAccount {
        contact: contact.to_vec(),
        status: "valid".into(),
        location,
        terms_of_service_agreed: true,
    };
    crate::keys::write_private(
        &config.account,
        &serde_json::to_vec_pretty(&stored)?,
        0o400,
    )
    .map_err(|source| AcmeError::Io {
        path: config.account.clone(),
        source,
    })?;

    Ok(())
}

fn key_pem_from_pkcs8(der: &[u8]) -> Result<String, AcmeError> {
    use pkcs8::{DecodePrivateKey, EncodePrivateKey};
    let secret = p256::SecretKey::from_pkcs8_der(der)
        .map_err(|e| AcmeError::Account(format!("unexpected account key type: {e}")))?;
    let pem = secret
        .to_pkcs8_pem(pkcs8::LineEnding::LF)
        .map_err(|e| AcmeError::Account(e.to_string()))?;
    Ok(pem.to_string())
}

/// Verify the persisted account files exist and parse, without touching the
/// network. Startup uses this to fail loudly before binding anything.
pub fn check(config: &AccountConfig) -> Result<(), AcmeError> {
    let stored = read_stored(&config.account)?;
    if stored.location.is_empty() {
        return Err(AcmeError::Account("stored account has no location".into()));
    }

    let key_pem = std::fs::read_to_string(&config.account_key).map_err(|source| AcmeError::Io {
        path: config.account_key.clone(),
        source,
    })?;
    Signer::from_pem(&key_pem, &config.account_key)?;
    Ok(())
}

fn read_stored(path: &Path) -> Result<StoredAccount, AcmeError> {
    let bytes = std::fs::read(path).map_err(|source| AcmeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_follows_account_location() {
        assert_eq!(
            directory_for("https://acme-v02.api.letsencrypt.org/acme/acct/123"),
            "https://acme-v02.api.letsencrypt.org/directory"
        );
        assert_eq!(
            directory_for("https://acme-staging-v02.api.letsencrypt.org/acme/acct/9"),
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        );
        // Unknown CAs fall back to staging, the safe side.
        assert_eq!(
            directory_for("https://example.org/acct/1"),
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        );
    }

    #[test]
    fn stored_account_uses_acme_field_names() {
        let stored = StoredAccount {
            contact: vec!["mailto:admin@example.com".into()],
            status: "valid".into(),
            location: "https://acme-v02.api.letsencrypt.org/acme/acct/1".into(),
            terms_of_service_agreed: true,
        };
        let json = serde_json::to_string(&stored).unwrap();
        assert!(json.contains("termsOfServiceAgreed"));
        assert!(json.contains("\"contact\""));

        let roundtrip: StoredAccount = serde_json::from_str(&json).unwrap();
        assert_eq!(roundtrip.location, stored.location);
        assert!(roundtrip.terms_of_service_agreed);
    }
}
