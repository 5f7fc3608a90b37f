//! Certificate issuance
//!
//! Drives one ACME order end to end: authorizations are satisfied by handing
//! the key authorization to the challenge broker (which every listener reads
//! from), the CSR is built over the certificate's *existing* private key, and
//! the resulting chain is written atomically. Keys are never generated here;
//! the private key stays wherever it already lives.

use super::broker::{ChallengeBroker, ChallengeKind, ChallengeRecord};
use super::error::AcmeError;
use crate::keys::Signer;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewOrder, Order, OrderStatus,
};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Hard ceiling for one issuance attempt.
const OBTAIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Poll interval while waiting on the ACME server.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

fn challenge_type(kind: ChallengeKind) -> ChallengeType {
    match kind {
        ChallengeKind::Dns01 => ChallengeType::Dns01,
        ChallengeKind::Http01 => ChallengeType::Http01,
        ChallengeKind::TlsAlpn01 => ChallengeType::TlsAlpn01,
    }
}

/// Obtain a certificate chain for `hostname`, satisfying challenges through
/// the broker with the given solver set. Returns the chain PEM.
///
/// Presented challenges are cleaned up on every path; leftovers age out of
/// the broker on their own either way.
pub async fn obtain(
    account: &Account,
    broker: &ChallengeBroker,
    key: &Signer,
    hostname: &str,
    solvers: &[ChallengeKind],
) -> Result<String, AcmeError> {
    let mut presented = Vec::new();

    let result = tokio::time::timeout(
        OBTAIN_TIMEOUT,
        run_order(account, broker, key, hostname, solvers, &mut presented),
    )
    .await
    .unwrap_or_else(|_| {
        Err(AcmeError::Timeout(format!(
            "issuance for {hostname} exceeded {OBTAIN_TIMEOUT:?}"
        )))
    });

    for record in &presented {
        broker.cleanup(record);
    }

    result
}

async fn run_order(
    account: &Account,
    broker: &ChallengeBroker,
    key: &Signer,
    hostname: &str,
    solvers: &[ChallengeKind],
    presented: &mut Vec<ChallengeRecord>,
) -> Result<String, AcmeError> {
    let identifiers = [Identifier::Dns(hostname.to_string())];

    info!(hostname, "creating certificate order");
    let mut order = account
        .new_order(&NewOrder::new(&identifiers))
        .await
        .map_err(|e| AcmeError::Order(e.to_string()))?;

    let mut authorizations = order.authorizations();
    while let Some(result) = authorizations.next().await {
        let mut authz =
            result.map_err(|e| AcmeError::Order(format!("failed to get authorization: {e}")))?;

        let domain = match &authz.identifier().identifier {
            Identifier::Dns(domain) => domain.clone(),
            _ => continue,
        };

        debug!(domain = %domain, status = ?authz.status, "processing authorization");
        match &authz.status {
            AuthorizationStatus::Valid => continue,
            AuthorizationStatus::Pending => {}
            status => {
                return Err(AcmeError::Order(format!(
                    "authorization for {domain} is {status:?}"
                )));
            }
        }

        let mut selected = None;
        for &kind in solvers {
            if authz.challenge(challenge_type(kind)).is_some() {
                selected = Some(kind);
                break;
            }
        }
        let Some(kind) = selected else {
            return Err(AcmeError::NoChallenge { domain });
        };
        let Some(mut challenge) = authz.challenge(challenge_type(kind)) else {
            return Err(AcmeError::NoChallenge { domain });
        };

        let key_authorization = challenge.key_authorization();
        let record = ChallengeRecord::new(
            kind,
            domain.clone(),
            challenge.token.clone(),
            key_authorization.as_str().to_string(),
        );
        broker.present(record.clone());
        presented.push(record);

        debug!(domain = %domain, kind = kind.as_str(), "challenge presented, setting ready");
        challenge
            .set_ready()
            .await
            .map_err(|e| AcmeError::Order(format!("failed to set challenge ready: {e}")))?;
    }
    drop(authorizations);

    wait_for_ready(&mut order).await?;

    // CSR over the existing on-disk key; issuance never creates key material.
    let key_pair = rcgen::KeyPair::try_from(key.to_pkcs8_der()?.as_slice())
        .map_err(|e| AcmeError::Finalization(format!("failed to load key for CSR: {e}")))?;
    let params = rcgen::CertificateParams::new(vec![hostname.to_string()])
        .map_err(|e| AcmeError::Finalization(format!("failed to build CSR params: {e}")))?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AcmeError::Finalization(format!("failed to serialize CSR: {e}")))?
        .der()
        .to_vec();

    order
        .finalize_csr(&csr)
        .await
        .map_err(|e| AcmeError::Finalization(e.to_string()))?;

    let chain = wait_for_certificate(&mut order).await?;
    info!(hostname, "certificate issued");
    Ok(chain)
}

/// Poll until every challenge validated and the order is ready.
async fn wait_for_ready(order: &mut Order) -> Result<(), AcmeError> {
    loop {
        let state = order
            .refresh()
            .await
            .map_err(|e| AcmeError::Order(format!("failed to refresh order: {e}")))?;

        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => {
                return Err(AcmeError::Order("order became invalid".into()));
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                trace!(status = ?state.status, "order not ready yet");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Poll until the certificate is issued and fetch the chain.
async fn wait_for_certificate(order: &mut Order) -> Result<String, AcmeError> {
    loop {
        let state = order
            .refresh()
            .await
            .map_err(|e| AcmeError::Finalization(format!("failed to refresh order: {e}")))?;

        match state.status {
            OrderStatus::Valid => {
                let chain = order
                    .certificate()
                    .await
                    .map_err(|e| AcmeError::Finalization(e.to_string()))?;
                return chain
                    .ok_or_else(|| AcmeError::Finalization("no certificate in response".into()));
            }
            OrderStatus::Invalid => {
                return Err(AcmeError::Finalization("order became invalid".into()));
            }
            _ => {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Replace a chain file atomically: temp file in the same directory, mode
/// 0400, renamed over the target. No observable truncated state, ever.
pub fn write_chain(path: &Path, chain_pem: &str) -> Result<(), AcmeError> {
    let io_err = |source: std::io::Error| AcmeError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(chain_pem.as_bytes()).map_err(io_err)?;
    file.flush().map_err(io_err)?;

    let mut permissions = file.as_file().metadata().map_err(io_err)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut permissions, 0o400);
    file.as_file()
        .set_permissions(permissions)
        .map_err(io_err)?;

    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_writes_are_atomic_and_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("certificate.pem");

        write_chain(&target, "-----BEGIN CERTIFICATE-----\nAA==\n-----END CERTIFICATE-----\n")
            .unwrap();
        let first = std::fs::read_to_string(&target).unwrap();
        assert!(first.contains("BEGIN CERTIFICATE"));

        let mode = std::os::unix::fs::PermissionsExt::mode(
            &std::fs::metadata(&target).unwrap().permissions(),
        );
        assert_eq!(mode & 0o777, 0o400);

        // Replacing a read-only target must still succeed (rename, not open).
        write_chain(&target, "-----BEGIN CERTIFICATE-----\nBB==\n-----END CERTIFICATE-----\n")
            .unwrap();
        let second = std::fs::read_to_string(&target).unwrap();
        assert!(second.contains("BB=="));

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path() != target)
            .collect();
        assert!(leftovers.is_empty());
    }
}
