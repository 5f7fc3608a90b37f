//! Background certificate renewal
//!
//! One task owns every issuance attempt in the process, so attempts are
//! naturally serialized. Each pass checks the wildcard signing certificate
//! and, when the API handler names a hostname, the API certificate; a
//! successful API renewal reloads the in-memory bundle the TLS resolver
//! serves from.

use super::account;
use super::broker::{ChallengeBroker, ChallengeKind};
use super::error::AcmeError;
use super::order;
use crate::keys::Signer;
use crate::tls::{self, ApiCertCell};
use keyless_config::Config;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Renew once remaining validity drops below this.
const RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Base interval between renewal passes; jitter of up to an hour is added.
const CHECK_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Solver sets per certificate. The signing certificate is a wildcard, so
/// only DNS-01 applies; the API certificate can use whichever of the two
/// listener-local transports the CA offers.
const WILDCARD_SOLVERS: &[ChallengeKind] = &[ChallengeKind::Dns01];
const API_SOLVERS: &[ChallengeKind] = &[ChallengeKind::Http01, ChallengeKind::TlsAlpn01];

/// One certificate under management: its file pair and the SAN to verify.
struct ManagedCert {
    cert_file: PathBuf,
    key_file: PathBuf,
    hostname: String,
    solvers: &'static [ChallengeKind],
}

/// Background renewal task state.
pub struct RenewalScheduler {
    config: Arc<Config>,
    broker: Arc<ChallengeBroker>,
    cell: Arc<ApiCertCell>,
    wildcard: ManagedCert,
    api: Option<ManagedCert>,
}

impl RenewalScheduler {
    pub fn new(config: Arc<Config>, broker: Arc<ChallengeBroker>, cell: Arc<ApiCertCell>) -> Self {
        let wildcard = ManagedCert {
            cert_file: config.certificate.clone(),
            key_file: config.master_key.clone(),
            hostname: format!("*.{}", config.zone()),
            solvers: WILDCARD_SOLVERS,
        };

        let api = config.api_hostname().map(|hostname| ManagedCert {
            cert_file: config.api.certificate.clone(),
            key_file: config.api.key.clone(),
            hostname: hostname.to_string(),
            solvers: API_SOLVERS,
        });

        Self {
            config,
            broker,
            cell,
            wildcard,
            api,
        }
    }

    /// Run renewal passes until shutdown. The first pass starts immediately;
    /// failures are logged and retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_hours = CHECK_INTERVAL.as_secs() / 3600,
            "certificate renewal task started"
        );

        loop {
            self.check_certificates().await;

            let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..60) * 60);
            tokio::select! {
                _ = tokio::time::sleep(CHECK_INTERVAL + jitter) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("certificate renewal task stopped");
    }

    /// One pass over both managed certificates.
    pub async fn check_certificates(&self) {
        if let Err(e) = self.renew_if_stale(&self.wildcard).await {
            error!(hostname = %self.wildcard.hostname, error = %e, "signing certificate renewal failed");
        }

        if let Some(api) = &self.api {
            match self.renew_if_stale(api).await {
                Ok(()) => self.reload_api_bundle(api),
                Err(e) => {
                    error!(hostname = %api.hostname, error = %e, "api certificate renewal failed");
                }
            }
        }
    }

    async fn renew_if_stale(&self, cert: &ManagedCert) -> Result<(), AcmeError> {
        if self.is_fresh(cert) {
            debug!(hostname = %cert.hostname, "certificate is still fresh");
            return Ok(());
        }

        info!(hostname = %cert.hostname, "renewing the certificate");
        let account = account::load(&self.config.letsencrypt).await?;
        let key = Signer::from_file(&cert.key_file)?;

        let chain = order::obtain(&account, &self.broker, &key, &cert.hostname, cert.solvers).await?;
        order::write_chain(&cert.cert_file, &chain)?;
        Ok(())
    }

    /// A certificate is fresh when its chain loads, the leaf covers the
    /// managed hostname, and more than the renewal window remains.
    fn is_fresh(&self, cert: &ManagedCert) -> bool {
        let Some(remaining) = leaf_validity(&cert.cert_file, &cert.hostname) else {
            return false;
        };
        remaining > RENEWAL_WINDOW
    }

    /// Swap the TLS resolver onto the freshly written bundle.
    fn reload_api_bundle(&self, api: &ManagedCert) {
        match tls::load_certified_key(&api.cert_file, &api.key_file) {
            Ok(certified) => self.cell.replace(Arc::new(certified)),
            Err(e) => {
                // First boot has no bundle yet; anything else is worth a look.
                if api.cert_file.exists() {
                    warn!(error = %e, "failed to reload api certificate bundle");
                }
            }
        }
    }
}

/// Remaining validity of the leaf in a chain file, if it parses and covers
/// the hostname.
fn leaf_validity(cert_file: &std::path::Path, hostname: &str) -> Option<Duration> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let file = std::fs::File::open(cert_file).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let leaf = rustls_pemfile::certs(&mut reader).next()?.ok()?;

    if !tls::cert_covers(leaf.as_ref(), hostname) {
        return None;
    }

    let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).ok()?;
    parsed
        .validity()
        .time_to_expiration()
        .and_then(|d| Duration::try_from(d).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Duration as TimeDuration, OffsetDateTime};

    fn write_cert(path: &std::path::Path, hostname: &str, valid_for_days: i64) {
        let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()]).unwrap();
        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::days(1);
        params.not_after = now + TimeDuration::days(valid_for_days);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        std::fs::write(path, cert.pem()).unwrap();
    }

    #[test]
    fn fresh_certificate_has_remaining_validity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        write_cert(&path, "*.example.com", 60);

        let remaining = leaf_validity(&path, "*.example.com").unwrap();
        assert!(remaining > RENEWAL_WINDOW);
    }

    #[test]
    fn expiring_certificate_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        write_cert(&path, "api.example.com", 10);

        let remaining = leaf_validity(&path, "api.example.com").unwrap();
        assert!(remaining < RENEWAL_WINDOW);
    }

    #[test]
    fn wrong_hostname_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        write_cert(&path, "api.example.com", 60);

        assert!(leaf_validity(&path, "other.example.com").is_none());
    }

    #[test]
    fn missing_file_is_stale() {
        assert!(leaf_validity(std::path::Path::new("/nonexistent.pem"), "x").is_none());
    }
}
