//! Process-wide ACME challenge broker
//!
//! One ordered list of pending challenges behind a single mutex, fanned out
//! to every listener through thin per-transport adapters. The ACME server may
//! retry a validation over any transport, so records are keyed by identifier
//! and each adapter filters by its own challenge type.
//!
//! Entries older than 60 seconds are pruned on every access; `cleanup` is
//! best-effort and leftovers age out on their own.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a presented challenge stays answerable.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(60);

/// ACME challenge transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Dns01,
    Http01,
    TlsAlpn01,
}

impl ChallengeKind {
    /// The RFC 8555 challenge type identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Dns01 => "dns-01",
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::TlsAlpn01 => "tls-alpn-01",
        }
    }

    /// Parse an RFC 8555 challenge type identifier.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dns-01" => Some(ChallengeKind::Dns01),
            "http-01" => Some(ChallengeKind::Http01),
            "tls-alpn-01" => Some(ChallengeKind::TlsAlpn01),
            _ => None,
        }
    }
}

/// A pending challenge as handed to `present`.
#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    created: Instant,
    pub kind: ChallengeKind,
    pub identifier: String,
    pub token: String,
    pub key_authorization: String,
}

impl ChallengeRecord {
    pub fn new(
        kind: ChallengeKind,
        identifier: impl Into<String>,
        token: impl Into<String>,
        key_authorization: impl Into<String>,
    ) -> Self {
        Self {
            created: Instant::now(),
            kind,
            identifier: identifier.into(),
            token: token.into(),
            key_authorization: key_authorization.into(),
        }
    }

    /// Structural equality: every field except the creation timestamp.
    fn matches(&self, other: &ChallengeRecord) -> bool {
        self.kind == other.kind
            && self.identifier == other.identifier
            && self.token == other.token
            && self.key_authorization == other.key_authorization
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) > CHALLENGE_TTL
    }

    fn identifier_matches(&self, name: &str) -> bool {
        self.identifier.eq_ignore_ascii_case(name)
    }

    #[cfg(test)]
    fn backdated(mut self, age: Duration) -> Self {
        self.created = Instant::now() - age;
        self
    }
}

/// The DNS-01 authorization string: base64url-nopad SHA-256 of the key
/// authorization.
pub fn dns01_digest(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

// ============================================================================
// Broker
// ============================================================================

/// Shared store of live challenges.
pub struct ChallengeBroker {
    records: Mutex<Vec<ChallengeRecord>>,
}

impl ChallengeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    /// Make a challenge answerable on every listener. Duplicates are allowed;
    /// they answer identically and expire independently.
    pub fn present(&self, record: ChallengeRecord) {
        let mut records = self.records.lock();
        Self::prune(&mut records);
        debug!(
            kind = record.kind.as_str(),
            identifier = %record.identifier,
            "challenge presented"
        );
        records.push(record);
    }

    /// Remove every record structurally equal to the argument.
    pub fn cleanup(&self, record: &ChallengeRecord) {
        let mut records = self.records.lock();
        Self::prune(&mut records);
        records.retain(|candidate| !candidate.matches(record));
    }

    /// DNS-01 authorization strings for an identifier, ready to serve as TXT
    /// record values.
    pub fn dns_authorizations(&self, name: &str) -> Vec<String> {
        let mut records = self.records.lock();
        Self::prune(&mut records);
        records
            .iter()
            .filter(|r| r.kind == ChallengeKind::Dns01 && r.identifier_matches(name))
            .map(|r| dns01_digest(&r.key_authorization))
            .collect()
    }

    /// HTTP-01 adapter: the plain-text key authorization for a token, when
    /// the request's host names a live challenge.
    pub fn http_key_authorization(&self, token: &str, host: &str) -> Option<String> {
        let mut records = self.records.lock();
        Self::prune(&mut records);
        records
            .iter()
            .find(|r| {
                r.kind == ChallengeKind::Http01 && r.token == token && r.identifier_matches(host)
            })
            .map(|r| r.key_authorization.clone())
    }

    /// TLS-ALPN-01 adapter: a self-signed certificate carrying the
    /// `acmeIdentifier` extension for the handshake's server name.
    pub fn tls_alpn_certificate(
        &self,
        server_name: &str,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let key_authorization = {
            let mut records = self.records.lock();
            Self::prune(&mut records);
            records
                .iter()
                .find(|r| r.kind == ChallengeKind::TlsAlpn01 && r.identifier_matches(server_name))
                .map(|r| r.key_authorization.clone())
        }?;

        match crate::tls::alpn_challenge_certificate(server_name, &key_authorization) {
            Ok(certified) => Some(certified),
            Err(e) => {
                warn!(server_name, error = %e, "failed to build tls-alpn-01 certificate");
                None
            }
        }
    }

    /// Raw key authorizations for a transport and identifier, served to
    /// replica peers which do their own per-transport processing.
    pub fn local_authorizations(&self, kind: ChallengeKind, name: &str) -> Vec<String> {
        let mut records = self.records.lock();
        Self::prune(&mut records);
        records
            .iter()
            .filter(|r| r.kind == kind && r.identifier_matches(name))
            .map(|r| r.key_authorization.clone())
            .collect()
    }

    fn prune(records: &mut Vec<ChallengeRecord>) {
        let now = Instant::now();
        records.retain(|r| !r.expired(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: ChallengeKind, identifier: &str, token: &str) -> ChallengeRecord {
        ChallengeRecord::new(kind, identifier, token, format!("{token}.thumbprint"))
    }

    #[test]
    fn dns_authorizations_hash_the_key_authorization() {
        let broker = ChallengeBroker::new();
        broker.present(record(ChallengeKind::Dns01, "example.com", "tok"));

        let values = broker.dns_authorizations("example.com");
        assert_eq!(values, vec![dns01_digest("tok.thumbprint")]);
    }

    #[test]
    fn identifier_matching_is_case_insensitive() {
        let broker = ChallengeBroker::new();
        broker.present(record(ChallengeKind::Dns01, "Example.COM", "tok"));
        assert_eq!(broker.dns_authorizations("example.com").len(), 1);
    }

    #[test]
    fn adapters_filter_by_transport() {
        let broker = ChallengeBroker::new();
        broker.present(record(ChallengeKind::Dns01, "example.com", "a"));
        broker.present(record(ChallengeKind::Http01, "example.com", "b"));

        assert_eq!(broker.dns_authorizations("example.com").len(), 1);
        assert!(broker.http_key_authorization("b", "example.com").is_some());
        assert!(broker.http_key_authorization("a", "example.com").is_none());
    }

    #[test]
    fn http_adapter_requires_matching_host() {
        let broker = ChallengeBroker::new();
        broker.present(record(ChallengeKind::Http01, "api.example.com", "tok"));
        assert!(broker.http_key_authorization("tok", "other.example.com").is_none());
        assert_eq!(
            broker.http_key_authorization("tok", "API.example.com").as_deref(),
            Some("tok.thumbprint")
        );
    }

    #[test]
    fn cleanup_removes_structural_equals_only() {
        let broker = ChallengeBroker::new();
        let target = record(ChallengeKind::Dns01, "example.com", "tok");
        broker.present(target.clone());
        broker.present(target.clone());
        broker.present(record(ChallengeKind::Dns01, "example.com", "other"));

        broker.cleanup(&target);

        let remaining = broker.local_authorizations(ChallengeKind::Dns01, "example.com");
        assert_eq!(remaining, vec!["other.thumbprint".to_string()]);
    }

    #[test]
    fn expired_records_are_pruned_on_access() {
        let broker = ChallengeBroker::new();
        broker.present(
            record(ChallengeKind::Dns01, "example.com", "old")
                .backdated(CHALLENGE_TTL + Duration::from_secs(1)),
        );
        broker.present(record(ChallengeKind::Dns01, "example.com", "new"));

        let values = broker.dns_authorizations("example.com");
        assert_eq!(values, vec![dns01_digest("new.thumbprint")]);
    }

    #[test]
    fn duplicates_are_allowed() {
        let broker = ChallengeBroker::new();
        let rec = record(ChallengeKind::Dns01, "example.com", "tok");
        broker.present(rec.clone());
        broker.present(rec);
        assert_eq!(broker.dns_authorizations("example.com").len(), 2);
    }
}
