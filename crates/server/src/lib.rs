//! Keyless TLS signing server
//!
//! Holds the private keys for a wildcard-protected domain and exposes a
//! remote signing API, so edge servers can terminate TLS with certificates
//! whose keys never leave this process. To stay online unattended it also:
//!
//! - answers authoritative DNS for its own zone, synthesizing records from
//!   query labels;
//! - runs an embedded ACME client that renews both the wildcard signing
//!   certificate (DNS-01, answered by the zone engine) and its own API
//!   certificate (HTTP-01 / TLS-ALPN-01, answered on the API listener).
//!
//! The subsystems meet in two places: the challenge broker, which fans
//! pending validations out to every listener, and the API certificate cell,
//! which the TLS resolver reads and renewal swaps.

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod api;
pub mod dns;
pub mod keys;
pub mod replica;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Challenge brokerage and renewal
pub use acme::{AcmeError, ChallengeBroker, ChallengeKind, ChallengeRecord, RenewalScheduler};

// HTTPS API
pub use api::{router, ApiState};

// Zone engine
pub use dns::{convert_txt_to_caa, ZoneAuthority};

// Key material
pub use keys::{HashAlg, KeyStore, Signer};

// TLS selection
pub use tls::{ApiCertCell, CertResolver};
