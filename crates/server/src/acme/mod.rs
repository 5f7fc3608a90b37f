//! ACME certificate management
//!
//! Keeps the server's two certificates current without manual intervention:
//!
//! - the wildcard signing certificate, validated over DNS-01 by the zone
//!   engine answering `_acme-challenge` TXT queries from the broker;
//! - the API certificate, validated over HTTP-01 or TLS-ALPN-01 on the API
//!   listener itself.
//!
//! The [`broker`] is the coupling point: issuance presents challenges to it
//! and every listener answers validation traffic from it, so the CA can
//! retry over any transport it likes.

pub mod account;
pub mod broker;
mod error;
pub mod order;
mod renewal;

pub use broker::{ChallengeBroker, ChallengeKind, ChallengeRecord};
pub use error::AcmeError;
pub use renewal::RenewalScheduler;
