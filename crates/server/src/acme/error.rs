//! ACME error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during ACME operations.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Failed to load or register the account
    #[error("failed to load ACME account: {0}")]
    Account(String),

    /// Failed to create or drive a certificate order
    #[error("certificate order failed: {0}")]
    Order(String),

    /// No authorization challenge matched the configured solver set
    #[error("no supported challenge offered for '{domain}'")]
    NoChallenge { domain: String },

    /// CSR construction or order finalization failed
    #[error("failed to finalize certificate: {0}")]
    Finalization(String),

    /// The issuance attempt ran out of time
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Key material could not be loaded or converted
    #[error(transparent)]
    Key(#[from] crate::keys::KeyError),

    /// On-disk state could not be read or written
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Account or credential (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
