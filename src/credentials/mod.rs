//! Credential Provider and its collaborators
//!
//! The bridge authenticates to the broker with a short-lived security token
//! signed by the edge runtime's workload API. This module holds:
//!
//! - [`token`] - pure construction of security tokens
//! - [`workload`] - the workload API client that signs and serves the trust bundle
//! - [`provider`] - the owned, mutex-guarded token cell with refresh

pub mod provider;
pub mod token;
pub mod workload;

pub use provider::CredentialProvider;
pub use token::SecurityToken;
pub use workload::WorkloadClient;

use async_trait::async_trait;
use thiserror::Error;

/// Failures obtaining credentials from the credential source
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential source unreachable: {0}")]
    Unreachable(String),
    #[error("Credential source rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Malformed credential source response: {0}")]
    MalformedResponse(String),
    #[error("Unsupported workload URI: {0}")]
    UnsupportedUri(String),
}

/// The hardware-backed signing collaborator
///
/// Implemented by [`WorkloadClient`] against the edge workload API and by
/// test doubles in [`crate::testing`].
#[async_trait]
pub trait SigningService: Send + Sync {
    /// Sign `data` with the module key, returning the base64 digest
    async fn sign(&self, data: &str) -> Result<String, CredentialError>;

    /// PEM bundle the broker's server certificate chains to
    async fn trust_bundle(&self) -> Result<String, CredentialError>;
}
