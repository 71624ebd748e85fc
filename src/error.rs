//! Error taxonomy for the protocol translation module
//!
//! Each layer owns a `thiserror` enum; [`BridgeError`] folds them into the
//! categories the process acts on. Every variant is fatal: it surfaces to the
//! top level, is logged with context, and terminates the process with a
//! category-specific exit code. Unknown sensors are not errors at all, see
//! [`crate::telemetry::FilterOutcome::UnknownSensor`].

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Crate-level error type
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Connection error: {0}")]
    Connection(#[from] MqttError),

    #[error("Broker kept rejecting credentials after {attempts} consecutive refreshes")]
    Reauthentication { attempts: u32 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    /// Process exit code for this error category
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Configuration(_) => 2,
            BridgeError::Credential(_) => 3,
            BridgeError::Connection(_) | BridgeError::Reauthentication { .. } => 4,
            BridgeError::Internal { .. } => 1,
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Error text safe to log: token signatures and secrets masked
    pub fn redacted(&self) -> String {
        redact_secrets(&self.to_string())
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

static SAS_TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SharedAccessSignature\s+\S+").expect("valid regex"));
static SIGNATURE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bsig=[^&\s]+").expect("valid regex"));
static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|secret|digest)[=:]\s*\S+").expect("valid regex")
});

/// Mask security tokens and secrets in text destined for logs
pub fn redact_secrets(message: &str) -> String {
    let sanitized = SAS_TOKEN_PATTERN.replace_all(message, "SharedAccessSignature ***");
    let sanitized = SIGNATURE_PATTERN.replace_all(&sanitized, "sig=***");
    SECRET_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .into_owned()
}
