//! Credential Provider: owner of the current security token
//!
//! The token lives in a single `tokio::sync::Mutex` cell. Readers get a
//! snapshot clone; `refresh` holds the lock for the whole signing round-trip,
//! so reads and refreshes are mutually exclusive and a half-built token is
//! never observable. A failed refresh leaves the previous token in place.

use super::token::{self, SecurityToken};
use super::{CredentialError, SigningService, WorkloadClient};
use crate::config::{ModuleIdentity, TokenSection};
use crate::error::BridgeResult;
use crate::observability::metrics::metrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Issues and renews the module's security token
pub struct CredentialProvider {
    signer: Arc<dyn SigningService>,
    resource_uri: String,
    ttl: Duration,
    renewal_margin: Duration,
    cell: Mutex<SecurityToken>,
}

impl CredentialProvider {
    /// Create a provider and obtain the first token
    pub async fn create(
        identity: &ModuleIdentity,
        settings: &TokenSection,
        signer: Arc<dyn SigningService>,
    ) -> Result<Self, CredentialError> {
        let resource_uri = identity.sas_resource_uri();
        let ttl = settings.ttl();
        let first = issue(signer.as_ref(), &resource_uri, ttl, None).await?;

        info!(
            resource = %resource_uri,
            expires = %first.expiry().to_rfc3339(),
            "Security token issued"
        );

        Ok(Self {
            signer,
            resource_uri,
            ttl,
            renewal_margin: settings.renewal_margin(),
            cell: Mutex::new(first),
        })
    }

    /// Create a provider from the process environment.
    ///
    /// Fails with a configuration error when identity variables are absent,
    /// and with a credential error when the workload API cannot issue a token.
    pub async fn from_environment(settings: &TokenSection) -> BridgeResult<Self> {
        let identity = ModuleIdentity::from_env()?;
        let signer = Arc::new(WorkloadClient::new(&identity, &settings.key_id)?);
        Ok(Self::create(&identity, settings, signer).await?)
    }

    /// Snapshot of the current token
    pub async fn current_token(&self) -> SecurityToken {
        self.cell.lock().await.clone()
    }

    /// Replace the current token with a freshly signed one
    pub async fn refresh(&self) -> Result<SecurityToken, CredentialError> {
        let mut current = self.cell.lock().await;
        debug!(
            previous_expiry = %current.expiry().to_rfc3339(),
            "Refreshing security token"
        );

        match issue(
            self.signer.as_ref(),
            &self.resource_uri,
            self.ttl,
            Some(current.expiry_secs()),
        )
        .await
        {
            Ok(fresh) => {
                *current = fresh.clone();
                metrics().record_token_refresh();
                info!(expires = %fresh.expiry().to_rfc3339(), "Security token refreshed");
                Ok(fresh)
            }
            Err(e) => {
                warn!("Security token refresh failed, keeping previous token: {}", e);
                Err(e)
            }
        }
    }

    /// True when the current token is inside the renewal margin
    pub async fn renewal_due(&self) -> bool {
        self.cell
            .lock()
            .await
            .expires_within(self.renewal_margin, Utc::now())
    }

    /// CA bundle for verifying the broker
    pub async fn server_certificate(&self) -> Result<String, CredentialError> {
        self.signer.trust_bundle().await
    }

    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }
}

async fn issue(
    signer: &dyn SigningService,
    resource_uri: &str,
    ttl: Duration,
    previous_expiry: Option<i64>,
) -> Result<SecurityToken, CredentialError> {
    let expiry = token::next_expiry(Utc::now().timestamp(), ttl, previous_expiry);
    let signature = signer
        .sign(&token::string_to_sign(resource_uri, expiry))
        .await?;
    Ok(SecurityToken::new(resource_uri, &signature, expiry, ttl))
}
