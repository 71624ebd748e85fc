//! Mock collaborators for testing
//!
//! Stand-ins for the signing service, the broker publish path and the session
//! credential slot, so the bridge can be exercised without an edge runtime or
//! a broker.

use crate::credentials::{CredentialError, SigningService};
use crate::transport::{CredentialSink, Publisher};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// PEM returned by [`MockSigner::trust_bundle`]
pub const MOCK_TRUST_BUNDLE: &str =
    "-----BEGIN CERTIFICATE-----\nMIIBmockedtrustbundle\n-----END CERTIFICATE-----\n";

/// Signing service double that hands out a distinct digest per call
#[derive(Debug, Default)]
pub struct MockSigner {
    failing: AtomicBool,
    calls: AtomicU64,
    signed: Mutex<Vec<String>>,
}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signer whose every request is rejected
    pub fn failing() -> Self {
        let signer = Self::default();
        signer.set_failing(true);
        signer
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful signatures issued so far
    pub fn sign_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every string submitted for signing, in order
    pub fn signed_data(&self) -> Vec<String> {
        self.signed.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn rejection() -> CredentialError {
        CredentialError::Rejected {
            status: 500,
            message: "mock signer configured to fail".to_string(),
        }
    }
}

#[async_trait]
impl SigningService for MockSigner {
    async fn sign(&self, data: &str) -> Result<String, CredentialError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::rejection());
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut signed) = self.signed.lock() {
            signed.push(data.to_string());
        }
        Ok(STANDARD.encode(format!("mock-digest-{n}")))
    }

    async fn trust_bundle(&self) -> Result<String, CredentialError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Self::rejection());
        }
        Ok(MOCK_TRUST_BUNDLE.to_string())
    }
}

/// One message handed to [`MockPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

#[derive(Debug, Error)]
#[error("mock publisher configured to fail")]
pub struct MockPublishError;

/// Publisher double recording every call
#[derive(Debug, Clone, Default)]
pub struct MockPublisher {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    should_fail: Arc<AtomicBool>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        let publisher = Self::default();
        publisher.should_fail.store(true, Ordering::SeqCst);
        publisher
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut published) = self.published.lock() {
            published.clear();
        }
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    type Error = MockPublishError;

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MockPublishError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(MockPublishError);
        }
        if let Ok(mut published) = self.published.lock() {
            published.push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                qos,
            });
        }
        Ok(())
    }
}

/// Credential slot double recording every (username, password) applied
#[derive(Debug, Default)]
pub struct RecordingSession {
    pub applied: Vec<(String, String)>,
}

impl CredentialSink for RecordingSession {
    fn apply_credentials(&mut self, username: &str, password: &str) {
        self.applied
            .push((username.to_string(), password.to_string()));
    }
}
