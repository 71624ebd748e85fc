//! Transport layer between the bridge and the broker
//!
//! The traits here are the seams the rest of the crate talks through, so the
//! telemetry filter and the reauthentication logic can be exercised without a
//! broker.

use bytes::Bytes;
use rumqttc::{EventLoop, MqttOptions, QoS};

pub mod mqtt;

/// Fire-and-forget message publication
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Hand a message to the broker session; no acknowledgement tracking
    /// beyond what `qos` requests from the broker
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), Self::Error>;
}

/// Anything that carries the credentials used on the next connect attempt
pub trait CredentialSink {
    fn apply_credentials(&mut self, username: &str, password: &str);
}

impl CredentialSink for MqttOptions {
    fn apply_credentials(&mut self, username: &str, password: &str) {
        self.set_credentials(username, password);
    }
}

impl CredentialSink for EventLoop {
    fn apply_credentials(&mut self, username: &str, password: &str) {
        self.mqtt_options.set_credentials(username, password);
    }
}
