//! Telemetry filter: mapped sensors are republished, the rest dropped

use super::mapping::DeviceMapping;
use crate::observability::metrics::metrics;
use crate::transport::mqtt::TopicBuilder;
use crate::transport::Publisher;
use bytes::Bytes;
use rumqttc::QoS;
use tracing::{debug, warn};

/// QoS for every telemetry publish
pub const TELEMETRY_QOS: QoS = QoS::AtLeastOnce;

/// What happened to one reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Handed to the broker session
    Published { device_id: String, topic: String },
    /// Address not in the mapping; logged and dropped
    UnknownSensor,
    /// Mapped, but the session refused the message
    PublishFailed { device_id: String, reason: String },
}

/// Maps readings to devices and publishes them
pub struct TelemetryFilter<P: Publisher> {
    mapping: DeviceMapping,
    publisher: P,
}

impl<P: Publisher> TelemetryFilter<P> {
    pub fn new(mapping: DeviceMapping, publisher: P) -> Self {
        Self { mapping, publisher }
    }

    /// Publish `payload` unmodified to the mapped device's topic, or drop it.
    /// Never fails and never retries.
    pub async fn handle(&self, sensor_id: &str, payload: Bytes) -> FilterOutcome {
        metrics().record_reading_received();

        let Some(device_id) = self.mapping.lookup(sensor_id) else {
            warn!(sensor = sensor_id, "Discarding reading from unknown sensor");
            metrics().record_discarded();
            return FilterOutcome::UnknownSensor;
        };

        let topic = TopicBuilder::telemetry_topic(device_id);
        match self.publisher.publish(&topic, payload, TELEMETRY_QOS).await {
            Ok(()) => {
                debug!(sensor = sensor_id, device = device_id, topic = %topic, "Reading published");
                metrics().record_published();
                FilterOutcome::Published {
                    device_id: device_id.to_string(),
                    topic,
                }
            }
            Err(e) => {
                warn!(device = device_id, "Publish failed, reading dropped: {}", e);
                metrics().record_publish_failure();
                FilterOutcome::PublishFailed {
                    device_id: device_id.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn mapping(&self) -> &DeviceMapping {
        &self.mapping
    }
}
