//! Sensor telemetry: the feed, the device mapping and the filter that turns
//! readings into broker publishes

pub mod filter;
pub mod mapping;
pub mod sensor;

pub use filter::{FilterOutcome, TelemetryFilter, TELEMETRY_QOS};
pub use mapping::DeviceMapping;
pub use sensor::{ChannelSensorSource, LineSensorSource, SensorReading, SensorSource};
