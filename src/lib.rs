//! Edge protocol translation module
//!
//! Bridges readings from local sensors (typically BLE environmental sensors
//! reported by an external scanner) into an edge hub over MQTT 3.1.1, with a
//! security token signed by the edge runtime's workload API.
//!
//! # Overview
//!
//! - [`config`] - module identity from the environment, tunables and the
//!   device mapping from TOML
//! - [`credentials`] - the Credential Provider: token issuance and refresh
//! - [`transport`] - the Bridge Client and its reauthentication rule
//! - [`telemetry`] - sensor feeds and the Telemetry Filter
//! - [`bridge`] - the dispatch loop tying them together
//! - [`observability`] - logging, metrics and the health endpoint
//!
//! # Quick Start
//!
//! ```rust
//! use edge_ptm::telemetry::{DeviceMapping, FilterOutcome, TelemetryFilter};
//! use edge_ptm::testing::MockPublisher;
//! use bytes::Bytes;
//! use std::collections::BTreeMap;
//!
//! # tokio_test::block_on(async {
//! let entries = BTreeMap::from([("AA:AA".to_string(), "sensor_1".to_string())]);
//! let mapping = DeviceMapping::from_entries(&entries).unwrap();
//! let publisher = MockPublisher::new();
//! let filter = TelemetryFilter::new(mapping, publisher.clone());
//!
//! let outcome = filter.handle("AA:AA", Bytes::from_static(b"23.5")).await;
//! assert!(matches!(outcome, FilterOutcome::Published { .. }));
//! assert_eq!(publisher.published()[0].topic, "$iothub/sensor_1/messages/events");
//! # });
//! ```

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod observability;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use bridge::{run_bridge, Bridge};
pub use config::{BridgeConfig, ConfigError, ModuleIdentity};
pub use credentials::{CredentialError, CredentialProvider, SecurityToken};
pub use error::{BridgeError, BridgeResult};
pub use telemetry::{DeviceMapping, FilterOutcome, TelemetryFilter};
pub use transport::mqtt::{BridgeClient, BridgeState};
