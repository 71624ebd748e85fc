//! Broker session for the edge hub
//!
//! Pure decisions are kept apart from I/O so the reauthentication rule can be
//! tested without a broker:
//!
//! - [`connection`] - states, connect-result classification, session options
//! - [`message_handler`] - routing of network loop events and errors
//! - [`health_monitor`] - the state machine and reconnection policy
//! - [`client`] - [`BridgeClient`], the impure session wrapper
//!
//! # Usage
//!
//! ```rust,no_run
//! use edge_ptm::config::{BridgeConfig, ModuleIdentity};
//! use edge_ptm::credentials::CredentialProvider;
//! use edge_ptm::transport::mqtt::BridgeClient;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = BridgeConfig::default();
//! let identity = ModuleIdentity::from_env()?;
//! let provider = Arc::new(CredentialProvider::from_environment(&config.token).await?);
//!
//! let (client, mut event_loop) = BridgeClient::connect(
//!     &identity,
//!     &config.mqtt,
//!     provider,
//!     &identity.gateway_hostname,
//!     config.mqtt.port,
//! )
//! .await?;
//! let first = event_loop.poll().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{BridgeClient, ConnectOutcome, MqttPublisher};
pub use connection::{
    BridgeState, ConnectResult, MqttError, ReconnectConfig, TopicBuilder, BAD_CREDENTIALS_CODE,
};
pub use health_monitor::{BridgeEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{ErrorRoute, EventRoute, MessageHandler};
