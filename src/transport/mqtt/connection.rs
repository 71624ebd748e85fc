//! Pure connection state management for the bridge's broker session
//!
//! This module contains the bridge state machine's states, connect-result
//! classification, session option construction and topic construction.

use crate::config::{ModuleIdentity, MqttSection, ReconnectSection};
use crate::credentials::SecurityToken;
use rumqttc::{ConnectReturnCode, MqttOptions, TlsConfiguration, Transport};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// CONNACK return code the broker uses for a bad user name or password
pub const BAD_CREDENTIALS_CODE: u8 = 4;

/// Largest packet accepted or sent, matching the hub's message size limit
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Process-wide bridge state
///
/// `Starting → Connecting → Connected ⇄ Reauthenticating → Connected → ShuttingDown`,
/// with `Failed` terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum BridgeState {
    Starting,
    Connecting,
    Connected,
    Reauthenticating,
    ShuttingDown,
    Failed(String),
}

impl BridgeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeState::Failed(_))
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            BridgeState::Starting => "starting",
            BridgeState::Connecting => "connecting",
            BridgeState::Connected => "connected",
            BridgeState::Reauthenticating => "reauthenticating",
            BridgeState::ShuttingDown => "shutting_down",
            BridgeState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Outcome of one connection attempt as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Accepted,
    /// Code 4: the token was rejected, usually because it expired
    BadCredentials,
    /// Any other refusal; not recoverable by refreshing the token
    Refused(u8),
}

impl ConnectResult {
    /// Classify a raw CONNACK return code
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ConnectResult::Accepted,
            BAD_CREDENTIALS_CODE => ConnectResult::BadCredentials,
            other => ConnectResult::Refused(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ConnectResult::Accepted => 0,
            ConnectResult::BadCredentials => BAD_CREDENTIALS_CODE,
            ConnectResult::Refused(code) => *code,
        }
    }
}

impl From<ConnectReturnCode> for ConnectResult {
    fn from(code: ConnectReturnCode) -> Self {
        let raw = match code {
            ConnectReturnCode::Success => 0,
            ConnectReturnCode::RefusedProtocolVersion => 1,
            ConnectReturnCode::BadClientId => 2,
            ConnectReturnCode::ServiceUnavailable => 3,
            ConnectReturnCode::BadUserNamePassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
        };
        ConnectResult::from_code(raw)
    }
}

/// Reconnection configuration for drops after the session was established
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_ms,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Broker session errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Broker refused connection with return code {code}")]
    Refused { code: u8 },
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Reconnection abandoned after {attempts} attempts: {reason}")]
    ReconnectExhausted { attempts: u32, reason: String },
    #[error("Invalid broker settings: {0}")]
    InvalidSettings(String),
}

/// Build session options for the edge hub.
///
/// Client id `{device_id}/{module_id}`, username carrying the api-version,
/// password = current token, TLS trusting only `ca_pem`.
pub fn configure_mqtt_options(
    identity: &ModuleIdentity,
    config: &MqttSection,
    host: &str,
    port: u16,
    token: &SecurityToken,
    ca_pem: &str,
) -> Result<MqttOptions, MqttError> {
    if host.trim().is_empty() {
        return Err(MqttError::InvalidSettings("empty broker host".to_string()));
    }
    if port == 0 {
        return Err(MqttError::InvalidSettings("broker port 0".to_string()));
    }
    if ca_pem.trim().is_empty() {
        return Err(MqttError::InvalidSettings(
            "empty trust bundle for TLS verification".to_string(),
        ));
    }

    let mut mqtt_options = MqttOptions::new(identity.client_id(), host, port);
    mqtt_options.set_credentials(identity.username(), token.as_str());
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    let tls = TlsConfiguration::Simple {
        ca: ca_pem.as_bytes().to_vec(),
        alpn: None,
        client_auth: None,
    };
    mqtt_options.set_transport(Transport::tls_with_config(tls));

    Ok(mqtt_options)
}

/// Topic construction
pub struct TopicBuilder;

impl TopicBuilder {
    /// Telemetry topic for a logical device: `$iothub/{device_id}/messages/events`
    pub fn telemetry_topic(device_id: &str) -> String {
        format!("$iothub/{device_id}/messages/events")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ModuleIdentity {
        ModuleIdentity {
            gateway_hostname: "edgehub".to_string(),
            iothub_hostname: "hub.example.net".to_string(),
            device_id: "gw".to_string(),
            module_id: "ptm".to_string(),
            module_generation_id: "gen".to_string(),
            workload_uri: "unix:///tmp/workload.sock".to_string(),
            api_version: "2019-01-30".to_string(),
        }
    }

    fn token() -> SecurityToken {
        SecurityToken::new("hub.example.net/devices/gw/modules/ptm", "c2ln", 2000, Duration::from_secs(3600))
    }

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_connect_result_classification() {
        assert_eq!(ConnectResult::from_code(0), ConnectResult::Accepted);
        assert_eq!(ConnectResult::from_code(4), ConnectResult::BadCredentials);
        assert_eq!(ConnectResult::from_code(5), ConnectResult::Refused(5));
        assert_eq!(ConnectResult::from_code(3).code(), 3);
    }

    #[test]
    fn test_only_code_four_means_bad_credentials() {
        for code in 0u8..=255 {
            let result = ConnectResult::from_code(code);
            assert_eq!(
                result == ConnectResult::BadCredentials,
                code == BAD_CREDENTIALS_CODE,
                "code {code}"
            );
        }
    }

    #[test]
    fn test_connect_return_code_conversion() {
        assert_eq!(
            ConnectResult::from(ConnectReturnCode::BadUserNamePassword),
            ConnectResult::BadCredentials
        );
        assert_eq!(
            ConnectResult::from(ConnectReturnCode::Success),
            ConnectResult::Accepted
        );
        assert_eq!(
            ConnectResult::from(ConnectReturnCode::NotAuthorized),
            ConnectResult::Refused(5)
        );
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options =
            configure_mqtt_options(&identity(), &MqttSection::default(), "edgehub", 8883, &token(), PEM)
                .unwrap();

        assert_eq!(options.client_id(), "gw/ptm");
        assert_eq!(options.broker_address(), ("edgehub".to_string(), 8883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        let (username, password) = options.credentials().unwrap();
        assert_eq!(username, "hub.example.net/gw/ptm/?api-version=2019-01-30");
        assert_eq!(password, token().as_str());
    }

    #[test]
    fn test_configure_rejects_missing_trust_bundle() {
        let result =
            configure_mqtt_options(&identity(), &MqttSection::default(), "edgehub", 8883, &token(), "");
        assert!(matches!(result, Err(MqttError::InvalidSettings(_))));
    }

    #[test]
    fn test_configure_rejects_empty_host() {
        let result =
            configure_mqtt_options(&identity(), &MqttSection::default(), " ", 8883, &token(), PEM);
        assert!(matches!(result, Err(MqttError::InvalidSettings(_))));
    }

    #[test]
    fn test_telemetry_topic() {
        assert_eq!(
            TopicBuilder::telemetry_topic("sensor_1"),
            "$iothub/sensor_1/messages/events"
        );
    }

    #[test]
    fn test_backoff_delay_pattern_then_sustained() {
        let config = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100],
            sustained_delay: 250,
        };
        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(3), 100);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(100), 250);
    }

    #[test]
    fn test_reconnect_config_from_section() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![250, 500, 1000, 2500]);
        assert_eq!(config.sustained_delay, 5000);
    }

    #[test]
    fn test_bridge_state_display() {
        assert_eq!(BridgeState::Connected.to_string(), "connected");
        assert_eq!(
            BridgeState::Failed("refresh failed".into()).to_string(),
            "failed (refresh failed)"
        );
        assert!(BridgeState::Failed(String::new()).is_terminal());
        assert!(!BridgeState::Reauthenticating.is_terminal());
    }
}
