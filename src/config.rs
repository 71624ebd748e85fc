//! Configuration for the protocol translation module
//!
//! Two sources feed the bridge:
//!
//! - [`ModuleIdentity`]: the module's identity and workload endpoint, injected by the
//!   edge runtime through environment variables. Every value is required.
//! - [`BridgeConfig`]: tunables and the static device mapping, loaded from a TOML file.
//!   Every section has defaults, so the file itself is optional.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Required identity variables: (primary name, edge runtime name)
pub const IDENTITY_ENV_VARS: [(&str, &str); 7] = [
    ("GATEWAY_HOSTNAME", "IOTEDGE_GATEWAYHOSTNAME"),
    ("IOTHUB_HOSTNAME", "IOTEDGE_IOTHUBHOSTNAME"),
    ("DEVICE_ID", "IOTEDGE_DEVICEID"),
    ("MODULE_ID", "IOTEDGE_MODULEID"),
    ("MODULE_GENERATION_ID", "IOTEDGE_MODULEGENERATIONID"),
    ("WORKLOAD_URI", "IOTEDGE_WORKLOADURI"),
    ("API_VERSION", "IOTEDGE_APIVERSION"),
];

/// Default configuration file locations, tried in order
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["edge-ptm.toml", "config/edge-ptm.toml"];

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Required environment variable(s) not set: {}", .0.join(", "))]
    MissingEnvVar(Vec<String>),
    #[error("Invalid workload URI '{uri}': {reason}")]
    InvalidWorkloadUri { uri: String, reason: String },
    #[error("Invalid device mapping: {0}")]
    InvalidDeviceMapping(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Module identity as provided by the edge runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleIdentity {
    pub gateway_hostname: String,
    pub iothub_hostname: String,
    pub device_id: String,
    pub module_id: String,
    pub module_generation_id: String,
    pub workload_uri: String,
    pub api_version: String,
}

impl ModuleIdentity {
    /// Read the identity from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the identity through an arbitrary variable lookup.
    ///
    /// All missing variables are collected so a misconfigured deployment
    /// reports everything at once.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = Vec::with_capacity(IDENTITY_ENV_VARS.len());
        let mut missing = Vec::new();

        for (primary, runtime_name) in IDENTITY_ENV_VARS {
            let value = lookup(primary)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| lookup(runtime_name).filter(|v| !v.trim().is_empty()));
            match value {
                Some(v) => values.push(v.trim().to_string()),
                None => missing.push(primary.to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingEnvVar(missing));
        }

        let mut values = values.into_iter();
        let mut next = || values.next().unwrap_or_default();
        let identity = Self {
            gateway_hostname: next(),
            iothub_hostname: next(),
            device_id: next(),
            module_id: next(),
            module_generation_id: next(),
            workload_uri: next(),
            api_version: next(),
        };

        identity.validate_workload_uri()?;
        Ok(identity)
    }

    fn validate_workload_uri(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.workload_uri).map_err(|e| ConfigError::InvalidWorkloadUri {
            uri: self.workload_uri.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "unix" | "http" | "https" => Ok(()),
            other => Err(ConfigError::InvalidWorkloadUri {
                uri: self.workload_uri.clone(),
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }

    /// MQTT client identifier: `{device_id}/{module_id}`
    pub fn client_id(&self) -> String {
        format!("{}/{}", self.device_id, self.module_id)
    }

    /// MQTT username: `{hostname}/{device_id}/{module_id}/?api-version={api_version}`
    pub fn username(&self) -> String {
        format!(
            "{}/{}/{}/?api-version={}",
            self.iothub_hostname, self.device_id, self.module_id, self.api_version
        )
    }

    /// Resource URI the security token is scoped to
    pub fn sas_resource_uri(&self) -> String {
        format!(
            "{}/devices/{}/modules/{}",
            self.iothub_hostname, self.device_id, self.module_id
        )
    }
}

/// Bridge configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttSection,
    pub token: TokenSection,
    /// Sensor address => device id
    pub devices: BTreeMap<String, String>,
    pub health: HealthSection,
}

/// Broker session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    /// Broker port on the gateway (TLS)
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Topic subscribed after every accepted connection
    pub command_topic: String,
    /// Capacity of the client request queue
    pub request_capacity: usize,
    /// Consecutive bad-credential results tolerated before giving up
    pub max_reauth_attempts: u32,
    pub reconnect: ReconnectSection,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            port: 8883,
            keep_alive_secs: 60,
            command_topic: "/command".to_string(),
            request_capacity: 64,
            max_reauth_attempts: 3,
            reconnect: ReconnectSection::default(),
        }
    }
}

/// Backoff between reconnection attempts after an established session drops
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    /// None = retry forever
    pub max_attempts: Option<u32>,
    pub backoff_ms: Vec<u64>,
    pub sustained_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: vec![250, 500, 1000, 2500],
            sustained_ms: 5000,
        }
    }
}

/// Security token settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenSection {
    pub ttl_secs: u64,
    /// Refresh proactively when the token expires within this margin
    pub renewal_margin_secs: u64,
    /// Key the workload API signs with
    pub key_id: String,
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            renewal_margin_secs: 120,
            key_id: "primary".to_string(),
        }
    }
}

impl TokenSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.renewal_margin_secs)
    }
}

/// Health endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `explicit` if given, otherwise the first default location that
    /// exists, otherwise built-in defaults. Returns the path actually read.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load_from_file(path)?, Some(path.to_path_buf())));
        }
        for candidate in DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from) {
            if candidate.is_file() {
                let config = Self::load_from_file(&candidate)?;
                return Ok((config, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }

    /// The validated device mapping
    pub fn device_mapping(&self) -> Result<crate::telemetry::DeviceMapping, ConfigError> {
        crate::telemetry::DeviceMapping::from_entries(&self.devices)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.port must be non-zero".to_string(),
            ));
        }
        if self.mqtt.command_topic.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.command_topic must not be empty".to_string(),
            ));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_capacity must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.max_reauth_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.max_reauth_attempts must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.max_attempts must be greater than 0 or omitted".to_string(),
            ));
        }
        if self.mqtt.reconnect.sustained_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.sustained_ms must be greater than 0".to_string(),
            ));
        }
        if self.token.ttl_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "token.ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.token.renewal_margin_secs >= self.token.ttl_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "token.renewal_margin_secs ({}) must be less than token.ttl_secs ({})",
                self.token.renewal_margin_secs, self.token.ttl_secs
            )));
        }
        if self.token.key_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "token.key_id must not be empty".to_string(),
            ));
        }

        self.device_mapping()?;
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
port = 8883
command_topic = "/command"

[token]
ttl_secs = 3600

[devices]
"AA:2C:6A:1E:59:3D" = "sensor_1"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("GATEWAY_HOSTNAME", "edgehub"),
            ("IOTHUB_HOSTNAME", "myhub.azure-devices.net"),
            ("DEVICE_ID", "gateway-1"),
            ("MODULE_ID", "ptm"),
            ("MODULE_GENERATION_ID", "637000000000000000"),
            ("WORKLOAD_URI", "unix:///var/run/iotedge/workload.sock"),
            ("API_VERSION", "2019-01-30"),
        ])
    }

    fn lookup_in<'a>(
        env: &'a HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| env.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_identity_from_complete_environment() {
        let env = full_env();
        let identity = ModuleIdentity::from_lookup(lookup_in(&env)).unwrap();

        assert_eq!(identity.gateway_hostname, "edgehub");
        assert_eq!(identity.client_id(), "gateway-1/ptm");
        assert_eq!(
            identity.username(),
            "myhub.azure-devices.net/gateway-1/ptm/?api-version=2019-01-30"
        );
        assert_eq!(
            identity.sas_resource_uri(),
            "myhub.azure-devices.net/devices/gateway-1/modules/ptm"
        );
    }

    #[test]
    fn test_identity_reports_every_missing_variable() {
        let mut env = full_env();
        env.remove("DEVICE_ID");
        env.remove("API_VERSION");

        let err = ModuleIdentity::from_lookup(lookup_in(&env)).unwrap_err();
        match err {
            ConfigError::MissingEnvVar(names) => {
                assert_eq!(names, vec!["DEVICE_ID".to_string(), "API_VERSION".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_identity_blank_value_counts_as_missing() {
        let mut env = full_env();
        env.insert("MODULE_ID", "   ");

        let err = ModuleIdentity::from_lookup(lookup_in(&env)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref names) if names == &["MODULE_ID"]));
    }

    #[test]
    fn test_identity_falls_back_to_runtime_names() {
        let env: HashMap<&'static str, &'static str> = HashMap::from([
            ("IOTEDGE_GATEWAYHOSTNAME", "edgehub"),
            ("IOTEDGE_IOTHUBHOSTNAME", "hub.example.net"),
            ("IOTEDGE_DEVICEID", "dev"),
            ("IOTEDGE_MODULEID", "mod"),
            ("IOTEDGE_MODULEGENERATIONID", "gen"),
            ("IOTEDGE_WORKLOADURI", "http://127.0.0.1:15580/"),
            ("IOTEDGE_APIVERSION", "2019-01-30"),
        ]);

        let identity = ModuleIdentity::from_lookup(lookup_in(&env)).unwrap();
        assert_eq!(identity.device_id, "dev");
        assert_eq!(identity.workload_uri, "http://127.0.0.1:15580/");
    }

    #[test]
    fn test_identity_primary_name_wins_over_runtime_name() {
        let mut env = full_env();
        env.insert("IOTEDGE_DEVICEID", "other-device");

        let identity = ModuleIdentity::from_lookup(lookup_in(&env)).unwrap();
        assert_eq!(identity.device_id, "gateway-1");
    }

    #[test]
    fn test_identity_rejects_unsupported_workload_scheme() {
        let mut env = full_env();
        env.insert("WORKLOAD_URI", "ftp://somewhere/");

        let err = ModuleIdentity::from_lookup(lookup_in(&env)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWorkloadUri { .. }));
    }

    #[test]
    fn test_defaults_when_file_is_empty() {
        let config = BridgeConfig::load_from_str("").unwrap();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.command_topic, "/command");
        assert_eq!(config.mqtt.max_reauth_attempts, 3);
        assert_eq!(config.token.ttl_secs, 3600);
        assert_eq!(config.token.key_id, "primary");
        assert!(config.devices.is_empty());
        assert!(!config.health.enabled);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
port = 8884
keep_alive_secs = 30
command_topic = "/cmd"
max_reauth_attempts = 5

[mqtt.reconnect]
max_attempts = 10
backoff_ms = [100, 200]
sustained_ms = 1000

[token]
ttl_secs = 600
renewal_margin_secs = 60

[devices]
"FE:36:EA:1E:62:AF" = "sensor_1"
"E4:F2:81:30:8D:52" = "sensor_3"

[health]
enabled = true
port = 9090
"#;

        let config = BridgeConfig::load_from_str(toml_content).unwrap();
        assert_eq!(config.mqtt.port, 8884);
        assert_eq!(config.mqtt.reconnect.max_attempts, Some(10));
        assert_eq!(config.mqtt.reconnect.backoff_ms, vec![100, 200]);
        assert_eq!(config.token.ttl(), Duration::from_secs(600));
        assert_eq!(config.token.renewal_margin(), Duration::from_secs(60));
        assert_eq!(config.devices.len(), 2);
        assert!(config.health.enabled);
        assert_eq!(config.health.port, 9090);
    }

    #[test]
    fn test_renewal_margin_must_be_below_ttl() {
        let result = BridgeConfig::load_from_str("[token]\nttl_secs = 60\nrenewal_margin_secs = 60\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_reauth_attempts_rejected() {
        let result = BridgeConfig::load_from_str("[mqtt]\nmax_reauth_attempts = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_device_id_rejected() {
        let result = BridgeConfig::load_from_str("[devices]\n\"AA:AA\" = \"bad id\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidDeviceMapping(_))));
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[devices]\n\"aa:bb\" = \"sensor_9\"\n").unwrap();

        let (config, source) = BridgeConfig::load(Some(file.path())).unwrap();
        assert_eq!(source.as_deref(), Some(file.path()));
        assert_eq!(config.device_mapping().unwrap().lookup("AA:BB"), Some("sensor_9"));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let result = BridgeConfig::load(Some(Path::new("/nonexistent/edge-ptm.toml")));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_test_config_round_trips_through_toml() {
        let config = BridgeConfig::test_config();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed = BridgeConfig::load_from_str(&rendered).unwrap();
        assert_eq!(config, reparsed);
    }
}
