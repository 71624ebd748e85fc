//! Configuration loading and validation tests
//!
//! Tests focus on behavior of configuration loading, validation, and error handling:
//! what a deployment sees when the TOML file or the runtime environment is wrong.

use edge_ptm::config::{BridgeConfig, ConfigError, ModuleIdentity};
use std::collections::HashMap;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
port = 8884
command_topic = "/command"
max_reauth_attempts = 5

[mqtt.reconnect]
max_attempts = 10
backoff_ms = [100, 200]

[token]
ttl_secs = 600
renewal_margin_secs = 60

[devices]
"AA:AA" = "sensor_1"
"BB:BB" = "sensor_2"

[health]
enabled = true
port = 9090
"#
    )
    .unwrap();

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.port, 8884);
    assert_eq!(config.mqtt.max_reauth_attempts, 5);
    assert_eq!(config.mqtt.reconnect.max_attempts, Some(10));
    assert_eq!(config.mqtt.reconnect.backoff_ms, vec![100, 200]);
    assert_eq!(config.token.ttl_secs, 600);
    assert_eq!(config.devices.len(), 2);
    assert!(config.health.enabled);

    let mapping = config.device_mapping().unwrap();
    assert_eq!(mapping.lookup("AA:AA"), Some("sensor_1"));
    assert_eq!(mapping.lookup("cc:cc"), None);
}

#[test]
fn test_empty_file_yields_defaults() {
    let temp_file = NamedTempFile::new().unwrap();

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config, BridgeConfig::default());
    assert_eq!(config.mqtt.port, 8883);
    assert_eq!(config.mqtt.max_reauth_attempts, 3);
    assert_eq!(config.token.ttl_secs, 3600);
    assert!(config.devices.is_empty());
}

#[test]
fn test_config_fails_with_missing_file() {
    let result = BridgeConfig::load_from_file(std::path::Path::new("/nonexistent/edge-ptm.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_fails_with_invalid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[mqtt\nport = ").unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_duplicate_sensor_address_after_normalization_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[devices]
"aa:aa" = "sensor_1"
"AA:AA" = "sensor_2"
"#
    )
    .unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidDeviceMapping(_))));
}

#[test]
fn test_device_id_with_topic_separator_is_rejected() {
    let result = BridgeConfig::load_from_str(
        r#"
[devices]
"AA:AA" = "sensor/1"
"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidDeviceMapping(_))));
}

#[test]
fn test_renewal_margin_must_be_below_ttl() {
    let result = BridgeConfig::load_from_str(
        r#"
[token]
ttl_secs = 60
renewal_margin_secs = 60
"#,
    );
    match result {
        Err(ConfigError::InvalidConfig(message)) => {
            assert!(message.contains("renewal_margin_secs"));
        }
        other => panic!("expected invalid config, got {other:?}"),
    }
}

#[test]
fn test_load_prefers_explicit_path() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[mqtt]\nport = 1884").unwrap();

    let (config, source) = BridgeConfig::load(Some(temp_file.path())).unwrap();

    assert_eq!(config.mqtt.port, 1884);
    assert_eq!(source.as_deref(), Some(temp_file.path()));
}

#[test]
fn test_round_trip_through_rendered_toml() {
    let config = BridgeConfig::load_from_str(
        r#"
[devices]
"AA:AA" = "sensor_1"
"#,
    )
    .unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reloaded = BridgeConfig::load_from_str(&rendered).unwrap();

    assert_eq!(reloaded, config);
}

fn runtime_env() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("IOTEDGE_GATEWAYHOSTNAME", "edgehub"),
        ("IOTEDGE_IOTHUBHOSTNAME", "hub.example.net"),
        ("IOTEDGE_DEVICEID", "gw"),
        ("IOTEDGE_MODULEID", "ptm"),
        ("IOTEDGE_MODULEGENERATIONID", "gen-1"),
        ("IOTEDGE_WORKLOADURI", "unix:///var/run/iotedge/workload.sock"),
        ("IOTEDGE_APIVERSION", "2019-01-30"),
    ])
}

#[test]
fn test_identity_from_edge_runtime_variables() {
    let env = runtime_env();
    let identity = ModuleIdentity::from_lookup(|name| env.get(name).map(|v| v.to_string())).unwrap();

    assert_eq!(identity.client_id(), "gw/ptm");
    assert_eq!(
        identity.username(),
        "hub.example.net/gw/ptm/?api-version=2019-01-30"
    );
    assert_eq!(identity.sas_resource_uri(), "hub.example.net/devices/gw/modules/ptm");
}

#[test]
fn test_identity_primary_names_take_precedence() {
    let mut env = runtime_env();
    env.insert("DEVICE_ID", "override");

    let identity = ModuleIdentity::from_lookup(|name| env.get(name).map(|v| v.to_string())).unwrap();

    assert_eq!(identity.device_id, "override");
}

#[test]
fn test_identity_reports_every_missing_variable() {
    let mut env = runtime_env();
    env.remove("IOTEDGE_DEVICEID");
    env.remove("IOTEDGE_APIVERSION");

    let result = ModuleIdentity::from_lookup(|name| env.get(name).map(|v| v.to_string()));

    match result {
        Err(ConfigError::MissingEnvVar(missing)) => {
            assert_eq!(missing, vec!["DEVICE_ID", "API_VERSION"]);
        }
        other => panic!("expected missing variables, got {other:?}"),
    }
}

#[test]
fn test_identity_rejects_unsupported_workload_scheme() {
    let mut env = runtime_env();
    env.insert("IOTEDGE_WORKLOADURI", "ftp://edge/workload");

    let result = ModuleIdentity::from_lookup(|name| env.get(name).map(|v| v.to_string()));

    assert!(matches!(result, Err(ConfigError::InvalidWorkloadUri { .. })));
}
