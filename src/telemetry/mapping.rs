//! Static sensor address to device id table

use crate::config::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

static DEVICE_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._:-]+$").expect("valid regex"));

/// Immutable mapping from physical sensor address to logical device id.
///
/// Addresses are compared case-insensitively (stored upper case), so
/// `aa:bb` and `AA:BB` name the same sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMapping {
    entries: HashMap<String, String>,
}

impl DeviceMapping {
    /// Build the table from configuration entries
    pub fn from_entries(entries: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut normalized = HashMap::with_capacity(entries.len());
        for (address, device_id) in entries {
            let key = normalize_address(address);
            if key.is_empty() {
                return Err(ConfigError::InvalidDeviceMapping(
                    "empty sensor address".to_string(),
                ));
            }
            if !DEVICE_ID_PATTERN.is_match(device_id) {
                return Err(ConfigError::InvalidDeviceMapping(format!(
                    "device id {device_id:?} for sensor {address} must match [A-Za-z0-9._:-]+"
                )));
            }
            if normalized.insert(key.clone(), device_id.clone()).is_some() {
                return Err(ConfigError::InvalidDeviceMapping(format!(
                    "sensor address {key} is mapped more than once"
                )));
            }
        }
        Ok(Self { entries: normalized })
    }

    /// Device id for `address`, if mapped
    pub fn lookup(&self, address: &str) -> Option<&str> {
        self.entries
            .get(&normalize_address(address))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(a, d)| (a.to_string(), d.to_string()))
            .collect()
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mapping = DeviceMapping::from_entries(&entries(&[("aa:2c:6a:1e:59:3d", "sensor_1")])).unwrap();
        assert_eq!(mapping.lookup("AA:2C:6A:1E:59:3D"), Some("sensor_1"));
        assert_eq!(mapping.lookup(" aa:2c:6a:1e:59:3d "), Some("sensor_1"));
        assert_eq!(mapping.lookup("BB:BB"), None);
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_duplicate_after_normalization_rejected() {
        let result = DeviceMapping::from_entries(&entries(&[("aa:aa", "one"), ("AA:AA", "two")]));
        assert!(matches!(result, Err(ConfigError::InvalidDeviceMapping(_))));
    }

    #[test]
    fn test_device_id_charset() {
        for bad in ["", "has space", "slash/inside", "hash#"] {
            let result = DeviceMapping::from_entries(&entries(&[("AA:AA", bad)]));
            assert!(result.is_err(), "{bad:?} should be rejected");
        }
        let ok = DeviceMapping::from_entries(&entries(&[("AA:AA", "Sensor-1.kitchen:temp_2")]));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_empty_address_rejected() {
        let result = DeviceMapping::from_entries(&entries(&[("  ", "sensor_1")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_mapping() {
        let mapping = DeviceMapping::from_entries(&BTreeMap::new()).unwrap();
        assert!(mapping.is_empty());
        assert_eq!(mapping.lookup("AA:AA"), None);
    }
}
