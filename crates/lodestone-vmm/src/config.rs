//! VM configuration, loaded from JSON.
//!
//! ```json
//! {
//!   "vcpus": 2,
//!   "devices": [
//!     { "name": "bios", "driver": "bios" },
//!     { "name": "ram", "driver": "user-memory", "data": { "size": 268435456 } },
//!     { "name": "com1", "driver": "uart", "debug": true }
//!   ],
//!   "eventfds": { "enabled": true, "threshold": 100 }
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::devices::{lookup_driver, DeviceInfo};
use crate::devices::user_memory::DEFAULT_MEMORY_SIZE;
use crate::eventfd::EventfdPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("A VM needs at least one VCPU")]
    NoVcpus,

    #[error("Device name {0:?} used twice")]
    DuplicateDevice(String),

    #[error("Device {name:?} uses unknown driver {driver:?}")]
    UnknownDriver { name: String, driver: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub vcpus: u32,
    /// Attached in order.  Devices reserving fixed ranges must come before
    /// `user-memory`.
    pub devices: Vec<DeviceInfo>,
    pub eventfds: EventfdPolicy,
    /// Turns on per-access tracing for every device.
    pub debug: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            devices: default_devices(DEFAULT_MEMORY_SIZE),
            eventfds: EventfdPolicy::default(),
            debug: false,
        }
    }
}

/// BIOS reservations, PCI bus, COM1 and `memory` bytes of RAM.
pub fn default_devices(memory: u64) -> Vec<DeviceInfo> {
    vec![
        DeviceInfo::new("bios", "bios", Value::Null),
        DeviceInfo::new("pci", "pci-bus", Value::Null),
        DeviceInfo::new("com1", "uart", Value::Null),
        DeviceInfo::new("ram", "user-memory", json!({ "size": memory })),
    ]
}

impl VmConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vcpus == 0 {
            return Err(ConfigError::NoVcpus);
        }
        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
            if lookup_driver(&device.driver).is_none() {
                return Err(ConfigError::UnknownDriver {
                    name: device.name.clone(),
                    driver: device.driver.clone(),
                });
            }
        }
        Ok(())
    }

    /// Sets the size of every `user-memory` device.
    pub fn set_memory_size(&mut self, bytes: u64) {
        for device in &mut self.devices {
            if device.driver == "user-memory" {
                device.data = json!({ "size": bytes });
            }
        }
    }

    /// Device list with the global debug flag applied.
    pub fn effective_devices(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .cloned()
            .map(|mut d| {
                d.debug |= self.debug;
                d
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = VmConfig::default();
        assert_eq!(config.vcpus, 1);
        assert_eq!(config.eventfds.threshold, 100);
        let drivers: Vec<&str> = config.devices.iter().map(|d| d.driver.as_str()).collect();
        assert_eq!(drivers, ["bios", "pci-bus", "uart", "user-memory"]);
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = VmConfig::from_json(r#"{ "vcpus": 4, "eventfds": { "threshold": 8 } }"#).unwrap();
        assert_eq!(config.vcpus, 4);
        assert!(config.eventfds.enabled);
        assert_eq!(config.eventfds.threshold, 8);
        assert_eq!(config.devices.len(), 4);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            VmConfig::from_json(r#"{ "vcpus": 0 }"#),
            Err(ConfigError::NoVcpus)
        ));
        assert!(matches!(
            VmConfig::from_json(
                r#"{ "devices": [ { "name": "a", "driver": "bios" }, { "name": "a", "driver": "uart" } ] }"#
            ),
            Err(ConfigError::DuplicateDevice(n)) if n == "a"
        ));
        assert!(matches!(
            VmConfig::from_json(r#"{ "devices": [ { "name": "fd0", "driver": "floppy" } ] }"#),
            Err(ConfigError::UnknownDriver { driver, .. }) if driver == "floppy"
        ));
        assert!(matches!(VmConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn memory_size_and_debug_overrides() {
        let mut config = VmConfig {
            debug: true,
            ..VmConfig::default()
        };
        config.set_memory_size(64 << 20);
        let devices = config.effective_devices();
        assert!(devices.iter().all(|d| d.debug));
        let ram = devices.iter().find(|d| d.driver == "user-memory").unwrap();
        assert_eq!(ram.data["size"], 64 << 20);
    }

    #[test]
    fn round_trips_through_json() {
        let config = VmConfig::default();
        let text = config.to_json().unwrap();
        assert_eq!(VmConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = VmConfig::from_file(Path::new("/nonexistent/lodestone.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lodestone.json"));
    }
}
