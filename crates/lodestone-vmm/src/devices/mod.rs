//! Device model for the Lodestone VMM.
//!
//! Every device implements [`Device`]: it has a name and a driver, and it
//! attaches to the machine once at setup, reserving memory and interrupt
//! lines.  I/O capabilities are optional and explicit:
//!
//! - [`PioCapable`]: exposes port-I/O handlers.
//! - [`MmioCapable`]: exposes memory-mapped handlers.
//! - [`Stateful`]: can save and restore its state as JSON.
//!
//! Devices are instantiated by driver name through the static [`DRIVERS`]
//! table from a [`DeviceInfo`] record.

pub mod bios;
pub mod invalid;
pub mod pci;
pub mod serial;
pub mod user_memory;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::io::{DeviceCore, IoError, IoHandler};
use crate::memory::{AddressSpace, MemoryError};
use crate::model::{InterruptMap, TopologyHandle};
use crate::platform::{PlatformError, VmPlatform};
use crate::verified::pause::PauseError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Unknown driver {0:?}")]
    UnknownDriver(String),

    #[error("{device}: invalid configuration: {source}")]
    Config {
        device: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Interrupt {irq} already assigned to {owner}")]
    InterruptConflict { irq: u32, owner: String },

    #[error("No free interrupt lines left")]
    InterruptsExhausted,

    #[error("No PCI bus attached")]
    PciBusNotFound,

    #[error("PCI bus has no free slot")]
    PciBusFull,

    #[error("{device}: {reason}")]
    Invalid { device: String, reason: String },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Pause(#[from] PauseError),
}

/// Serialisable description of one device instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub driver: String,
    /// Driver-specific configuration, or saved state.
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub debug: bool,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, driver: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            data,
            debug: false,
        }
    }

    /// Parses `data` into a driver configuration; `null` selects defaults.
    pub fn config<T: DeserializeOwned + Default>(&self) -> Result<T, DeviceError> {
        if self.data.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.data.clone()).map_err(|source| DeviceError::Config {
            device: self.name.clone(),
            source,
        })
    }
}

/// Machine resources a device may claim while attaching.
pub struct AttachContext<'a> {
    pub platform: &'a Arc<dyn VmPlatform>,
    pub memory: &'a mut AddressSpace,
    pub interrupts: &'a mut InterruptMap,
    /// Devices attached before this one.
    pub devices: &'a [Arc<dyn Device>],
    /// Requests a dispatch-cache rebuild after runtime topology changes.
    pub topology: TopologyHandle,
}

pub trait Device: Send + Sync {
    fn core(&self) -> &Arc<DeviceCore>;

    fn name(&self) -> &str {
        &self.core().name
    }

    fn driver(&self) -> &str {
        &self.core().driver
    }

    /// Driver configuration as it would appear in a [`DeviceInfo`].
    fn config(&self) -> Value;

    fn attach(&self, ctx: &mut AttachContext<'_>) -> Result<(), DeviceError>;

    fn as_pio(&self) -> Option<&dyn PioCapable> {
        None
    }

    fn as_mmio(&self) -> Option<&dyn MmioCapable> {
        None
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        None
    }

    fn as_pci_bus(&self) -> Option<&pci::PciBus> {
        None
    }
}

pub trait PioCapable {
    fn pio_handlers(&self) -> Vec<IoHandler>;
}

pub trait MmioCapable {
    fn mmio_handlers(&self) -> Vec<IoHandler>;
}

pub trait Stateful {
    fn save(&self) -> Result<Value, DeviceError>;

    fn load(&self, state: &Value) -> Result<(), DeviceError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Driver registry
// ═══════════════════════════════════════════════════════════════════════

pub type Constructor = fn(&DeviceInfo) -> Result<Arc<dyn Device>, DeviceError>;

/// Driver name to constructor.
pub static DRIVERS: &[(&str, Constructor)] = &[
    ("bios", bios::Bios::create),
    ("user-memory", user_memory::UserMemory::create),
    ("uart", serial::Uart::create),
    ("pci-bus", pci::PciBus::create),
    ("pci-scratch", pci::PciScratch::create),
];

pub fn lookup_driver(driver: &str) -> Option<Constructor> {
    DRIVERS
        .iter()
        .find(|(name, _)| *name == driver)
        .map(|&(_, ctor)| ctor)
}

/// Instantiates `info` through the registry and applies its debug flag.
pub fn create_device(info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
    let ctor =
        lookup_driver(&info.driver).ok_or_else(|| DeviceError::UnknownDriver(info.driver.clone()))?;
    let device = ctor(info)?;
    device.core().set_debug(info.debug);
    Ok(device)
}
