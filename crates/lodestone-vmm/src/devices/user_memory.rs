//! Guest RAM.
//!
//! One anonymous mapping is carved into as many user regions as it takes to
//! fill the free gaps of the address space, lowest address first.  Attach
//! it after the devices that reserve fixed ranges.

use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AttachContext, Device, DeviceError, DeviceInfo};
use crate::io::DeviceCore;
use crate::memory::{Backing, MemoryType};
use crate::verified::region::page_align_up;

pub const DEFAULT_MEMORY_SIZE: u64 = 128 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMemoryConfig {
    /// Bytes of guest RAM, rounded up to a page.
    pub size: u64,
}

impl Default for UserMemoryConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_MEMORY_SIZE,
        }
    }
}

pub struct UserMemory {
    core: Arc<DeviceCore>,
    config: UserMemoryConfig,
}

impl UserMemory {
    pub fn create(info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
        let config: UserMemoryConfig = info.config()?;
        if config.size == 0 {
            return Err(DeviceError::Invalid {
                device: info.name.clone(),
                reason: "memory size is zero".to_string(),
            });
        }
        Ok(Arc::new(Self {
            core: DeviceCore::new(&info.name, &info.driver),
            config,
        }))
    }
}

impl Device for UserMemory {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }

    fn attach(&self, ctx: &mut AttachContext<'_>) -> Result<(), DeviceError> {
        let name = self.name();
        let total = page_align_up(self.config.size).ok_or_else(|| DeviceError::Invalid {
            device: name.to_string(),
            reason: format!("memory size {:#x} overflows", self.config.size),
        })?;
        let backing = Backing::anonymous(total as usize)?;

        let mut placed = 0u64;
        for gap in ctx.memory.gaps(0, u64::MAX) {
            if placed == total {
                break;
            }
            let len = gap.size.min(total - placed);
            let window = backing
                .window(placed as usize, len as usize)
                .ok_or_else(|| DeviceError::Invalid {
                    device: name.to_string(),
                    reason: format!("backing window at {placed:#x} out of range"),
                })?;
            ctx.memory.reserve(
                ctx.platform.as_ref(),
                name,
                MemoryType::User,
                gap.start,
                len,
                Some(window),
            )?;
            placed += len;
        }

        if placed < total {
            return Err(DeviceError::Invalid {
                device: name.to_string(),
                reason: format!("only {placed:#x} of {total:#x} bytes fit"),
            });
        }
        info!("{name}: {} MiB of guest RAM", total >> 20);
        Ok(())
    }
}
