//! Fixed low-level reservations of a PC-compatible machine.
//!
//! The BIOS device has no registers.  It claims:
//!
//! ```text
//! 0x0000_0000  page 0                  reserved
//! 0xfffb_c000  identity map + TSS      special
//! 0xfffc_0000  up to 4 GiB             reserved
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AttachContext, Device, DeviceError, DeviceInfo};
use crate::io::DeviceCore;
use crate::memory::MemoryType;
use crate::verified::region::{FOUR_GIB, PAGE_SIZE};

/// Default location of the special identity-map and TSS pages.
pub const DEFAULT_TSS_ADDRESS: u64 = 0xfffb_c000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiosConfig {
    /// Guest address of the special pages.
    pub tss: u64,
}

impl Default for BiosConfig {
    fn default() -> Self {
        Self {
            tss: DEFAULT_TSS_ADDRESS,
        }
    }
}

pub struct Bios {
    core: Arc<DeviceCore>,
    config: BiosConfig,
}

impl Bios {
    pub fn create(info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
        let config: BiosConfig = info.config()?;
        Ok(Arc::new(Self {
            core: DeviceCore::new(&info.name, &info.driver),
            config,
        }))
    }
}

impl Device for Bios {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }

    fn attach(&self, ctx: &mut AttachContext<'_>) -> Result<(), DeviceError> {
        let platform = ctx.platform.as_ref();
        let name = self.name();
        let tss = self.config.tss;
        let special = platform.special_memory_size();
        let tss_end = tss + special;
        if tss_end > FOUR_GIB {
            return Err(DeviceError::Invalid {
                device: name.to_string(),
                reason: format!("special pages at {tss:#x} cross 4 GiB"),
            });
        }

        ctx.memory
            .reserve(platform, name, MemoryType::Reserved, 0, PAGE_SIZE, None)?;
        ctx.memory
            .reserve(platform, name, MemoryType::Special, tss, special, None)?;
        if tss_end < FOUR_GIB {
            ctx.memory.reserve(
                platform,
                name,
                MemoryType::Reserved,
                tss_end,
                FOUR_GIB - tss_end,
                None,
            )?;
        }
        Ok(())
    }
}
