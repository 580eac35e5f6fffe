//! The machine model: devices, their memory and interrupt claims, and the
//! dispatch caches that route guest I/O to them.
//!
//! Devices attach one at a time, in order.  After any change to the device
//! list or to a device's address claims (for example a PCI BAR move), the
//! model rebuilds both dispatch caches from scratch and swaps them in;
//! VCPUs already dispatching through an old cache finish on it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use log::{info, warn};

use crate::cache::IoDispatchCache;
use crate::devices::invalid::invalid_handler;
use crate::devices::{create_device, AttachContext, Device, DeviceError, DeviceInfo};
use crate::eventfd::EventfdPolicy;
use crate::io::{IoError, IoEvent, IoHandler, IoSpace};
use crate::memory::{AddressSpace, RegionRecord};
use crate::platform::VmPlatform;

/// First line handed out when a device does not ask for a specific one.
pub const FIRST_DYNAMIC_IRQ: u32 = 16;
/// Lines of the in-kernel IOAPIC.
pub const IRQ_LINES: u32 = 24;

// ═══════════════════════════════════════════════════════════════════════
//  Interrupts
// ═══════════════════════════════════════════════════════════════════════

/// Interrupt line to owning device.
#[derive(Debug, Default)]
pub struct InterruptMap {
    lines: BTreeMap<u32, String>,
}

impl InterruptMap {
    /// Claims `wanted` for `owner`, or the first free line from
    /// [`FIRST_DYNAMIC_IRQ`] when `wanted` is `None`.
    pub fn allocate(&mut self, owner: &str, wanted: Option<u32>) -> Result<u32, DeviceError> {
        let irq = match wanted {
            Some(irq) => {
                if let Some(current) = self.lines.get(&irq) {
                    return Err(DeviceError::InterruptConflict {
                        irq,
                        owner: current.clone(),
                    });
                }
                irq
            }
            None => (FIRST_DYNAMIC_IRQ..IRQ_LINES)
                .find(|irq| !self.lines.contains_key(irq))
                .ok_or(DeviceError::InterruptsExhausted)?,
        };
        self.lines.insert(irq, owner.to_string());
        Ok(irq)
    }

    pub fn owner(&self, irq: u32) -> Option<&str> {
        self.lines.get(&irq).map(String::as_str)
    }

    pub fn assignments(&self) -> impl Iterator<Item = (u32, &str)> {
        self.lines.iter().map(|(&irq, owner)| (irq, owner.as_str()))
    }
}

/// Lets a device ask for a dispatch-cache rebuild without owning the model.
#[derive(Clone, Default)]
pub struct TopologyHandle(Weak<Model>);

impl TopologyHandle {
    /// A handle not connected to any model; `flush` does nothing.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn flush(&self) {
        if let Some(model) = self.0.upgrade() {
            model.flush();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Model
// ═══════════════════════════════════════════════════════════════════════

pub struct Model {
    me: Weak<Model>,
    platform: Arc<dyn VmPlatform>,
    policy: EventfdPolicy,
    memory: Mutex<AddressSpace>,
    interrupts: Mutex<InterruptMap>,
    devices: RwLock<Vec<Arc<dyn Device>>>,
    pio: RwLock<Arc<IoDispatchCache>>,
    mmio: RwLock<Arc<IoDispatchCache>>,
    invalid_pio: IoHandler,
    invalid_mmio: IoHandler,
    /// Serialises cache rebuilds so the last swap reflects the latest
    /// topology.
    flushing: Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Model {
    /// An empty machine: no devices, every access hits the invalid device.
    pub fn new(platform: Arc<dyn VmPlatform>, policy: EventfdPolicy) -> Result<Arc<Self>, IoError> {
        let invalid_pio = invalid_handler(IoSpace::Port)?;
        let invalid_mmio = invalid_handler(IoSpace::Memory)?;
        let cache = |space, fallback: &IoHandler| {
            Arc::new(IoDispatchCache::new(
                space,
                Vec::new(),
                fallback.clone(),
                Arc::clone(&platform),
                policy,
            ))
        };
        let pio = cache(IoSpace::Port, &invalid_pio);
        let mmio = cache(IoSpace::Memory, &invalid_mmio);

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            platform,
            policy,
            memory: Mutex::new(AddressSpace::new()),
            interrupts: Mutex::new(InterruptMap::default()),
            devices: RwLock::new(Vec::new()),
            pio: RwLock::new(pio),
            mmio: RwLock::new(mmio),
            invalid_pio,
            invalid_mmio,
            flushing: Mutex::new(()),
        }))
    }

    pub fn platform(&self) -> &Arc<dyn VmPlatform> {
        &self.platform
    }

    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn device(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices().into_iter().find(|d| d.name() == name)
    }

    /// Runs `f` with the address space locked.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> R {
        f(&mut lock(&self.memory))
    }

    pub fn memory_records(&self) -> Vec<RegionRecord> {
        lock(&self.memory).records()
    }

    pub fn interrupt_owner(&self, irq: u32) -> Option<String> {
        lock(&self.interrupts).owner(irq).map(str::to_string)
    }

    /// Instantiates, attaches and appends every device in order, then
    /// rebuilds the caches once.
    pub fn create_devices(&self, infos: &[DeviceInfo]) -> Result<(), DeviceError> {
        for info in infos {
            let device = create_device(info)?;
            self.attach(device)?;
        }
        self.flush();
        Ok(())
    }

    /// Attaches one device at runtime.
    pub fn add_device(&self, info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
        let device = create_device(info)?;
        self.attach(Arc::clone(&device))?;
        self.flush();
        Ok(device)
    }

    fn attach(&self, device: Arc<dyn Device>) -> Result<(), DeviceError> {
        let existing = self.devices();
        if existing.iter().any(|d| d.name() == device.name()) {
            return Err(DeviceError::Invalid {
                device: device.name().to_string(),
                reason: "duplicate device name".to_string(),
            });
        }

        {
            let mut memory = lock(&self.memory);
            let mut interrupts = lock(&self.interrupts);
            device.attach(&mut AttachContext {
                platform: &self.platform,
                memory: &mut memory,
                interrupts: &mut interrupts,
                devices: &existing,
                topology: TopologyHandle(self.me.clone()),
            })?;
        }
        info!("{}: attached ({})", device.name(), device.driver());

        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(device);
        Ok(())
    }

    /// Rebuilds both dispatch caches from the current handler sets and
    /// retires the old ones.
    pub fn flush(&self) {
        let _serial = lock(&self.flushing);
        let devices = self.devices();

        let pio: Vec<IoHandler> = devices
            .iter()
            .filter_map(|d| d.as_pio())
            .flat_map(|d| d.pio_handlers())
            .collect();
        let mmio: Vec<IoHandler> = devices
            .iter()
            .filter_map(|d| d.as_mmio())
            .flat_map(|d| d.mmio_handlers())
            .collect();
        info!(
            "rebuilding dispatch caches: {} port, {} memory handlers",
            pio.len(),
            mmio.len()
        );

        let pio = Arc::new(IoDispatchCache::new(
            IoSpace::Port,
            pio,
            self.invalid_pio.clone(),
            Arc::clone(&self.platform),
            self.policy,
        ));
        let mmio = Arc::new(IoDispatchCache::new(
            IoSpace::Memory,
            mmio,
            self.invalid_mmio.clone(),
            Arc::clone(&self.platform),
            self.policy,
        ));

        let old_pio = std::mem::replace(
            &mut *self.pio.write().unwrap_or_else(PoisonError::into_inner),
            pio,
        );
        let old_mmio = std::mem::replace(
            &mut *self.mmio.write().unwrap_or_else(PoisonError::into_inner),
            mmio,
        );
        old_pio.retire();
        old_mmio.retire();
    }

    pub fn pio_cache(&self) -> Arc<IoDispatchCache> {
        Arc::clone(&self.pio.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn mmio_cache(&self) -> Arc<IoDispatchCache> {
        Arc::clone(&self.mmio.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn handle_pio(&self, port: u64, event: &mut IoEvent) -> Result<(), IoError> {
        self.pio_cache().dispatch(port, event)
    }

    pub fn handle_mmio(&self, addr: u64, event: &mut IoEvent) -> Result<(), IoError> {
        self.mmio_cache().dispatch(addr, event)
    }

    /// Pauses every device.  On failure the devices already paused are
    /// unpaused again.
    pub fn pause(&self, manual: bool) -> Result<(), DeviceError> {
        let devices = self.devices();
        for (i, device) in devices.iter().enumerate() {
            if let Err(e) = device.core().gate.pause(manual) {
                for done in devices[..i].iter().rev() {
                    if let Err(e) = done.core().gate.unpause(manual) {
                        warn!("{}: rollback unpause failed: {e}", done.name());
                    }
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Unpauses every device.  On failure the devices already unpaused are
    /// paused again.
    pub fn unpause(&self, manual: bool) -> Result<(), DeviceError> {
        let devices = self.devices();
        for (i, device) in devices.iter().enumerate() {
            if let Err(e) = device.core().gate.unpause(manual) {
                for done in devices[..i].iter().rev() {
                    if let Err(e) = done.core().gate.pause(manual) {
                        warn!("{}: rollback pause failed: {e}", done.name());
                    }
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// One record per device: saved state for stateful devices, the
    /// configuration for the rest.  Devices are paused meanwhile.
    pub fn device_info(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        self.pause(false)?;
        let result = self
            .devices()
            .iter()
            .map(|device| {
                let data = match device.as_stateful() {
                    Some(stateful) => stateful.save()?,
                    None => device.config(),
                };
                let mut info = DeviceInfo::new(device.name(), device.driver(), data);
                info.debug = device.core().is_debug();
                Ok(info)
            })
            .collect();
        self.unpause(false)?;
        result
    }

    /// Loads saved device state into devices that already exist.
    pub fn load_state(&self, infos: &[DeviceInfo]) -> Result<(), DeviceError> {
        self.pause(false)?;
        let result = infos.iter().try_for_each(|info| {
            let device = self
                .device(&info.name)
                .ok_or_else(|| DeviceError::Invalid {
                    device: info.name.clone(),
                    reason: "no such device".to_string(),
                })?;
            if let Some(stateful) = device.as_stateful() {
                stateful.load(&info.data)?;
            }
            Ok(())
        });
        self.unpause(false)?;
        result
    }
}
