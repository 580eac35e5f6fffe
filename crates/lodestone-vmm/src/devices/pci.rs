//! PCI host bridge using configuration mechanism #1, and a scratch
//! function used to exercise it.
//!
//! The bus owns the configuration space of every function on bus 0.
//! Functions sit at device numbers in attach order and expose memory BARs
//! inside the 32-bit PCI hole:
//!
//! ```text
//!   0xcf8  CONFIG_ADDRESS   latched, byte-granular
//!   0xcfc  CONFIG_DATA      window into the selected dword
//! ```
//!
//! Moving a BAR rebinds its handler to the new address and asks the model
//! to rebuild its dispatch caches.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AttachContext, Device, DeviceError, DeviceInfo, MmioCapable, PioCapable, Stateful};
use crate::io::{DeviceCore, IoError, IoHandler, IoOps, WriteOutcome};
use crate::memory::{MemoryRegion, MemoryType};
use crate::model::TopologyHandle;
use crate::verified::io::{register_extract, register_merge, value_from_le, value_to_le, INVALID_READ};
use crate::verified::pci::{
    bar_address, bar_index, bar_value, decode_config_address, BAR0_OFFSET, BAR_COUNT,
    CONFIG_ADDRESS_PORT, CONFIG_DATA_PORT, CONFIG_SPACE_SIZE, IOAPIC_BASE, PCI_HOLE_START,
};

/// Device numbers available on bus 0.
pub const MAX_DEVICES: usize = 32;

/// Interrupt line and pin registers.
const INTERRUPT_LINE: usize = 0x3c;
const INTERRUPT_PIN: usize = 0x3d;

/// Bytes the guest cannot change: IDs, revision, class and header type.
const fn is_read_only(reg: usize) -> bool {
    matches!(reg, 0x00..=0x03 | 0x08..=0x0b | 0x0e)
}

/// Identity and resources of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionId {
    pub vendor_id: u16,
    pub device_id: u16,
    /// Class code, subclass and programming interface, high byte first.
    pub class: u32,
    pub irq: Option<u32>,
}

struct PciBar {
    size: u32,
    handler: IoHandler,
}

struct PciFunction {
    owner: String,
    config: [u8; CONFIG_SPACE_SIZE],
    bars: [Option<PciBar>; BAR_COUNT],
}

impl PciFunction {
    fn read(&self, reg: usize, size: u8) -> u64 {
        match self.config.get(reg..reg + size as usize) {
            Some(bytes) => value_from_le(bytes),
            None => INVALID_READ,
        }
    }

    fn write_dword(&mut self, reg: usize, value: u32) {
        self.config[reg..reg + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn dword(&self, reg: usize) -> u32 {
        value_from_le(&self.config[reg..reg + 4]) as u32
    }

    /// Applies a guest write.  Returns `true` when a BAR moved.
    ///
    /// A write may straddle a BAR boundary; every byte landing in a BAR goes
    /// through that BAR's size mask and relocation.
    fn write(&mut self, reg: usize, size: u8, value: u64) -> bool {
        let len = size as usize;
        if reg + len > CONFIG_SPACE_SIZE {
            return false;
        }
        let mut bytes = [0u8; 8];
        value_to_le(value, &mut bytes[..len]);

        let mut moved = false;
        let mut i = 0;
        while i < len {
            let at = reg + i;
            match bar_index(at as u64) {
                Some(index) => {
                    let base = BAR0_OFFSET as usize + 4 * index;
                    let chunk = (base + 4 - at).min(len - i);
                    let part = value_from_le(&bytes[i..i + chunk]);
                    moved |= self.write_bar(index, at - base, chunk as u8, part);
                    i += chunk;
                }
                None => {
                    if !is_read_only(at) {
                        self.config[at] = bytes[i];
                    }
                    i += 1;
                }
            }
        }
        moved
    }

    /// Merges `size` bytes at `offset` into BAR `index`.  Unimplemented BARs
    /// ignore writes.
    fn write_bar(&mut self, index: usize, offset: usize, size: u8, value: u64) -> bool {
        let base = BAR0_OFFSET as usize + 4 * index;
        let Some(bar_size) = self.bars[index].as_ref().map(|bar| bar.size) else {
            return false;
        };
        let merged = register_merge(u64::from(self.dword(base)), offset as u64, size, value);
        let new = bar_value(merged as u32, bar_size);
        let addr = bar_address(new);
        self.write_dword(base, new);
        match &mut self.bars[index] {
            Some(bar) if bar.handler.region().start != addr => {
                bar.handler = bar.handler.relocated(addr);
                debug!("{}: BAR{index} moved to {addr:#x}", self.owner);
                true
            }
            _ => false,
        }
    }

    fn handlers(&self) -> impl Iterator<Item = &IoHandler> {
        self.bars.iter().flatten().map(|bar| &bar.handler)
    }

    /// Rebinds every BAR handler to the address in its register.
    fn sync_bars(&mut self) {
        for index in 0..BAR_COUNT {
            let reg = BAR0_OFFSET as usize + 4 * index;
            let addr = bar_address(self.dword(reg));
            if let Some(bar) = &mut self.bars[index] {
                if bar.handler.region().start != addr {
                    bar.handler = bar.handler.relocated(addr);
                }
            }
        }
    }
}

struct BusState {
    /// Last value written to CONFIG_ADDRESS.
    address: u32,
    functions: Vec<PciFunction>,
    /// Next free address for initial BAR placement.
    next_bar: u64,
    topology: Option<TopologyHandle>,
}

impl BusState {
    fn selected(&mut self) -> Option<(&mut PciFunction, usize)> {
        let addr = decode_config_address(self.address);
        if !addr.enabled || addr.bus != 0 || addr.function != 0 {
            return None;
        }
        let reg = addr.register as usize;
        self.functions
            .get_mut(addr.device as usize)
            .map(|f| (f, reg))
    }
}

type SharedBus = Arc<Mutex<BusState>>;

fn lock(bus: &SharedBus) -> MutexGuard<'_, BusState> {
    bus.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ConfigAddressOps(SharedBus);

impl IoOps for ConfigAddressOps {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, IoError> {
        Ok(register_extract(u64::from(lock(&self.0).address), offset, size))
    }

    fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<WriteOutcome, IoError> {
        let mut bus = lock(&self.0);
        bus.address = register_merge(u64::from(bus.address), offset, size, value) as u32;
        Ok(WriteOutcome::Done)
    }
}

struct ConfigDataOps(SharedBus);

impl IoOps for ConfigDataOps {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, IoError> {
        let mut bus = lock(&self.0);
        Ok(match bus.selected() {
            Some((function, reg)) => function.read(reg + offset as usize, size),
            None => INVALID_READ,
        })
    }

    fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<WriteOutcome, IoError> {
        let mut bus = lock(&self.0);
        let moved = match bus.selected() {
            Some((function, reg)) => function.write(reg + offset as usize, size, value),
            None => false,
        };
        let topology = bus.topology.clone();
        drop(bus);

        if moved {
            if let Some(topology) = topology {
                topology.flush();
            }
        }
        Ok(WriteOutcome::Done)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Bus device
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PciBusConfig {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PciBusSnapshot {
    #[serde(default)]
    address: u32,
    /// Configuration space per device number.
    #[serde(default)]
    functions: Vec<Vec<u8>>,
}

pub struct PciBus {
    core: Arc<DeviceCore>,
    hole: MemoryRegion,
    state: SharedBus,
    handlers: OnceLock<[IoHandler; 2]>,
}

impl PciBus {
    pub fn create(info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
        let _config: PciBusConfig = info.config()?;
        Ok(Arc::new(Self {
            core: DeviceCore::new(&info.name, &info.driver),
            hole: MemoryRegion::new(PCI_HOLE_START, IOAPIC_BASE - PCI_HOLE_START),
            state: Arc::new(Mutex::new(BusState {
                address: 0,
                functions: Vec::new(),
                next_bar: PCI_HOLE_START,
                topology: None,
            })),
            handlers: OnceLock::new(),
        }))
    }

    pub fn hole(&self) -> MemoryRegion {
        self.hole
    }

    /// Adds a function at the next free device number, placing each BAR
    /// naturally aligned in the PCI hole.
    ///
    /// `bars` pairs a power-of-two size of at least 16 bytes with the ops
    /// serving it.  Returns the device number.
    pub fn add_function(
        &self,
        owner: &Arc<DeviceCore>,
        id: FunctionId,
        bars: Vec<(u32, Box<dyn IoOps>)>,
    ) -> Result<u8, DeviceError> {
        if bars.len() > BAR_COUNT {
            return Err(DeviceError::Invalid {
                device: owner.name.clone(),
                reason: format!("{} BARs requested", bars.len()),
            });
        }
        let mut bus = lock(&self.state);
        if bus.functions.len() >= MAX_DEVICES {
            return Err(DeviceError::PciBusFull);
        }

        let mut function = PciFunction {
            owner: owner.name.clone(),
            config: [0; CONFIG_SPACE_SIZE],
            bars: Default::default(),
        };
        function.config[0..2].copy_from_slice(&id.vendor_id.to_le_bytes());
        function.config[2..4].copy_from_slice(&id.device_id.to_le_bytes());
        function.config[0x09..0x0c].copy_from_slice(&id.class.to_le_bytes()[..3]);
        if let Some(irq) = id.irq {
            function.config[INTERRUPT_LINE] = irq as u8;
            function.config[INTERRUPT_PIN] = 1;
        }

        let mut next = bus.next_bar;
        for (index, (size, ops)) in bars.into_iter().enumerate() {
            if !size.is_power_of_two() || size < 16 {
                return Err(DeviceError::Invalid {
                    device: owner.name.clone(),
                    reason: format!("BAR{index} size {size:#x} is not a power of two"),
                });
            }
            let addr = next.next_multiple_of(u64::from(size));
            let end = addr + u64::from(size);
            if end > self.hole.end() {
                return Err(DeviceError::Invalid {
                    device: owner.name.clone(),
                    reason: "PCI hole exhausted".to_string(),
                });
            }
            let region = MemoryRegion::new(addr, u64::from(size));
            let handler = IoHandler::spawn(Arc::clone(owner), region, ops)?;
            function.write_dword(
                BAR0_OFFSET as usize + 4 * index,
                bar_value(addr as u32, size),
            );
            function.bars[index] = Some(PciBar { size, handler });
            next = end;
        }
        bus.next_bar = next;

        let slot = bus.functions.len() as u8;
        bus.functions.push(function);
        info!(
            "{}: PCI 00:{slot:02x}.0 {:04x}:{:04x}",
            owner.name, id.vendor_id, id.device_id
        );
        Ok(slot)
    }

    /// Current base address of a BAR.
    pub fn bar_address(&self, slot: u8, index: usize) -> Option<u64> {
        let bus = lock(&self.state);
        let function = bus.functions.get(slot as usize)?;
        function.bars.get(index)?.as_ref()?;
        Some(bar_address(function.dword(BAR0_OFFSET as usize + 4 * index)))
    }
}

impl Device for PciBus {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    fn config(&self) -> Value {
        serde_json::to_value(PciBusConfig::default()).unwrap_or(Value::Null)
    }

    fn attach(&self, ctx: &mut AttachContext<'_>) -> Result<(), DeviceError> {
        let name = self.name();
        ctx.memory.reserve(
            ctx.platform.as_ref(),
            name,
            MemoryType::Reserved,
            self.hole.start,
            self.hole.size,
            None,
        )?;

        let address = IoHandler::spawn(
            Arc::clone(&self.core),
            MemoryRegion::new(CONFIG_ADDRESS_PORT, 4),
            Box::new(ConfigAddressOps(Arc::clone(&self.state))),
        )?;
        let data = IoHandler::spawn(
            Arc::clone(&self.core),
            MemoryRegion::new(CONFIG_DATA_PORT, 4),
            Box::new(ConfigDataOps(Arc::clone(&self.state))),
        )?;
        self.handlers
            .set([address, data])
            .map_err(|_| DeviceError::Invalid {
                device: name.to_string(),
                reason: "attached twice".to_string(),
            })?;
        lock(&self.state).topology = Some(ctx.topology.clone());
        Ok(())
    }

    fn as_pio(&self) -> Option<&dyn PioCapable> {
        Some(self)
    }

    fn as_mmio(&self) -> Option<&dyn MmioCapable> {
        Some(self)
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }

    fn as_pci_bus(&self) -> Option<&PciBus> {
        Some(self)
    }
}

impl PioCapable for PciBus {
    fn pio_handlers(&self) -> Vec<IoHandler> {
        self.handlers
            .get()
            .map(|h| h.to_vec())
            .unwrap_or_default()
    }
}

impl MmioCapable for PciBus {
    fn mmio_handlers(&self) -> Vec<IoHandler> {
        let bus = lock(&self.state);
        bus.functions
            .iter()
            .flat_map(|f| f.handlers().cloned())
            .collect()
    }
}

impl Stateful for PciBus {
    fn save(&self) -> Result<Value, DeviceError> {
        let bus = lock(&self.state);
        let snapshot = PciBusSnapshot {
            address: bus.address,
            functions: bus.functions.iter().map(|f| f.config.to_vec()).collect(),
        };
        serde_json::to_value(snapshot).map_err(|e| DeviceError::Io(IoError::Restore(e)))
    }

    fn load(&self, state: &Value) -> Result<(), DeviceError> {
        let snapshot: PciBusSnapshot =
            serde_json::from_value(state.clone()).map_err(|source| DeviceError::Config {
                device: self.name().to_string(),
                source,
            })?;
        let mut bus = lock(&self.state);
        if snapshot.functions.len() != bus.functions.len() {
            return Err(DeviceError::Invalid {
                device: self.name().to_string(),
                reason: format!(
                    "saved {} functions, bus has {}",
                    snapshot.functions.len(),
                    bus.functions.len()
                ),
            });
        }
        bus.address = snapshot.address;
        for (function, config) in bus.functions.iter_mut().zip(snapshot.functions) {
            if config.len() != CONFIG_SPACE_SIZE {
                return Err(DeviceError::Invalid {
                    device: self.name().to_string(),
                    reason: format!("config space of {} bytes", config.len()),
                });
            }
            function.config.copy_from_slice(&config);
            function.sync_bars();
        }
        let topology = bus.topology.clone();
        drop(bus);

        if let Some(topology) = topology {
            topology.flush();
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Scratch function
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PciScratchConfig {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u32,
    pub bar_size: u32,
}

impl Default for PciScratchConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x1b36,
            device_id: 0x0005,
            class: 0xff_0000,
            bar_size: 0x1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PciScratchSnapshot {
    #[serde(flatten)]
    config: PciScratchConfig,
    #[serde(default)]
    contents: Option<Vec<u8>>,
}

/// Byte-addressable RAM behind BAR0.
struct ScratchOps {
    bytes: Vec<u8>,
}

impl IoOps for ScratchOps {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, IoError> {
        let start = offset as usize;
        Ok(match self.bytes.get(start..start + size as usize) {
            Some(bytes) => value_from_le(bytes),
            None => INVALID_READ,
        })
    }

    fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<WriteOutcome, IoError> {
        let start = offset as usize;
        if let Some(bytes) = self.bytes.get_mut(start..start + size as usize) {
            value_to_le(value, bytes);
        }
        Ok(WriteOutcome::Done)
    }

    fn save(&self) -> Option<Value> {
        serde_json::to_value(&self.bytes).ok()
    }

    fn restore(&mut self, state: &Value) -> Result<(), IoError> {
        let bytes: Vec<u8> = serde_json::from_value(state.clone()).map_err(IoError::Restore)?;
        if bytes.len() == self.bytes.len() {
            self.bytes = bytes;
        }
        Ok(())
    }
}

/// A PCI function with one memory BAR of plain storage.
pub struct PciScratch {
    core: Arc<DeviceCore>,
    config: PciScratchConfig,
    bar: OnceLock<IoHandler>,
}

impl PciScratch {
    pub fn create(info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::new(Self {
            core: DeviceCore::new(&info.name, &info.driver),
            config: info.config()?,
            bar: OnceLock::new(),
        }))
    }

    fn bar(&self) -> Result<&IoHandler, DeviceError> {
        self.bar.get().ok_or_else(|| DeviceError::Invalid {
            device: self.name().to_string(),
            reason: "not attached".to_string(),
        })
    }
}

impl Device for PciScratch {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }

    fn attach(&self, ctx: &mut AttachContext<'_>) -> Result<(), DeviceError> {
        let bus = ctx
            .devices
            .iter()
            .find_map(|d| d.as_pci_bus())
            .ok_or(DeviceError::PciBusNotFound)?;
        let irq = ctx.interrupts.allocate(self.name(), None)?;

        let ops = ScratchOps {
            bytes: vec![0; self.config.bar_size as usize],
        };
        let id = FunctionId {
            vendor_id: self.config.vendor_id,
            device_id: self.config.device_id,
            class: self.config.class,
            irq: Some(irq),
        };
        let slot = bus.add_function(&self.core, id, vec![(self.config.bar_size, Box::new(ops))])?;

        let handler = bus
            .mmio_handlers()
            .into_iter()
            .find(|h| Arc::ptr_eq(h.device(), &self.core))
            .ok_or(DeviceError::PciBusNotFound)?;
        debug!("{}: slot {slot}, BAR0 at {}", self.name(), handler.region());
        self.bar.set(handler).map_err(|_| DeviceError::Invalid {
            device: self.name().to_string(),
            reason: "attached twice".to_string(),
        })?;
        Ok(())
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }
}

impl Stateful for PciScratch {
    fn save(&self) -> Result<Value, DeviceError> {
        let contents = self
            .bar()?
            .save_state()?
            .map(serde_json::from_value)
            .transpose()
            .map_err(IoError::Restore)?;
        let snapshot = PciScratchSnapshot {
            config: self.config.clone(),
            contents,
        };
        serde_json::to_value(snapshot).map_err(|e| DeviceError::Io(IoError::Restore(e)))
    }

    fn load(&self, state: &Value) -> Result<(), DeviceError> {
        let snapshot: PciScratchSnapshot =
            serde_json::from_value(state.clone()).map_err(|source| DeviceError::Config {
                device: self.name().to_string(),
                source,
            })?;
        if let Some(contents) = snapshot.contents {
            let value = serde_json::to_value(contents).map_err(IoError::Restore)?;
            self.bar()?.restore_state(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoEvent;
    use crate::memory::AddressSpace;
    use crate::model::InterruptMap;
    use crate::platform::VmPlatform;
    use crate::testing::FakePlatform;
    use crate::verified::pci::encode_config_address;

    struct Fixture {
        bus: Arc<dyn Device>,
        scratch: Arc<dyn Device>,
        memory: AddressSpace,
        interrupts: InterruptMap,
    }

    fn fixture() -> Fixture {
        let platform: Arc<dyn VmPlatform> = Arc::new(FakePlatform::default());
        let mut memory = AddressSpace::new();
        let mut interrupts = InterruptMap::default();
        let bus = PciBus::create(&DeviceInfo::new("pci", "pci-bus", Value::Null)).unwrap();
        let scratch =
            PciScratch::create(&DeviceInfo::new("scratch", "pci-scratch", Value::Null)).unwrap();
        let mut attached: Vec<Arc<dyn Device>> = Vec::new();
        for device in [&bus, &scratch] {
            device
                .attach(&mut AttachContext {
                    platform: &platform,
                    memory: &mut memory,
                    interrupts: &mut interrupts,
                    devices: &attached,
                    topology: TopologyHandle::detached(),
                })
                .unwrap();
            attached.push(Arc::clone(device));
        }
        Fixture {
            bus,
            scratch,
            memory,
            interrupts,
        }
    }

    fn config_read(bus: &PciBus, device: u8, reg: u8) -> u32 {
        let [address, data] = bus.handlers.get().unwrap().clone();
        let addr = encode_config_address(0, device, 0, reg);
        address.submit(&mut IoEvent::write(4, addr.into()), 0).unwrap();
        let mut r = IoEvent::read(4);
        data.submit(&mut r, 0).unwrap();
        r.data as u32
    }

    fn config_write(bus: &PciBus, device: u8, reg: u8, value: u32) {
        let [address, data] = bus.handlers.get().unwrap().clone();
        let addr = encode_config_address(0, device, 0, reg);
        address.submit(&mut IoEvent::write(4, addr.into()), 0).unwrap();
        data.submit(&mut IoEvent::write(4, value.into()), 0).unwrap();
    }

    #[test]
    fn attach_reserves_hole_and_exposes_ports() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        let hole = f
            .memory
            .regions()
            .iter()
            .find(|r| r.owner == "pci")
            .unwrap();
        assert_eq!(hole.region, MemoryRegion::new(0xf000_0000, 0x0ec0_0000));
        let ports: Vec<u64> = bus.pio_handlers().iter().map(|h| h.region().start).collect();
        assert_eq!(ports, vec![0xcf8, 0xcfc]);
    }

    #[test]
    fn vendor_and_device_ids_are_visible() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        assert_eq!(config_read(bus, 0, 0), 0x0005_1b36);
        // Empty slot.
        assert_eq!(config_read(bus, 1, 0), 0xffff_ffff);
        // Read-only registers ignore writes.
        config_write(bus, 0, 0, 0);
        assert_eq!(config_read(bus, 0, 0), 0x0005_1b36);
    }

    #[test]
    fn scratch_gets_irq_from_sixteen() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        assert_eq!(f.interrupts.owner(16), Some("scratch"));
        assert_eq!(config_read(bus, 0, 0x3c) & 0xffff, 0x0110);
    }

    #[test]
    fn disabled_address_selects_nothing() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        let [address, data] = bus.handlers.get().unwrap().clone();
        address.submit(&mut IoEvent::write(4, 0), 0).unwrap();
        let mut r = IoEvent::read(4);
        data.submit(&mut r, 0).unwrap();
        assert_eq!(r.data, 0xffff_ffff);
        let mut r = IoEvent::read(2);
        address.submit(&mut r, 0).unwrap();
        assert_eq!(r.data, 0);
    }

    #[test]
    fn bar_sizing_and_relocation() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        assert_eq!(bus.bar_address(0, 0), Some(PCI_HOLE_START));
        assert_eq!(config_read(bus, 0, 0x10), 0xf000_0008);

        config_write(bus, 0, 0x10, 0xffff_ffff);
        assert_eq!(config_read(bus, 0, 0x10), 0xffff_f008);

        config_write(bus, 0, 0x10, 0xf010_0000);
        assert_eq!(bus.bar_address(0, 0), Some(0xf010_0000));
        let handlers = bus.mmio_handlers();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].region(), MemoryRegion::new(0xf010_0000, 0x1000));

        // Unimplemented BARs stay zero.
        config_write(bus, 0, 0x14, 0xffff_ffff);
        assert_eq!(config_read(bus, 0, 0x14), 0);
        assert_eq!(bus.bar_address(0, 1), None);
    }

    #[test]
    fn write_straddling_into_bar_is_masked_and_relocates() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        let [address, data] = bus.handlers.get().unwrap().clone();
        let addr = encode_config_address(0, 0, 0, 0x0c);
        address.submit(&mut IoEvent::write(4, addr.into()), 0).unwrap();
        // Bytes 0x0e..0x12: header type, BIST, then the low half of BAR0.
        data.submit(&mut IoEvent::write(4, 0x1234_0000), 2).unwrap();

        assert_eq!(config_read(bus, 0, 0x10), 0xf000_1008);
        assert_eq!(bus.bar_address(0, 0), Some(0xf000_1000));
        assert_eq!(bus.mmio_handlers()[0].region().start, 0xf000_1000);
    }

    #[test]
    fn relocated_bar_keeps_contents() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        bus.mmio_handlers()[0]
            .submit(&mut IoEvent::write(4, 0xdead_beef), 0x10)
            .unwrap();
        config_write(bus, 0, 0x10, 0xf020_0000);
        let mut r = IoEvent::read(4);
        bus.mmio_handlers()[0].submit(&mut r, 0x10).unwrap();
        assert_eq!(r.data, 0xdead_beef);
    }

    #[test]
    fn scratch_without_bus_fails() {
        let platform: Arc<dyn VmPlatform> = Arc::new(FakePlatform::default());
        let mut memory = AddressSpace::new();
        let mut interrupts = InterruptMap::default();
        let scratch =
            PciScratch::create(&DeviceInfo::new("scratch", "pci-scratch", Value::Null)).unwrap();
        let err = scratch
            .attach(&mut AttachContext {
                platform: &platform,
                memory: &mut memory,
                interrupts: &mut interrupts,
                devices: &[],
                topology: TopologyHandle::detached(),
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::PciBusNotFound));
    }

    #[test]
    fn bus_state_round_trips_bar_addresses() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        config_write(bus, 0, 0x10, 0xf030_0000);
        let saved = bus.save().unwrap();
        config_write(bus, 0, 0x10, 0xf040_0000);
        bus.load(&saved).unwrap();
        assert_eq!(bus.bar_address(0, 0), Some(0xf030_0000));
        assert_eq!(bus.mmio_handlers()[0].region().start, 0xf030_0000);
    }

    #[test]
    fn scratch_state_round_trips() {
        let f = fixture();
        let bus = f.bus.as_pci_bus().unwrap();
        let bar = bus.mmio_handlers().remove(0);
        bar.submit(&mut IoEvent::write(1, 0x42), 3).unwrap();
        let scratch = f.scratch.as_stateful().unwrap();
        let saved = scratch.save().unwrap();
        assert_eq!(saved["bar_size"], 0x1000);
        bar.submit(&mut IoEvent::write(1, 0), 3).unwrap();
        scratch.load(&saved).unwrap();
        let mut r = IoEvent::read(1);
        bar.submit(&mut r, 3).unwrap();
        assert_eq!(r.data, 0x42);
    }
}
