//! Test doubles: a platform, VCPUs and doorbells that need no `/dev/kvm`,
//! plus small device ops for exercising dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use vmm_sys_util::eventfd::EventFd;

use crate::io::{IoError, IoOps, IoSpace, WriteOutcome};
use crate::memory::Backing;
use crate::platform::{
    Doorbell, GuestExit, IoData, Kick, PlatformError, Registers, VcpuBackend, VmPlatform,
    DOORBELL_WAKE,
};
use crate::verified::io::{register_extract, register_merge, value_to_le};

/// Polls `cond` for up to five seconds.
pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Device ops
// ═══════════════════════════════════════════════════════════════════════

/// An 8-byte little-endian register; sub-width accesses touch only their
/// bytes.
#[derive(Debug, Default)]
pub struct LatchOps {
    value: u64,
}

impl IoOps for LatchOps {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, IoError> {
        Ok(register_extract(self.value, offset, size))
    }

    fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<WriteOutcome, IoError> {
        self.value = register_merge(self.value, offset, size, value);
        Ok(WriteOutcome::Done)
    }

    fn save(&self) -> Option<Value> {
        Some(Value::from(self.value))
    }

    fn restore(&mut self, state: &Value) -> Result<(), IoError> {
        self.value = serde_json::from_value(state.clone()).map_err(IoError::Restore)?;
        Ok(())
    }
}

/// Records every write as `(offset, value)` and answers with
/// `KeepDoorbell` while `keep` is set.
#[derive(Clone, Default)]
pub struct RecordingOps {
    log: Arc<Mutex<Vec<(u64, u64)>>>,
    keep: Arc<AtomicBool>,
}

impl RecordingOps {
    pub fn log(&self) -> Arc<Mutex<Vec<(u64, u64)>>> {
        Arc::clone(&self.log)
    }

    pub fn set_keep(&self, keep: bool) {
        self.keep.store(keep, Ordering::SeqCst);
    }
}

impl IoOps for RecordingOps {
    fn read(&mut self, _offset: u64, _size: u8) -> Result<u64, IoError> {
        Ok(0)
    }

    fn write(&mut self, offset: u64, _size: u8, value: u64) -> Result<WriteOutcome, IoError> {
        self.log.lock().unwrap().push((offset, value));
        if self.keep.load(Ordering::SeqCst) {
            Ok(WriteOutcome::KeepDoorbell)
        } else {
            Ok(WriteOutcome::Done)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Doorbells
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct BellState {
    counter: u64,
    held: bool,
    closed: bool,
}

/// A doorbell the test rings by hand.
#[derive(Default)]
pub struct FakeDoorbell {
    state: Mutex<BellState>,
    cond: Condvar,
}

impl FakeDoorbell {
    /// Simulates `n` guest writes.
    pub fn ring(&self, n: u64) {
        self.state.lock().unwrap().counter += n;
        self.cond.notify_all();
    }

    /// Keeps the waiter blocked even when the counter is non-zero.
    pub fn hold(&self) {
        self.state.lock().unwrap().held = true;
    }

    pub fn release(&self) {
        self.state.lock().unwrap().held = false;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

struct SharedDoorbell(Arc<FakeDoorbell>);

impl Doorbell for SharedDoorbell {
    fn wait(&self) -> Result<u64, PlatformError> {
        let mut state = self.0.state.lock().unwrap();
        while state.counter == 0 || state.held {
            state = self.0.cond.wait(state).unwrap();
        }
        Ok(std::mem::take(&mut state.counter))
    }

    fn wake(&self) -> Result<(), PlatformError> {
        self.0.state.lock().unwrap().counter += DOORBELL_WAKE;
        self.0.cond.notify_all();
        Ok(())
    }

    fn close(&self) -> Result<(), PlatformError> {
        self.0.state.lock().unwrap().closed = true;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VCPUs
// ═══════════════════════════════════════════════════════════════════════

/// One scripted guest action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeStep {
    PortOut { port: u16, size: u8, value: u64 },
    PortIn { port: u16, size: u8 },
    MmioOut { addr: u64, size: u8, value: u64 },
    MmioIn { addr: u64, size: u8 },
    Debug,
    Halt,
    Shutdown,
    NoReason,
}

/// Kicker that wakes a spinning [`FakeVcpu`].
#[derive(Default)]
pub struct FakeKicker {
    kicked: Mutex<bool>,
    cond: Condvar,
}

impl Kick for FakeKicker {
    fn bind_current_thread(&self) {}

    fn kick(&self) {
        *self.kicked.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

/// Guest-visible state of a fake VCPU, shared with the test.
#[derive(Default)]
pub struct FakeGuest {
    pub registers: Mutex<Registers>,
    /// Values the guest observed from `PortIn`/`MmioIn` steps.
    pub reads: Mutex<Vec<u64>>,
    pub single_step: AtomicBool,
    pub entry: Mutex<Option<u64>>,
}

/// Runs a script of exits, then spins in the guest until kicked.
///
/// Every completed step advances `rip` by one, standing in for guest
/// progress.
pub struct FakeVcpu {
    id: u32,
    script: VecDeque<FakeStep>,
    pending_read: bool,
    buf: [u8; 8],
    guest: Arc<FakeGuest>,
    kicker: Arc<FakeKicker>,
}

impl VcpuBackend for FakeVcpu {
    fn id(&self) -> u32 {
        self.id
    }

    fn run(&mut self) -> Result<GuestExit<'_>, PlatformError> {
        if std::mem::take(&mut self.pending_read) {
            self.guest
                .reads
                .lock()
                .unwrap()
                .push(u64::from_le_bytes(self.buf));
        }
        let Some(step) = self.script.pop_front() else {
            let mut kicked = self.kicker.kicked.lock().unwrap();
            while !*kicked {
                let (guard, _) = self
                    .kicker
                    .cond
                    .wait_timeout(kicked, Duration::from_millis(10))
                    .unwrap();
                kicked = guard;
                self.guest.registers.lock().unwrap().rip += 1;
            }
            *kicked = false;
            return Ok(GuestExit::Interrupted);
        };

        self.guest.registers.lock().unwrap().rip += 1;
        self.buf = [0; 8];
        Ok(match step {
            FakeStep::PortOut { port, size, value } => {
                value_to_le(value, &mut self.buf);
                GuestExit::PortIo {
                    port,
                    data: IoData::Out(&self.buf[..size as usize]),
                }
            }
            FakeStep::PortIn { port, size } => {
                self.pending_read = true;
                GuestExit::PortIo {
                    port,
                    data: IoData::In(&mut self.buf[..size as usize]),
                }
            }
            FakeStep::MmioOut { addr, size, value } => {
                value_to_le(value, &mut self.buf);
                GuestExit::Mmio {
                    addr,
                    data: IoData::Out(&self.buf[..size as usize]),
                }
            }
            FakeStep::MmioIn { addr, size } => {
                self.pending_read = true;
                GuestExit::Mmio {
                    addr,
                    data: IoData::In(&mut self.buf[..size as usize]),
                }
            }
            FakeStep::Debug => GuestExit::Debug {
                pc: self.guest.registers.lock().unwrap().rip,
            },
            FakeStep::Halt => GuestExit::Halt,
            FakeStep::Shutdown => GuestExit::Shutdown,
            FakeStep::NoReason => GuestExit::NoReason,
        })
    }

    fn get_registers(&mut self) -> Result<Registers, PlatformError> {
        Ok(*self.guest.registers.lock().unwrap())
    }

    fn set_registers(&mut self, regs: &Registers) -> Result<(), PlatformError> {
        *self.guest.registers.lock().unwrap() = *regs;
        Ok(())
    }

    fn set_single_step(&mut self, enabled: bool) -> Result<(), PlatformError> {
        self.guest.single_step.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn set_boot_entry(&mut self, entry: u64) -> Result<(), PlatformError> {
        *self.guest.entry.lock().unwrap() = Some(entry);
        let mut regs = self.guest.registers.lock().unwrap();
        regs.rip = entry;
        regs.rflags = 0x2;
        Ok(())
    }

    fn kicker(&self) -> Arc<dyn Kick> {
        self.kicker.clone()
    }
}

impl FakeVcpu {
    pub fn new(id: u32, script: Vec<FakeStep>) -> (Self, Arc<FakeGuest>) {
        let guest = Arc::new(FakeGuest::default());
        let vcpu = Self {
            id,
            script: script.into(),
            pending_read: false,
            buf: [0; 8],
            guest: Arc::clone(&guest),
            kicker: Arc::new(FakeKicker::default()),
        };
        (vcpu, guest)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Platform
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct PlatformState {
    user: Vec<(u64, u64)>,
    special: Vec<u64>,
    irqfds: Vec<u32>,
    irq_lines: Vec<(u32, bool)>,
    fail_mappings: bool,
    doorbells_disabled: bool,
    doorbells: HashMap<u64, Arc<FakeDoorbell>>,
    scripts: HashMap<u32, Vec<FakeStep>>,
    guests: HashMap<u32, Arc<FakeGuest>>,
}

/// Records every call; VCPUs run scripts registered with
/// [`FakePlatform::script`].
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub fn user_mappings(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().user.clone()
    }

    pub fn special_mappings(&self) -> Vec<u64> {
        self.state.lock().unwrap().special.clone()
    }

    pub fn irqfds(&self) -> Vec<u32> {
        self.state.lock().unwrap().irqfds.clone()
    }

    pub fn fail_mappings(&self, fail: bool) {
        self.state.lock().unwrap().fail_mappings = fail;
    }

    pub fn disable_doorbells(&self) {
        self.state.lock().unwrap().doorbells_disabled = true;
    }

    pub fn doorbell(&self, addr: u64) -> Option<Arc<FakeDoorbell>> {
        self.state.lock().unwrap().doorbells.get(&addr).cloned()
    }

    /// Script for the VCPU `id` creates next.
    pub fn script(&self, id: u32, steps: Vec<FakeStep>) {
        self.state.lock().unwrap().scripts.insert(id, steps);
    }

    pub fn guest(&self, id: u32) -> Option<Arc<FakeGuest>> {
        self.state.lock().unwrap().guests.get(&id).cloned()
    }

    fn mapping_failure() -> PlatformError {
        PlatformError::Eventfd(std::io::Error::other("mapping refused"))
    }
}

impl VmPlatform for FakePlatform {
    fn map_user_memory(&self, start: u64, backing: &Backing) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mappings {
            return Err(Self::mapping_failure());
        }
        state.user.push((start, backing.len() as u64));
        Ok(())
    }

    fn map_special_memory(&self, start: u64) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mappings {
            return Err(Self::mapping_failure());
        }
        state.special.push(start);
        Ok(())
    }

    fn create_vcpu(&self, id: u32) -> Result<Box<dyn VcpuBackend>, PlatformError> {
        let mut state = self.state.lock().unwrap();
        let script = state.scripts.remove(&id).unwrap_or_default();
        let (vcpu, guest) = FakeVcpu::new(id, script);
        state.guests.insert(id, guest);
        Ok(Box::new(vcpu))
    }

    fn bind_doorbell(
        &self,
        _space: IoSpace,
        addr: u64,
        _size: u8,
        _value: u64,
    ) -> Result<Option<Box<dyn Doorbell>>, PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.doorbells_disabled {
            return Ok(None);
        }
        let bell = Arc::new(FakeDoorbell::default());
        state.doorbells.insert(addr, Arc::clone(&bell));
        Ok(Some(Box::new(SharedDoorbell(bell))))
    }

    fn set_irq_line(&self, irq: u32, active: bool) -> Result<(), PlatformError> {
        self.state.lock().unwrap().irq_lines.push((irq, active));
        Ok(())
    }

    fn signal_msi(&self, _addr: u64, _data: u32) -> Result<(), PlatformError> {
        Ok(())
    }

    fn register_irqfd(&self, _fd: &EventFd, irq: u32) -> Result<(), PlatformError> {
        self.state.lock().unwrap().irqfds.push(irq);
        Ok(())
    }
}
