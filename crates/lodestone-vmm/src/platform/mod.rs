//! Hardware-virtualization backend seam.
//!
//! Everything above this module talks to the hypervisor through three
//! traits:
//!
//! - [`VmPlatform`]: VM-wide operations (memory mapping, VCPU creation,
//!   interrupt injection, doorbell binding).
//! - [`VcpuBackend`]: one virtual CPU, owned by exactly one executor thread.
//! - [`Doorbell`]: a kernel-delivered notification bound to one guest I/O
//!   address.
//!
//! [`kvm::KvmPlatform`] is the production implementation.

pub mod kvm;

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

use crate::io::IoSpace;
use crate::memory::Backing;

/// Bytes of special memory a platform needs: one identity-map page followed
/// by a three-page TSS.
pub const SPECIAL_MEMORY_SIZE: u64 = 4 * crate::verified::region::PAGE_SIZE;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Failed to open /dev/kvm: {0}")]
    KvmOpen(#[source] kvm_ioctls::Error),

    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to create in-kernel IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("Failed to create PIT: {0}")]
    CreatePit(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU {id}: {source}")]
    VcpuCreate {
        id: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to configure CPUID: {0}")]
    Cpuid(#[source] kvm_ioctls::Error),

    #[error("Failed to map guest memory at {start:#x}: {source}")]
    MapMemory {
        start: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("No memory slots left for region at {0:#x}")]
    SlotsExhausted(u64),

    #[error("Failed to set identity map address: {0}")]
    IdentityMap(#[source] kvm_ioctls::Error),

    #[error("Failed to set TSS address: {0}")]
    TssAddress(#[source] kvm_ioctls::Error),

    #[error("Failed to register irqfd for IRQ {irq}: {source}")]
    Irqfd {
        irq: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to set IRQ line {irq}: {source}")]
    IrqLine {
        irq: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to signal MSI: {0}")]
    Msi(#[source] kvm_ioctls::Error),

    #[error("Failed to bind ioeventfd at {addr:#x}: {source}")]
    IoEvent {
        addr: u64,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Eventfd operation failed: {0}")]
    Eventfd(#[source] io::Error),

    #[error("vCPU run failed: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("Failed to access vCPU registers: {0}")]
    Registers(#[source] kvm_ioctls::Error),

    #[error("Failed to configure guest debug: {0}")]
    GuestDebug(#[source] kvm_ioctls::Error),

    #[error("Failed to install vCPU kick signal handler: {0}")]
    SignalHandler(#[source] vmm_sys_util::errno::Error),
}

/// General-purpose register file of one VCPU.
///
/// Kept backend-neutral so that register snapshots can be serialised and
/// so that tests can run without `/dev/kvm`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Direction and payload of a guest I/O exit.
///
/// The buffer borrows the backend's shared run structure, so it is only
/// valid until the next guest entry.
#[derive(Debug)]
pub enum IoData<'a> {
    /// Guest read: the monitor fills the buffer.
    In(&'a mut [u8]),
    /// Guest write: the buffer holds the written bytes.
    Out(&'a [u8]),
}

impl IoData<'_> {
    pub fn len(&self) -> usize {
        match self {
            IoData::In(b) => b.len(),
            IoData::Out(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_write(&self) -> bool {
        matches!(self, IoData::Out(_))
    }
}

/// Reason a VCPU left guest execution.
#[derive(Debug)]
pub enum GuestExit<'a> {
    PortIo { port: u16, data: IoData<'a> },
    Mmio { addr: u64, data: IoData<'a> },
    /// Single-step or breakpoint trap.
    Debug { pc: u64 },
    Halt,
    Shutdown,
    /// Entry was cut short by a kick; nothing happened in the guest.
    Interrupted,
    /// The backend reported an exit without a usable reason.
    NoReason,
    /// Any other exit; carries a description for diagnostics.
    Unhandled(String),
}

/// VM-wide backend operations.
pub trait VmPlatform: Send + Sync {
    /// Maps a user-backed region into the guest at `start`.
    fn map_user_memory(&self, start: u64, backing: &Backing) -> Result<(), PlatformError>;

    /// Maps a reserved hole.  Nothing is backed, so the default does nothing.
    fn map_reserved_memory(&self, _start: u64, _size: u64) -> Result<(), PlatformError> {
        Ok(())
    }

    /// Installs the identity-map page and TSS at `start`.
    fn map_special_memory(&self, start: u64) -> Result<(), PlatformError>;

    /// Bytes consumed by [`VmPlatform::map_special_memory`].
    fn special_memory_size(&self) -> u64 {
        SPECIAL_MEMORY_SIZE
    }

    fn create_vcpu(&self, id: u32) -> Result<Box<dyn VcpuBackend>, PlatformError>;

    /// Binds a doorbell that fires when the guest writes `value` with
    /// width `size` to `addr`.
    ///
    /// Returns `Ok(None)` when the platform does not offer doorbells (or has
    /// them disabled); the caller then keeps using the regular exit path.
    fn bind_doorbell(
        &self,
        space: IoSpace,
        addr: u64,
        size: u8,
        value: u64,
    ) -> Result<Option<Box<dyn Doorbell>>, PlatformError>;

    fn set_irq_line(&self, irq: u32, active: bool) -> Result<(), PlatformError>;

    fn signal_msi(&self, addr: u64, data: u32) -> Result<(), PlatformError>;

    /// Routes writes to `fd` to interrupt line `irq`.
    fn register_irqfd(&self, fd: &EventFd, irq: u32) -> Result<(), PlatformError>;
}

/// One virtual CPU.  Only its executor thread calls these methods.
pub trait VcpuBackend: Send {
    fn id(&self) -> u32;

    /// Enters the guest and returns the exit reason.
    fn run(&mut self) -> Result<GuestExit<'_>, PlatformError>;

    /// Reads the register file, first completing any I/O the guest is
    /// still waiting on so the returned state is consistent.
    fn get_registers(&mut self) -> Result<Registers, PlatformError>;

    fn set_registers(&mut self, regs: &Registers) -> Result<(), PlatformError>;

    fn set_single_step(&mut self, enabled: bool) -> Result<(), PlatformError>;

    /// Points the VCPU at a flat real-mode entry point.
    fn set_boot_entry(&mut self, entry: u64) -> Result<(), PlatformError>;

    /// Handle that forces this VCPU out of guest execution.
    fn kicker(&self) -> Arc<dyn Kick>;
}

/// Forces a VCPU thread out of guest execution.
pub trait Kick: Send + Sync {
    /// Records the calling thread as the one to interrupt.
    fn bind_current_thread(&self);

    /// Interrupts the bound thread if it is inside the guest.
    fn kick(&self);
}

/// Counter increment used by [`Doorbell::wake`].  Guest rings add one, so
/// a counter value at or above this carries a wake-up.
pub const DOORBELL_WAKE: u64 = 1 << 32;

/// Kernel-delivered notification for one guest I/O address.
pub trait Doorbell: Send + Sync {
    /// Blocks until rung and returns the accumulated counter: the number of
    /// guest rings plus [`DOORBELL_WAKE`] per wake-up.
    fn wait(&self) -> Result<u64, PlatformError>;

    /// Adds [`DOORBELL_WAKE`] to the counter, releasing a blocked waiter.
    fn wake(&self) -> Result<(), PlatformError>;

    /// Unbinds the doorbell from the guest address.  After this returns the
    /// guest's writes exit to the monitor again.
    fn close(&self) -> Result<(), PlatformError>;
}
