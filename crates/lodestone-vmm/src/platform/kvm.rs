//! KVM implementation of the platform traits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use kvm_bindings::{
    kvm_guest_debug, kvm_msi, kvm_pit_config, kvm_regs, kvm_userspace_memory_region, CpuId,
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_MAX_CPUID_ENTRIES, KVM_PIT_SPEAKER_DUMMY,
};
use kvm_ioctls::{IoEventAddress, Kvm, VcpuExit, VcpuFd, VmFd};
use log::{debug, info, warn};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

use super::{
    Doorbell, GuestExit, IoData, Kick, PlatformError, Registers, VcpuBackend, VmPlatform,
    DOORBELL_WAKE,
};
use crate::io::IoSpace;
use crate::memory::Backing;
use crate::verified::region::PAGE_SIZE;

/// KVM supports at most this many user memory slots on x86.
const MAX_MEMORY_SLOTS: u32 = 509;

// ═══════════════════════════════════════════════════════════════════════
//  VM
// ═══════════════════════════════════════════════════════════════════════

pub struct KvmPlatform {
    _kvm: Kvm,
    vm: Arc<VmFd>,
    cpuid: CpuId,
    next_slot: AtomicU32,
    use_eventfds: bool,
}

impl KvmPlatform {
    /// Opens `/dev/kvm`, creates the VM with an in-kernel IRQ chip and PIT,
    /// and installs the VCPU kick signal handler.
    pub fn new(use_eventfds: bool) -> Result<Self, PlatformError> {
        install_kick_handler()?;

        let kvm = Kvm::new().map_err(PlatformError::KvmOpen)?;
        let vm = kvm.create_vm().map_err(PlatformError::VmCreate)?;

        vm.create_irq_chip().map_err(PlatformError::CreateIrqChip)?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm.create_pit2(pit_config).map_err(PlatformError::CreatePit)?;

        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(PlatformError::Cpuid)?;

        info!("KVM VM created (eventfds {})", if use_eventfds { "on" } else { "off" });

        Ok(Self {
            _kvm: kvm,
            vm: Arc::new(vm),
            cpuid,
            next_slot: AtomicU32::new(0),
            use_eventfds,
        })
    }
}

impl VmPlatform for KvmPlatform {
    fn map_user_memory(&self, start: u64, backing: &Backing) -> Result<(), PlatformError> {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        if slot >= MAX_MEMORY_SLOTS {
            return Err(PlatformError::SlotsExhausted(start));
        }
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: start,
            memory_size: backing.len() as u64,
            userspace_addr: backing.host_address(),
            flags: 0,
        };
        // SAFETY: the backing mmap is kept alive by the address space for the
        // lifetime of the VM, and regions never overlap.
        unsafe { self.vm.set_user_memory_region(region) }
            .map_err(|source| PlatformError::MapMemory { start, source })?;
        debug!(
            "slot {slot}: guest [{start:#x}, {:#x}) -> host {:#x}",
            start + backing.len() as u64,
            backing.host_address()
        );
        Ok(())
    }

    fn map_special_memory(&self, start: u64) -> Result<(), PlatformError> {
        self.vm
            .set_identity_map_address(start)
            .map_err(PlatformError::IdentityMap)?;
        self.vm
            .set_tss_address((start + PAGE_SIZE) as usize)
            .map_err(PlatformError::TssAddress)?;
        Ok(())
    }

    fn create_vcpu(&self, id: u32) -> Result<Box<dyn VcpuBackend>, PlatformError> {
        let fd = self
            .vm
            .create_vcpu(u64::from(id))
            .map_err(|source| PlatformError::VcpuCreate { id, source })?;
        fd.set_cpuid2(&self.cpuid).map_err(PlatformError::Cpuid)?;
        Ok(Box::new(KvmVcpu {
            id,
            fd,
            pending_io: false,
            kicker: Arc::new(ThreadKicker::default()),
        }))
    }

    fn bind_doorbell(
        &self,
        space: IoSpace,
        addr: u64,
        size: u8,
        value: u64,
    ) -> Result<Option<Box<dyn Doorbell>>, PlatformError> {
        if !self.use_eventfds {
            return Ok(None);
        }
        let fd = EventFd::new(0).map_err(PlatformError::Eventfd)?;
        let bound = ioevent(&self.vm, &fd, space, addr, size, value, true)
            .map_err(|source| PlatformError::IoEvent { addr, source })?;
        if !bound {
            return Ok(None);
        }
        Ok(Some(Box::new(KvmDoorbell {
            vm: Arc::clone(&self.vm),
            fd,
            space,
            addr,
            size,
            value,
        })))
    }

    fn set_irq_line(&self, irq: u32, active: bool) -> Result<(), PlatformError> {
        self.vm
            .set_irq_line(irq, active)
            .map_err(|source| PlatformError::IrqLine { irq, source })
    }

    fn signal_msi(&self, addr: u64, data: u32) -> Result<(), PlatformError> {
        let msi = kvm_msi {
            address_lo: addr as u32,
            address_hi: (addr >> 32) as u32,
            data,
            ..Default::default()
        };
        self.vm.signal_msi(msi).map_err(PlatformError::Msi)?;
        Ok(())
    }

    fn register_irqfd(&self, fd: &EventFd, irq: u32) -> Result<(), PlatformError> {
        self.vm
            .register_irqfd(fd, irq)
            .map_err(|source| PlatformError::Irqfd { irq, source })
    }
}

/// Registers or unregisters an ioeventfd.  The datamatch width is carried
/// by the integer type, so it has to be picked per access size.
///
/// Returns `false` for widths KVM cannot match on.
fn ioevent(
    vm: &VmFd,
    fd: &EventFd,
    space: IoSpace,
    addr: u64,
    size: u8,
    value: u64,
    register: bool,
) -> Result<bool, kvm_ioctls::Error> {
    let address = match space {
        IoSpace::Port => IoEventAddress::Pio(addr),
        IoSpace::Memory => IoEventAddress::Mmio(addr),
    };
    match (size, register) {
        (1, true) => vm.register_ioevent(fd, &address, value as u8)?,
        (1, false) => vm.unregister_ioevent(fd, &address, value as u8)?,
        (2, true) => vm.register_ioevent(fd, &address, value as u16)?,
        (2, false) => vm.unregister_ioevent(fd, &address, value as u16)?,
        (4, true) => vm.register_ioevent(fd, &address, value as u32)?,
        (4, false) => vm.unregister_ioevent(fd, &address, value as u32)?,
        (8, true) => vm.register_ioevent(fd, &address, value)?,
        (8, false) => vm.unregister_ioevent(fd, &address, value)?,
        _ => return Ok(false),
    }
    Ok(true)
}

// ═══════════════════════════════════════════════════════════════════════
//  Doorbells
// ═══════════════════════════════════════════════════════════════════════

struct KvmDoorbell {
    vm: Arc<VmFd>,
    fd: EventFd,
    space: IoSpace,
    addr: u64,
    size: u8,
    value: u64,
}

impl Doorbell for KvmDoorbell {
    fn wait(&self) -> Result<u64, PlatformError> {
        self.fd.read().map_err(PlatformError::Eventfd)
    }

    fn wake(&self) -> Result<(), PlatformError> {
        self.fd.write(DOORBELL_WAKE).map_err(PlatformError::Eventfd)
    }

    fn close(&self) -> Result<(), PlatformError> {
        ioevent(
            &self.vm,
            &self.fd,
            self.space,
            self.addr,
            self.size,
            self.value,
            false,
        )
        .map_err(|source| PlatformError::IoEvent {
            addr: self.addr,
            source,
        })?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VCPU
// ═══════════════════════════════════════════════════════════════════════

struct KvmVcpu {
    id: u32,
    fd: VcpuFd,
    /// The last exit was PIO/MMIO and KVM has not yet consumed the result.
    pending_io: bool,
    kicker: Arc<ThreadKicker>,
}

impl KvmVcpu {
    /// Lets KVM finish an in-progress I/O instruction without running any
    /// further guest code, so the register file reflects its completion.
    fn complete_pending_io(&mut self) -> Result<(), PlatformError> {
        if !std::mem::take(&mut self.pending_io) {
            return Ok(());
        }
        self.fd.set_kvm_immediate_exit(1);
        let outcome = match self.fd.run() {
            Ok(_) => Ok(()),
            Err(e) if is_interrupted(&e) => Ok(()),
            Err(e) => Err(PlatformError::Run(e)),
        };
        self.fd.set_kvm_immediate_exit(0);
        outcome
    }
}

fn is_interrupted(e: &kvm_ioctls::Error) -> bool {
    e.errno() == libc::EINTR || e.errno() == libc::EAGAIN
}

impl VcpuBackend for KvmVcpu {
    fn id(&self) -> u32 {
        self.id
    }

    fn run(&mut self) -> Result<GuestExit<'_>, PlatformError> {
        self.pending_io = false;
        let exit = match self.fd.run() {
            Ok(exit) => exit,
            Err(e) if is_interrupted(&e) => return Ok(GuestExit::Interrupted),
            Err(e) => return Err(PlatformError::Run(e)),
        };
        Ok(match exit {
            VcpuExit::IoIn(port, data) => {
                self.pending_io = true;
                GuestExit::PortIo {
                    port,
                    data: IoData::In(data),
                }
            }
            VcpuExit::IoOut(port, data) => {
                self.pending_io = true;
                GuestExit::PortIo {
                    port,
                    data: IoData::Out(data),
                }
            }
            VcpuExit::MmioRead(addr, data) => {
                self.pending_io = true;
                GuestExit::Mmio {
                    addr,
                    data: IoData::In(data),
                }
            }
            VcpuExit::MmioWrite(addr, data) => {
                self.pending_io = true;
                GuestExit::Mmio {
                    addr,
                    data: IoData::Out(data),
                }
            }
            VcpuExit::Debug(arch) => GuestExit::Debug { pc: arch.pc },
            VcpuExit::Hlt => GuestExit::Halt,
            VcpuExit::Shutdown => GuestExit::Shutdown,
            VcpuExit::Unknown => GuestExit::NoReason,
            other => GuestExit::Unhandled(format!("{other:?}")),
        })
    }

    fn get_registers(&mut self) -> Result<Registers, PlatformError> {
        self.complete_pending_io()?;
        let regs = self.fd.get_regs().map_err(PlatformError::Registers)?;
        Ok(regs_from_kvm(&regs))
    }

    fn set_registers(&mut self, regs: &Registers) -> Result<(), PlatformError> {
        self.complete_pending_io()?;
        self.fd
            .set_regs(&regs_to_kvm(regs))
            .map_err(PlatformError::Registers)
    }

    fn set_single_step(&mut self, enabled: bool) -> Result<(), PlatformError> {
        let debug = kvm_guest_debug {
            control: if enabled {
                KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP
            } else {
                0
            },
            ..Default::default()
        };
        self.fd
            .set_guest_debug(&debug)
            .map_err(PlatformError::GuestDebug)
    }

    fn set_boot_entry(&mut self, entry: u64) -> Result<(), PlatformError> {
        let mut sregs = self.fd.get_sregs().map_err(PlatformError::Registers)?;
        sregs.cs.base = 0;
        sregs.cs.selector = 0;
        self.fd.set_sregs(&sregs).map_err(PlatformError::Registers)?;

        let mut regs = self.fd.get_regs().map_err(PlatformError::Registers)?;
        regs.rip = entry;
        regs.rflags = 0x2;
        self.fd.set_regs(&regs).map_err(PlatformError::Registers)
    }

    fn kicker(&self) -> Arc<dyn Kick> {
        self.kicker.clone()
    }
}

fn regs_from_kvm(r: &kvm_regs) -> Registers {
    Registers {
        rax: r.rax,
        rbx: r.rbx,
        rcx: r.rcx,
        rdx: r.rdx,
        rsi: r.rsi,
        rdi: r.rdi,
        rsp: r.rsp,
        rbp: r.rbp,
        r8: r.r8,
        r9: r.r9,
        r10: r.r10,
        r11: r.r11,
        r12: r.r12,
        r13: r.r13,
        r14: r.r14,
        r15: r.r15,
        rip: r.rip,
        rflags: r.rflags,
    }
}

fn regs_to_kvm(r: &Registers) -> kvm_regs {
    kvm_regs {
        rax: r.rax,
        rbx: r.rbx,
        rcx: r.rcx,
        rdx: r.rdx,
        rsi: r.rsi,
        rdi: r.rdi,
        rsp: r.rsp,
        rbp: r.rbp,
        r8: r.r8,
        r9: r.r9,
        r10: r.r10,
        r11: r.r11,
        r12: r.r12,
        r13: r.r13,
        r14: r.r14,
        r15: r.r15,
        rip: r.rip,
        rflags: r.rflags,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Kicking
// ═══════════════════════════════════════════════════════════════════════

static KICK_HANDLER: OnceLock<Result<(), vmm_sys_util::errno::Error>> = OnceLock::new();

extern "C" fn handle_kick(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

/// Installs a no-op SIGRTMIN handler so that the signal only interrupts
/// `KVM_RUN` with `EINTR` instead of terminating the process.
fn install_kick_handler() -> Result<(), PlatformError> {
    KICK_HANDLER
        .get_or_init(|| register_signal_handler(SIGRTMIN(), handle_kick))
        .clone()
        .map_err(PlatformError::SignalHandler)
}

/// Interrupts a VCPU thread with SIGRTMIN.
#[derive(Default)]
struct ThreadKicker {
    thread: Mutex<Option<libc::pthread_t>>,
}

impl Kick for ThreadKicker {
    fn bind_current_thread(&self) {
        // SAFETY: pthread_self has no preconditions.
        let tid = unsafe { libc::pthread_self() };
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(tid);
    }

    fn kick(&self) {
        let thread = *self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tid) = thread {
            // SAFETY: tid was recorded by the VCPU thread itself.  Kicks are
            // only issued under the executor state lock while `running` is
            // set, and the thread must take that lock to exit.
            let rc = unsafe { libc::pthread_kill(tid, SIGRTMIN()) };
            if rc != 0 {
                warn!("failed to kick vCPU thread: errno {rc}");
            }
        }
    }
}
