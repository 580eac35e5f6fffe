//! VM assembly and lifecycle.
//!
//! ```text
//!   Vm::new(config)
//!     ├─ platform (KVM)
//!     ├─ Model: devices attached in config order, caches built
//!     └─ one Vcpu per configured CPU, registers primed
//!   load_image(loader)     image into user memory, VCPU 0 at its entry
//!   start()                one "vcpu<N>" thread each, under a Supervisor
//!   pause_all / snapshot / restore / unpause_all
//!   wait()                 until every VCPU has stopped
//! ```

use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::config::{ConfigError, VmConfig};
use crate::devices::DeviceError;
use crate::exit::{ExitRouter, InstructionTracer};
use crate::io::IoError;
use crate::loader::{Loader, LoaderError};
use crate::model::Model;
use crate::platform::kvm::KvmPlatform;
use crate::platform::{PlatformError, VmPlatform};
use crate::snapshot::{SnapshotError, VcpuState, VmState};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::vcpu::{Vcpu, VcpuControl, VcpuError};

#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("VM already started")]
    AlreadyStarted,

    #[error("No vcpu{0}")]
    NoSuchVcpu(u32),
}

pub struct Vm {
    config: VmConfig,
    model: Arc<Model>,
    controls: Vec<Arc<VcpuControl>>,
    /// VCPUs not yet handed to their threads.
    pending: Vec<Vcpu>,
    tracer: Option<Arc<dyn InstructionTracer>>,
    supervisor: Supervisor,
}

impl Vm {
    /// Builds a KVM-backed VM.
    pub fn new(config: VmConfig) -> Result<Self, VmError> {
        let platform = KvmPlatform::new(config.eventfds.enabled)?;
        Self::with_platform(Arc::new(platform), config)
    }

    pub fn with_platform(platform: Arc<dyn VmPlatform>, config: VmConfig) -> Result<Self, VmError> {
        config.validate()?;
        let model = Model::new(Arc::clone(&platform), config.eventfds)?;
        model.create_devices(&config.effective_devices())?;

        let pending = (0..config.vcpus)
            .map(|id| Ok(Vcpu::new(platform.create_vcpu(id)?)?))
            .collect::<Result<Vec<_>, VmError>>()?;
        let controls = pending.iter().map(|v| Arc::clone(v.control())).collect();
        info!(
            "VM ready: {} vcpus, {} devices",
            config.vcpus,
            config.devices.len()
        );

        Ok(Self {
            config,
            model,
            controls,
            pending,
            tracer: None,
            supervisor: Supervisor::new(),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn vcpus(&self) -> &[Arc<VcpuControl>] {
        &self.controls
    }

    pub fn vcpu(&self, id: u32) -> Result<&Arc<VcpuControl>, VmError> {
        self.controls
            .iter()
            .find(|c| c.id() == id)
            .ok_or(VmError::NoSuchVcpu(id))
    }

    fn is_started(&self) -> bool {
        self.pending.len() < self.controls.len()
    }

    /// Loads an image into guest memory and points VCPU 0 at its entry.
    pub fn load_image(&mut self, loader: &dyn Loader) -> Result<u64, VmError> {
        if self.is_started() {
            return Err(VmError::AlreadyStarted);
        }
        let entry = self.model.with_memory(|memory| loader.load(memory))?;
        let boot = self.pending.first_mut().ok_or(VmError::NoSuchVcpu(0))?;
        boot.set_boot_entry(entry)?;
        Ok(entry)
    }

    /// Receives debug exits from every VCPU started afterwards.
    pub fn set_tracer(&mut self, tracer: Arc<dyn InstructionTracer>) {
        self.tracer = Some(tracer);
    }

    pub fn start(&mut self) -> Result<(), VmError> {
        if self.is_started() {
            return Err(VmError::AlreadyStarted);
        }
        let router = ExitRouter::new(Arc::clone(&self.model), self.tracer.clone());
        for vcpu in self.pending.drain(..) {
            self.supervisor.spawn(vcpu, router.clone())?;
        }
        info!("VM started");
        Ok(())
    }

    /// Blocks until every VCPU thread has exited.
    pub fn wait(&mut self) -> Result<(), VmError> {
        self.supervisor.wait()?;
        info!("all vcpus stopped");
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), VmError> {
        self.start()?;
        self.wait()
    }

    /// Stops every VCPU and waits for the threads.
    pub fn shutdown(&mut self) -> Result<(), VmError> {
        for control in &self.controls {
            control.request_stop();
        }
        self.wait()
    }

    /// Pauses every VCPU.  On failure the VCPUs already paused are
    /// unpaused again.
    pub fn pause_all(&self, manual: bool) -> Result<(), VmError> {
        for (i, control) in self.controls.iter().enumerate() {
            if let Err(e) = control.pause(manual) {
                for done in self.controls[..i].iter().rev() {
                    if let Err(e) = done.unpause(manual) {
                        warn!("vcpu{}: rollback unpause failed: {e}", done.id());
                    }
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Unpauses every VCPU.  On failure the VCPUs already unpaused are
    /// paused again.
    pub fn unpause_all(&self, manual: bool) -> Result<(), VmError> {
        for (i, control) in self.controls.iter().enumerate() {
            if let Err(e) = control.unpause(manual) {
                for done in self.controls[..i].iter().rev() {
                    if let Err(e) = done.pause(manual) {
                        warn!("vcpu{}: rollback pause failed: {e}", done.id());
                    }
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Runs `f` with every VCPU paused, unpausing afterwards even if `f`
    /// fails.
    fn with_paused<R>(&self, f: impl FnOnce() -> Result<R, VmError>) -> Result<R, VmError> {
        self.pause_all(false)?;
        let result = f();
        self.unpause_all(false)?;
        result
    }

    pub fn snapshot(&self) -> Result<VmState, VmError> {
        self.with_paused(|| {
            let vcpus = self
                .controls
                .iter()
                .map(|c| {
                    Ok(VcpuState {
                        id: c.id(),
                        registers: c.registers()?,
                        single_step: c.settings().single_step,
                    })
                })
                .collect::<Result<Vec<_>, VmError>>()?;
            Ok(VmState {
                vcpus,
                devices: self.model.device_info()?,
                memory: self.model.memory_records(),
            })
        })
    }

    /// Puts registers and device state back from `state`.  The VM must
    /// have been built from the same configuration.
    pub fn restore(&self, state: &VmState) -> Result<(), VmError> {
        if state.vcpus.len() != self.controls.len() {
            return Err(SnapshotError::VcpuCount {
                saved: state.vcpus.len(),
                actual: self.controls.len(),
            }
            .into());
        }
        self.with_paused(|| {
            for saved in &state.vcpus {
                let control = self.vcpu(saved.id)?;
                control.set_registers(saved.registers)?;
                control.set_single_step(saved.single_step);
            }
            self.model.load_state(&state.devices)?;
            Ok(())
        })
    }
}
