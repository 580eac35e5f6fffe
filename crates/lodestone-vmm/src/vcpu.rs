//! VCPU executor: one thread per virtual CPU and its pause state machine.
//!
//! # Pausing
//!
//! A VCPU is paused while it is manually paused or while any internal
//! pause is outstanding.  The two tiers share one lock and two condition
//! variables:
//!
//! ```text
//!   controller                         VCPU thread
//!   ──────────                         ───────────
//!   pause(manual)                      loop {
//!     update PauseState                  lock state
//!     while running:                     if paused:
//!       kick ───────────────────────▶      capture registers
//!       wait "paused" ◀──────────────      running = false, notify
//!                                          wait "resume"
//!   unpause(manual)                        continue
//!     update PauseState                  flush dirty registers
//!     if fully clear: notify ───────▶    running = true
//!                                        unlock, enter guest
//!                                      }
//! ```
//!
//! `pause` returns only once the thread is parked with its registers in
//! the cache, so register reads after a pause see the parked state.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exit::{ExitAction, ExitError, ExitRouter};
use crate::platform::{Kick, PlatformError, Registers, VcpuBackend};
use crate::verified::pause::{PauseError, PauseState};

/// Interval between kicks while waiting for a VCPU to park.
const KICK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum VcpuError {
    #[error(transparent)]
    Pause(#[from] PauseError),

    #[error("vcpu{0} is running; pause it first")]
    Running(u32),

    #[error("vcpu{0} has no captured register state")]
    NoRegisters(u32),

    #[error("vcpu{id}: {source}")]
    Platform {
        id: u32,
        #[source]
        source: PlatformError,
    },

    #[error("vcpu{id}: {source}")]
    Exit {
        id: u32,
        #[source]
        source: ExitError,
    },
}

#[derive(Debug, Default)]
struct RunState {
    pause: PauseState,
    /// The thread is between its pause check and its next park.
    running: bool,
    stopped: bool,
    stop_requested: bool,
    single_step: bool,
    step_dirty: bool,
}

#[derive(Debug, Default)]
struct RegisterCache {
    regs: Registers,
    /// `regs` matches the backend.
    valid: bool,
    /// `regs` was written by the controller and must reach the backend.
    dirty: bool,
}

/// Externally visible VCPU settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuSettings {
    pub id: u32,
    pub single_step: bool,
    pub paused: bool,
}

/// The half of a VCPU other threads talk to.
pub struct VcpuControl {
    id: u32,
    state: Mutex<RunState>,
    paused_cv: Condvar,
    resume_cv: Condvar,
    regs: Mutex<RegisterCache>,
    kicker: Arc<dyn Kick>,
}

impl VcpuControl {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_regs(&self) -> MutexGuard<'_, RegisterCache> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Pauses the VCPU and waits until its thread is parked.
    ///
    /// A second manual pause fails with [`PauseError::AlreadyPaused`]
    /// without blocking.  Internal pauses nest.
    pub fn pause(&self, manual: bool) -> Result<(), VcpuError> {
        let mut state = self.lock();
        state.pause = state.pause.pause(manual)?;
        while state.running && !state.stopped {
            self.kicker.kick();
            state = self
                .paused_cv
                .wait_timeout(state, KICK_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        debug!("vcpu{}: paused (manual: {manual})", self.id);
        Ok(())
    }

    /// Lifts one pause.  The thread resumes once neither tier holds it.
    pub fn unpause(&self, manual: bool) -> Result<(), VcpuError> {
        let mut state = self.lock();
        state.pause = state.pause.unpause(manual)?;
        if !state.pause.is_paused() {
            self.resume_cv.notify_all();
            debug!("vcpu{}: resumed", self.id);
        }
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.lock().pause.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Register state of a parked, stopped or not yet started VCPU.
    pub fn registers(&self) -> Result<Registers, VcpuError> {
        let state = self.lock();
        if state.running && !state.stopped {
            return Err(VcpuError::Running(self.id));
        }
        let cache = self.lock_regs();
        if !cache.valid {
            return Err(VcpuError::NoRegisters(self.id));
        }
        Ok(cache.regs)
    }

    /// Replaces the register state; it reaches the backend before the
    /// thread next enters the guest.
    pub fn set_registers(&self, regs: Registers) -> Result<(), VcpuError> {
        let state = self.lock();
        if state.running && !state.stopped {
            return Err(VcpuError::Running(self.id));
        }
        let mut cache = self.lock_regs();
        cache.regs = regs;
        cache.valid = true;
        cache.dirty = true;
        Ok(())
    }

    /// Requests single-stepping; applied at the thread's next iteration.
    pub fn set_single_step(&self, enabled: bool) {
        let mut state = self.lock();
        state.single_step = enabled;
        state.step_dirty = true;
        if state.running {
            self.kicker.kick();
        }
    }

    pub fn settings(&self) -> VcpuSettings {
        let state = self.lock();
        VcpuSettings {
            id: self.id,
            single_step: state.single_step,
            paused: state.pause.is_paused(),
        }
    }

    /// Makes the thread leave its loop and waits until it has.  Does not
    /// wait for a VCPU that was never started.
    pub fn request_stop(&self) {
        let mut state = self.lock();
        state.stop_requested = true;
        self.resume_cv.notify_all();
        while state.running && !state.stopped {
            self.kicker.kick();
            state = self
                .paused_cv
                .wait_timeout(state, KICK_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// A VCPU before it is handed to its thread.
pub struct Vcpu {
    control: Arc<VcpuControl>,
    backend: Box<dyn VcpuBackend>,
}

impl Vcpu {
    /// Wraps `backend`, priming the register cache from it.
    pub fn new(mut backend: Box<dyn VcpuBackend>) -> Result<Self, VcpuError> {
        let id = backend.id();
        let regs = backend
            .get_registers()
            .map_err(|source| VcpuError::Platform { id, source })?;
        let control = Arc::new(VcpuControl {
            id,
            state: Mutex::new(RunState::default()),
            paused_cv: Condvar::new(),
            resume_cv: Condvar::new(),
            regs: Mutex::new(RegisterCache {
                regs,
                valid: true,
                dirty: false,
            }),
            kicker: backend.kicker(),
        });
        Ok(Self { control, backend })
    }

    pub fn control(&self) -> &Arc<VcpuControl> {
        &self.control
    }

    /// Points the VCPU at `entry` and refreshes the register cache.
    pub fn set_boot_entry(&mut self, entry: u64) -> Result<(), VcpuError> {
        let id = self.control.id;
        self.backend
            .set_boot_entry(entry)
            .map_err(|source| VcpuError::Platform { id, source })?;
        let regs = self
            .backend
            .get_registers()
            .map_err(|source| VcpuError::Platform { id, source })?;
        let mut cache = self.control.lock_regs();
        cache.regs = regs;
        cache.valid = true;
        cache.dirty = false;
        Ok(())
    }

    /// Runs the guest until it shuts down, a stop is requested, or an exit
    /// fails.  Consumes the VCPU; call on its own thread.
    pub fn run(mut self, router: &ExitRouter) -> Result<(), VcpuError> {
        let id = self.control.id;
        self.control.kicker.bind_current_thread();
        info!("vcpu{id}: started");

        let result = self.run_loop(router);

        let control = Arc::clone(&self.control);
        let mut state = control.lock();
        if let Err(e) = self.capture_registers() {
            warn!("vcpu{id}: final register capture failed: {e}");
        }
        state.stopped = true;
        state.running = false;
        control.paused_cv.notify_all();
        drop(state);

        match &result {
            Ok(()) => info!("vcpu{id}: stopped"),
            Err(e) => warn!("vcpu{id}: failed: {e}"),
        }
        result
    }

    fn run_loop(&mut self, router: &ExitRouter) -> Result<(), VcpuError> {
        let id = self.control.id;
        loop {
            let control = Arc::clone(&self.control);
            let mut state = control.lock();
            if state.stop_requested {
                return Ok(());
            }
            if state.pause.is_paused() {
                self.capture_registers()?;
                state.running = false;
                control.paused_cv.notify_all();
                while state.pause.is_paused() && !state.stop_requested {
                    state = control
                        .resume_cv
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                continue;
            }

            self.flush_pending(&mut state)?;
            state.running = true;
            control.lock_regs().valid = false;
            drop(state);

            let exit = self
                .backend
                .run()
                .map_err(|source| VcpuError::Platform { id, source })?;
            match router.route(id, exit) {
                Ok(ExitAction::Resume) => {}
                Ok(ExitAction::Stop) => return Ok(()),
                Err(source) => return Err(VcpuError::Exit { id, source }),
            }
        }
    }

    /// Pushes controller-side changes to the backend.  Called with the
    /// state lock held so no change slips in before the guest is entered.
    fn flush_pending(&mut self, state: &mut RunState) -> Result<(), VcpuError> {
        let id = self.control.id;
        let mut cache = self.control.lock_regs();
        if cache.dirty {
            self.backend
                .set_registers(&cache.regs)
                .map_err(|source| VcpuError::Platform { id, source })?;
            cache.dirty = false;
        }
        drop(cache);

        if state.step_dirty {
            self.backend
                .set_single_step(state.single_step)
                .map_err(|source| VcpuError::Platform { id, source })?;
            state.step_dirty = false;
            debug!("vcpu{id}: single-step {}", state.single_step);
        }
        Ok(())
    }

    /// Loads the backend's registers into the cache unless a controller
    /// write is still pending.
    fn capture_registers(&mut self) -> Result<(), VcpuError> {
        let id = self.control.id;
        let mut cache = self.control.lock_regs();
        if cache.dirty || cache.valid {
            return Ok(());
        }
        cache.regs = self
            .backend
            .get_registers()
            .map_err(|source| VcpuError::Platform { id, source })?;
        cache.valid = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventfd::EventfdPolicy;
    use crate::model::Model;
    use crate::testing::{wait_until, FakeGuest, FakeStep, FakeVcpu};
    use std::thread::{self, JoinHandle};

    fn router() -> ExitRouter {
        let model = Model::new(
            Arc::new(crate::testing::FakePlatform::default()),
            EventfdPolicy::default(),
        )
        .unwrap();
        ExitRouter::new(model, None)
    }

    fn vcpu(script: Vec<FakeStep>) -> (Vcpu, Arc<FakeGuest>) {
        let (backend, guest) = FakeVcpu::new(0, script);
        (Vcpu::new(Box::new(backend)).unwrap(), guest)
    }

    fn start(vcpu: Vcpu) -> (Arc<VcpuControl>, JoinHandle<Result<(), VcpuError>>) {
        let control = Arc::clone(vcpu.control());
        let handle = thread::spawn(move || vcpu.run(&router()));
        (control, handle)
    }

    fn stop(control: &VcpuControl, handle: JoinHandle<Result<(), VcpuError>>) {
        control.request_stop();
        handle.join().unwrap().unwrap();
        assert!(control.is_stopped());
    }

    #[test]
    fn manual_pause_misuse_does_not_block() {
        let (vcpu, _) = vcpu(vec![]);
        let control = vcpu.control();
        control.pause(true).unwrap();
        assert!(matches!(
            control.pause(true),
            Err(VcpuError::Pause(PauseError::AlreadyPaused))
        ));
        control.unpause(true).unwrap();
        assert!(matches!(
            control.unpause(true),
            Err(VcpuError::Pause(PauseError::NotPaused))
        ));
    }

    #[test]
    fn registers_available_before_start() {
        let (mut vcpu, guest) = vcpu(vec![]);
        vcpu.set_boot_entry(0x1000).unwrap();
        assert_eq!(*guest.entry.lock().unwrap(), Some(0x1000));
        assert_eq!(vcpu.control().registers().unwrap().rip, 0x1000);
    }

    #[test]
    fn pause_parks_running_thread_with_stable_registers() {
        let (vcpu, guest) = vcpu(vec![]);
        let (control, handle) = start(vcpu);
        wait_until(|| guest.registers.lock().unwrap().rip > 3);
        assert!(matches!(control.registers(), Err(VcpuError::Running(0))));

        control.pause(true).unwrap();
        let first = control.registers().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(control.registers().unwrap(), first);
        assert_eq!(*guest.registers.lock().unwrap(), first);

        control.unpause(true).unwrap();
        wait_until(|| guest.registers.lock().unwrap().rip > first.rip);
        stop(&control, handle);
    }

    #[test]
    fn register_writes_reach_guest_on_resume() {
        let (vcpu, guest) = vcpu(vec![]);
        let (control, handle) = start(vcpu);
        control.pause(true).unwrap();

        let mut regs = control.registers().unwrap();
        regs.rax = 42;
        control.set_registers(regs).unwrap();
        assert_eq!(control.registers().unwrap().rax, 42);

        control.unpause(true).unwrap();
        wait_until(|| guest.registers.lock().unwrap().rax == 42);

        // Paused again, the read returns the value set before the pause.
        control.pause(false).unwrap();
        assert_eq!(control.registers().unwrap().rax, 42);
        control.unpause(false).unwrap();
        stop(&control, handle);
    }

    #[test]
    fn internal_pauses_nest_under_manual() {
        let (vcpu, guest) = vcpu(vec![]);
        let (control, handle) = start(vcpu);
        control.pause(false).unwrap();
        control.pause(false).unwrap();
        control.pause(true).unwrap();

        control.unpause(false).unwrap();
        control.unpause(true).unwrap();
        assert!(control.is_paused());
        let parked = control.registers().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(*guest.registers.lock().unwrap(), parked);

        control.unpause(false).unwrap();
        assert!(!control.is_paused());
        wait_until(|| guest.registers.lock().unwrap().rip > parked.rip);
        stop(&control, handle);
    }

    #[test]
    fn single_step_applied_by_thread() {
        let (vcpu, guest) = vcpu(vec![]);
        let (control, handle) = start(vcpu);
        control.set_single_step(true);
        wait_until(|| guest.single_step.load(std::sync::atomic::Ordering::SeqCst));
        assert!(control.settings().single_step);
        assert!(!control.settings().paused);
        stop(&control, handle);
    }

    #[test]
    fn shutdown_stops_cleanly() {
        let (vcpu, _) = vcpu(vec![FakeStep::Halt, FakeStep::Shutdown]);
        let (control, handle) = start(vcpu);
        handle.join().unwrap().unwrap();
        assert!(control.is_stopped());
        // Pausing a stopped VCPU does not block.
        control.pause(true).unwrap();
        assert!(control.registers().is_ok());
    }

    #[test]
    fn no_reason_exit_is_fatal() {
        let (vcpu, _) = vcpu(vec![FakeStep::NoReason]);
        let (control, handle) = start(vcpu);
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            VcpuError::Exit {
                id: 0,
                source: ExitError::NoReason
            }
        ));
        assert!(control.is_stopped());
    }
}
