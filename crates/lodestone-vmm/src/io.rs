//! Per-device I/O actors.
//!
//! Every address region a device exposes gets one [`IoHandler`].  Behind
//! the handler sits a worker thread that owns the device's [`IoOps`] and
//! drains a request queue one entry at a time, so all accesses to a region
//! are totally ordered without a lock around device state.  Different
//! handlers run in parallel.
//!
//! A VCPU thread calls [`IoHandler::submit`], which enqueues the access and
//! blocks until the worker replies:
//!
//! ```text
//!  VCPU thread                     worker thread
//!  ───────────                     ─────────────
//!  gate.acquire()
//!  submit(event, offset) ──req──▶  ops.read / ops.write
//!        │ (blocked)
//!        ◀──────────────reply────  send result
//!  gate.release()
//! ```
//!
//! The gate is held by the submitter, not the worker, so a paused device's
//! worker still answers save and restore requests.
//!
//! Values are masked to the access width before a write reaches the device
//! and after a read leaves it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use crate::memory::MemoryRegion;
use crate::platform::PlatformError;
use crate::verified::io::{is_valid_access_size, normalize};
use crate::verified::pause::{PauseError, PauseState};

// ═══════════════════════════════════════════════════════════════════════
//  Events and operations
// ═══════════════════════════════════════════════════════════════════════

/// Which guest address space an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoSpace {
    Port,
    Memory,
}

/// One guest access, projected from either a PIO or an MMIO exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    /// Access width in bytes: 1, 2, 4 or 8.
    pub size: u8,
    /// Written value, or the read result once the access completes.
    pub data: u64,
    pub is_write: bool,
}

impl IoEvent {
    pub fn read(size: u8) -> Self {
        Self {
            size,
            data: 0,
            is_write: false,
        }
    }

    pub fn write(size: u8, data: u64) -> Self {
        Self {
            size,
            data,
            is_write: true,
        }
    }
}

/// What a device wants after handling a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write is complete; any doorbell bound to this address is torn
    /// down.
    Done,
    /// The write is complete and the device wants further writes of the
    /// same value delivered through a kernel doorbell.
    KeepDoorbell,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("Invalid access size {0}")]
    InvalidSize(u8),

    #[error("{device}: access at offset {offset:#x} failed: {reason}")]
    Device {
        device: String,
        offset: u64,
        reason: String,
    },

    #[error("I/O handler {0} is no longer running")]
    HandlerGone(String),

    #[error("Failed to spawn I/O handler thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to restore device state: {0}")]
    Restore(#[source] serde_json::Error),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Register-level behaviour of one device region.
///
/// Offsets are relative to the start of the region.  Values passed to
/// `write` are already masked to `size` bytes; values returned from `read`
/// are masked by the caller.
pub trait IoOps: Send {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, IoError>;

    fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<WriteOutcome, IoError>;

    /// Serialisable state, for devices that keep any.
    fn save(&self) -> Option<Value> {
        None
    }

    fn restore(&mut self, _state: &Value) -> Result<(), IoError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Device gate
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct GateState {
    pause: PauseState,
    in_flight: u32,
}

/// Two-tier pause gate around a device's operations.
///
/// [`IoHandler::submit`] brackets every access with [`DeviceGate::acquire`]
/// and [`DeviceGate::release`].  Once [`DeviceGate::pause`] returns, no access
/// is in flight and none starts until the gate is fully unpaused.
#[derive(Debug, Default)]
pub struct DeviceGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl DeviceGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self) {
        let mut state = self.lock();
        while state.pause.is_paused() {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.in_flight += 1;
    }

    pub fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.changed.notify_all();
        }
    }

    pub fn pause(&self, manual: bool) -> Result<(), PauseError> {
        let mut state = self.lock();
        state.pause = state.pause.pause(manual)?;
        while state.in_flight > 0 {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    pub fn unpause(&self, manual: bool) -> Result<(), PauseError> {
        let mut state = self.lock();
        state.pause = state.pause.unpause(manual)?;
        if !state.pause.is_paused() {
            self.changed.notify_all();
        }
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.lock().pause.is_paused()
    }
}

/// Identity and shared controls of one device instance.
#[derive(Debug)]
pub struct DeviceCore {
    pub name: String,
    pub driver: String,
    pub gate: DeviceGate,
    debug: AtomicBool,
}

impl DeviceCore {
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            driver: driver.into(),
            gate: DeviceGate::default(),
            debug: AtomicBool::new(false),
        })
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Handlers
// ═══════════════════════════════════════════════════════════════════════

type IoReply = Result<(u64, WriteOutcome), IoError>;

enum Request {
    Io {
        event: IoEvent,
        offset: u64,
        reply: Sender<IoReply>,
    },
    Save {
        reply: Sender<Option<Value>>,
    },
    Restore {
        state: Value,
        reply: Sender<Result<(), IoError>>,
    },
}

/// Sending half of a worker's queue.  The worker exits once every handler
/// sharing it is dropped.
struct IoWorker {
    name: String,
    requests: Sender<Request>,
}

/// A device region bound to its worker.
///
/// Cloning is cheap and clones share the worker.  [`IoHandler::relocated`]
/// rebinds the same worker at a new address, which keeps accesses ordered
/// across a BAR move.
#[derive(Clone)]
pub struct IoHandler {
    region: MemoryRegion,
    device: Arc<DeviceCore>,
    worker: Arc<IoWorker>,
}

impl IoHandler {
    /// Starts a worker thread owning `ops` and returns a handler for
    /// `region`.
    pub fn spawn(
        device: Arc<DeviceCore>,
        region: MemoryRegion,
        ops: Box<dyn IoOps>,
    ) -> Result<Self, IoError> {
        let name = format!("io-{}@{:#x}", device.name, region.start);
        let (requests, queue) = crossbeam_channel::unbounded();
        let core = Arc::clone(&device);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || serve(core, ops, queue))
            .map_err(|source| IoError::Spawn {
                name: name.clone(),
                source,
            })?;
        Ok(Self {
            region,
            device,
            worker: Arc::new(IoWorker { name, requests }),
        })
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    pub fn device(&self) -> &Arc<DeviceCore> {
        &self.device
    }

    /// The same worker, serving a region of the same size at `start`.
    pub fn relocated(&self, start: u64) -> Self {
        Self {
            region: MemoryRegion::new(start, self.region.size),
            device: Arc::clone(&self.device),
            worker: Arc::clone(&self.worker),
        }
    }

    /// `true` if both handlers serve the same region with the same worker.
    pub fn same_as(&self, other: &IoHandler) -> bool {
        self.region == other.region && Arc::ptr_eq(&self.worker, &other.worker)
    }

    /// Runs one access on the worker and waits for it to complete.
    ///
    /// For reads `event.data` receives the masked result.
    pub fn submit(&self, event: &mut IoEvent, offset: u64) -> Result<WriteOutcome, IoError> {
        self.device.gate.acquire();
        let result = self.round_trip(*event, offset);
        self.device.gate.release();
        let (data, outcome) = result?;
        event.data = data;
        Ok(outcome)
    }

    fn round_trip(&self, event: IoEvent, offset: u64) -> IoReply {
        let (reply, done) = crossbeam_channel::bounded(1);
        self.send(Request::Io {
            event,
            offset,
            reply,
        })?;
        done.recv().map_err(|_| self.gone())?
    }

    pub fn save_state(&self) -> Result<Option<Value>, IoError> {
        let (reply, done) = crossbeam_channel::bounded(1);
        self.send(Request::Save { reply })?;
        done.recv().map_err(|_| self.gone())
    }

    pub fn restore_state(&self, state: Value) -> Result<(), IoError> {
        let (reply, done) = crossbeam_channel::bounded(1);
        self.send(Request::Restore { state, reply })?;
        done.recv().map_err(|_| self.gone())?
    }

    fn send(&self, request: Request) -> Result<(), IoError> {
        self.worker.requests.send(request).map_err(|_| self.gone())
    }

    fn gone(&self) -> IoError {
        IoError::HandlerGone(self.worker.name.clone())
    }
}

impl std::fmt::Debug for IoHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandler")
            .field("device", &self.device.name)
            .field("region", &self.region)
            .finish()
    }
}

fn serve(device: Arc<DeviceCore>, mut ops: Box<dyn IoOps>, queue: Receiver<Request>) {
    for request in queue {
        match request {
            Request::Io {
                mut event,
                offset,
                reply,
            } => {
                let result = execute(ops.as_mut(), &mut event, offset);

                if device.is_debug() {
                    match &result {
                        Ok(_) if event.is_write => debug!(
                            "{}: write {:#x} @ {offset:#x} [size: {}]",
                            device.name, event.data, event.size
                        ),
                        Ok(_) => debug!(
                            "{}: read {:#x} @ {offset:#x} [size: {}]",
                            device.name, event.data, event.size
                        ),
                        Err(e) => debug!("{}: access @ {offset:#x} failed: {e}", device.name),
                    }
                }
                // The submitter only goes away if its thread died.
                let _ = reply.send(result.map(|outcome| (event.data, outcome)));
            }
            Request::Save { reply } => {
                let _ = reply.send(ops.save());
            }
            Request::Restore { state, reply } => {
                let result = ops.restore(&state);
                if let Err(e) = &result {
                    warn!("{}: restore failed: {e}", device.name);
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("{}: I/O worker exiting", device.name);
}

fn execute(ops: &mut dyn IoOps, event: &mut IoEvent, offset: u64) -> Result<WriteOutcome, IoError> {
    if !is_valid_access_size(event.size) {
        return Err(IoError::InvalidSize(event.size));
    }
    if event.is_write {
        event.data = normalize(event.data, event.size);
        ops.write(offset, event.size, event.data)
    } else {
        event.data = normalize(ops.read(offset, event.size)?, event.size);
        Ok(WriteOutcome::Done)
    }
}
