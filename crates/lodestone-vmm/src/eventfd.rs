//! Kernel doorbell fast path for hot write addresses.
//!
//! When a guest keeps writing the same value to the same address (a virtio
//! queue notify, for instance) each write costs a full exit, a cache lookup
//! and a queue round trip.  Once an address has been hit often enough and
//! its device answers a write with [`WriteOutcome::KeepDoorbell`], the
//! [`EventfdBridge`] asks the platform to bind a [`Doorbell`] to
//! `(address, size, value)`.  The guest's writes then complete in the
//! kernel, and a waiter thread replays them into the handler.
//!
//! The doorbell lives until the device answers a replayed write with
//! [`WriteOutcome::Done`] (or fails), or until the owning dispatch cache is
//! retired by a topology flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::io::{IoError, IoEvent, IoHandler, IoSpace, WriteOutcome};
use crate::platform::{Doorbell, VmPlatform, DOORBELL_WAKE};

/// Hits before an address is considered hot.
pub const DEFAULT_THRESHOLD: u64 = 100;

/// When to promote addresses to doorbells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventfdPolicy {
    pub enabled: bool,
    /// Per-address hit count at which a write becomes eligible for
    /// promotion.  Inclusive: the write that brings the count to
    /// `threshold` is promoted.
    pub threshold: u64,
}

impl Default for EventfdPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Identity of a bound doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DoorbellKey {
    pub addr: u64,
    pub size: u8,
    pub value: u64,
}

struct ActiveDoorbell {
    doorbell: Arc<dyn Doorbell>,
    closed: AtomicBool,
}

impl ActiveDoorbell {
    /// Unbinds at most once.
    fn close(&self, key: &DoorbellKey) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.doorbell.close() {
            warn!("doorbell at {:#x}: unbind failed: {e}", key.addr);
        }
    }
}

/// Doorbells promoted through one dispatch cache.
pub struct EventfdBridge {
    platform: Arc<dyn VmPlatform>,
    space: IoSpace,
    policy: EventfdPolicy,
    active: Mutex<HashMap<DoorbellKey, Arc<ActiveDoorbell>>>,
    retired: AtomicBool,
}

impl EventfdBridge {
    pub fn new(platform: Arc<dyn VmPlatform>, space: IoSpace, policy: EventfdPolicy) -> Self {
        Self {
            platform,
            space,
            policy,
            active: Mutex::new(HashMap::new()),
            retired: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DoorbellKey, Arc<ActiveDoorbell>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` if an address with `hits` lookups qualifies for promotion.
    /// A retired bridge never does.
    pub fn is_hot(&self, hits: u64) -> bool {
        self.policy.enabled
            && hits >= self.policy.threshold
            && !self.retired.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, key: &DoorbellKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Binds a doorbell for the write just completed by `event` and starts
    /// its waiter.  Returns `false` if nothing was bound.
    pub fn promote(
        self: &Arc<Self>,
        addr: u64,
        handler: &IoHandler,
        offset: u64,
        event: &IoEvent,
    ) -> Result<bool, IoError> {
        if self.retired.load(Ordering::SeqCst) || !event.is_write {
            return Ok(false);
        }
        let key = DoorbellKey {
            addr,
            size: event.size,
            value: event.data,
        };

        let mut active = self.lock();
        // Re-checked under the lock `retire` drains with.
        if self.retired.load(Ordering::SeqCst) || active.contains_key(&key) {
            return Ok(false);
        }
        let Some(doorbell) = self
            .platform
            .bind_doorbell(self.space, addr, key.size, key.value)?
        else {
            return Ok(false);
        };
        let entry = Arc::new(ActiveDoorbell {
            doorbell: Arc::from(doorbell),
            closed: AtomicBool::new(false),
        });

        let bridge = Arc::clone(self);
        let waiter_entry = Arc::clone(&entry);
        let waiter_handler = handler.clone();
        let name = format!("doorbell@{addr:#x}");
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || bridge.wait_loop(key, waiter_handler, offset, waiter_entry));
        if let Err(source) = spawned {
            entry.close(&key);
            return Err(IoError::Spawn { name, source });
        }

        active.insert(key, entry);
        info!(
            "{}: doorbell bound at {addr:#x} (size {}, value {:#x})",
            handler.device().name,
            key.size,
            key.value
        );
        Ok(true)
    }

    /// Unbinds every doorbell and stops promoting.
    ///
    /// Guest writes that reached a doorbell before it was unbound are still
    /// replayed by its waiter before the waiter exits.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        let drained: Vec<(DoorbellKey, Arc<ActiveDoorbell>)> = self.lock().drain().collect();
        for (key, entry) in drained {
            entry.close(&key);
            if let Err(e) = entry.doorbell.wake() {
                warn!("doorbell at {:#x}: wake failed: {e}", key.addr);
            }
        }
    }

    fn wait_loop(
        self: Arc<Self>,
        key: DoorbellKey,
        handler: IoHandler,
        offset: u64,
        entry: Arc<ActiveDoorbell>,
    ) {
        loop {
            let counter = match entry.doorbell.wait() {
                Ok(counter) => counter,
                Err(e) => {
                    warn!("doorbell at {:#x}: wait failed: {e}", key.addr);
                    break;
                }
            };
            let rings = counter % DOORBELL_WAKE;
            let woken = counter >= DOORBELL_WAKE;

            if !self.replay(&key, &handler, offset, rings) {
                break;
            }
            if woken {
                debug!("doorbell at {:#x}: retired", key.addr);
                break;
            }
        }

        {
            let mut active = self.lock();
            if active
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &entry))
            {
                active.remove(&key);
            }
        }
        entry.close(&key);
        info!("{}: doorbell at {:#x} torn down", handler.device().name, key.addr);
    }

    /// Delivers `rings` synthesized writes.  Returns `false` once the device
    /// stops asking for the doorbell.
    fn replay(&self, key: &DoorbellKey, handler: &IoHandler, offset: u64, rings: u64) -> bool {
        for _ in 0..rings {
            let mut event = IoEvent::write(key.size, key.value);
            match handler.submit(&mut event, offset) {
                Ok(WriteOutcome::KeepDoorbell) => {}
                Ok(WriteOutcome::Done) => return false,
                Err(e) => {
                    warn!("doorbell at {:#x}: replayed write failed: {e}", key.addr);
                    return false;
                }
            }
        }
        true
    }
}
