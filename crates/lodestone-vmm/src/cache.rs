//! Address-to-handler resolution for one I/O space.
//!
//! An [`IoDispatchCache`] is an immutable snapshot of the handlers for
//! either port or memory I/O, plus a memo of past lookups and a hit counter
//! per exact address.  It is never patched in place: when the device
//! topology changes the model builds a fresh cache and retires the old one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::eventfd::{EventfdBridge, EventfdPolicy};
use crate::io::{IoError, IoEvent, IoHandler, IoSpace, WriteOutcome};
use crate::platform::VmPlatform;

#[derive(Default)]
struct LookupState {
    /// Index into `handlers` for every claimed address seen so far.
    memo: HashMap<u64, usize>,
    hits: HashMap<u64, u64>,
    /// Hits on addresses no handler claims, shared so a guest sweeping
    /// unclaimed space cannot grow the maps above.
    fallback_hits: u64,
}

pub struct IoDispatchCache {
    space: IoSpace,
    handlers: Vec<IoHandler>,
    fallback: IoHandler,
    state: Mutex<LookupState>,
    bridge: Arc<EventfdBridge>,
}

impl IoDispatchCache {
    /// Builds a cache over `handlers`; addresses no handler covers resolve
    /// to `fallback`.
    pub fn new(
        space: IoSpace,
        handlers: Vec<IoHandler>,
        fallback: IoHandler,
        platform: Arc<dyn VmPlatform>,
        policy: EventfdPolicy,
    ) -> Self {
        debug!("{space:?} dispatch cache built over {} handlers", handlers.len());
        Self {
            space,
            handlers,
            fallback,
            state: Mutex::new(LookupState::default()),
            bridge: Arc::new(EventfdBridge::new(platform, space, policy)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LookupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn space(&self) -> IoSpace {
        self.space
    }

    pub fn handlers(&self) -> &[IoHandler] {
        &self.handlers
    }

    pub fn bridge(&self) -> &Arc<EventfdBridge> {
        &self.bridge
    }

    /// Resolves `addr` and counts the hit.
    ///
    /// Returns the handler and the hit count after the increment: per exact
    /// address for claimed addresses, shared across all unclaimed ones.
    /// Never fails: unmatched addresses resolve to the catch-all handler.
    pub fn lookup(&self, addr: u64) -> (&IoHandler, u64) {
        let mut state = self.lock();
        let slot = match state.memo.get(&addr) {
            Some(&slot) => Some(slot),
            None => {
                let slot = self
                    .handlers
                    .iter()
                    .position(|h| h.region().contains_addr(addr));
                if let Some(slot) = slot {
                    state.memo.insert(addr, slot);
                }
                slot
            }
        };
        let hits = match slot {
            Some(_) => {
                let hits = state.hits.entry(addr).or_insert(0);
                *hits += 1;
                *hits
            }
            None => {
                state.fallback_hits += 1;
                state.fallback_hits
            }
        };
        drop(state);

        let handler = slot.map_or(&self.fallback, |i| &self.handlers[i]);
        (handler, hits)
    }

    pub fn hit_count(&self, addr: u64) -> u64 {
        let state = self.lock();
        if state.memo.contains_key(&addr) {
            state.hits.get(&addr).copied().unwrap_or(0)
        } else if self.handlers.iter().any(|h| h.region().contains_addr(addr)) {
            0
        } else {
            state.fallback_hits
        }
    }

    /// Runs `event` against the handler for `addr` on the calling thread's
    /// behalf, promoting hot writes to doorbells.
    pub fn dispatch(&self, addr: u64, event: &mut IoEvent) -> Result<(), IoError> {
        let (handler, hits) = self.lookup(addr);
        let offset = addr.wrapping_sub(handler.region().start);
        let outcome = handler.submit(event, offset)?;

        if event.is_write && outcome == WriteOutcome::KeepDoorbell && self.bridge.is_hot(hits) {
            if let Err(e) = self.bridge.promote(addr, handler, offset, event) {
                warn!("{:?} {addr:#x}: doorbell promotion failed: {e}", self.space);
            }
        }
        Ok(())
    }

    /// Stops promotion and unbinds every doorbell bound through this cache.
    pub fn retire(&self) {
        self.bridge.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::invalid::invalid_handler;
    use crate::eventfd::DoorbellKey;
    use crate::io::DeviceCore;
    use crate::memory::MemoryRegion;
    use crate::testing::{wait_until, FakePlatform, LatchOps, RecordingOps};
    use crate::verified::io::INVALID_READ;

    fn latch(name: &str, start: u64, size: u64) -> IoHandler {
        IoHandler::spawn(
            DeviceCore::new(name, "latch"),
            MemoryRegion::new(start, size),
            Box::new(LatchOps::default()),
        )
        .unwrap()
    }

    fn port_cache(handlers: Vec<IoHandler>, platform: Arc<FakePlatform>) -> IoDispatchCache {
        let fallback = invalid_handler(IoSpace::Port).unwrap();
        IoDispatchCache::new(
            IoSpace::Port,
            handlers,
            fallback,
            platform,
            EventfdPolicy::default(),
        )
    }

    #[test]
    fn repeated_lookup_is_stable_and_counts_hits() {
        let cache = port_cache(
            vec![latch("rtc", 0x70, 2), latch("pic", 0x20, 2)],
            Arc::new(FakePlatform::default()),
        );
        let (first, h1) = cache.lookup(0x71);
        let first = first.clone();
        let (second, h2) = cache.lookup(0x71);
        assert!(first.same_as(second));
        assert_eq!(first.region(), MemoryRegion::new(0x70, 2));
        assert_eq!((h1, h2), (1, 2));
        assert_eq!(cache.hit_count(0x70), 0);
    }

    #[test]
    fn unmatched_addresses_share_one_counter() {
        let cache = port_cache(vec![], Arc::new(FakePlatform::default()));
        let (h, first) = cache.lookup(0x1234);
        assert_eq!(h.device().name, "invalid");
        let (_, second) = cache.lookup(0x1234);
        assert!(second > first);
        cache.lookup(0x5678);
        assert_eq!(cache.hit_count(0x1234), 3);
    }

    #[test]
    fn sweeping_unclaimed_space_does_not_grow_state() {
        let cache = IoDispatchCache::new(
            IoSpace::Memory,
            vec![latch("bar", 0xf000_0000, 0x1000)],
            invalid_handler(IoSpace::Memory).unwrap(),
            Arc::new(FakePlatform::default()),
            EventfdPolicy::default(),
        );
        for addr in (0xe000_0000u64..0xe010_0000).step_by(0x100) {
            cache.lookup(addr);
        }
        cache.lookup(0xf000_0004);
        let state = cache.lock();
        assert_eq!(state.memo.len(), 1);
        assert_eq!(state.hits.len(), 1);
        assert_eq!(state.fallback_hits, 0x1000);
    }

    #[test]
    fn rtc_port_write_then_narrow_read() {
        let cache = port_cache(vec![latch("rtc", 0x70, 2)], Arc::new(FakePlatform::default()));
        let mut w = IoEvent::write(2, 0x1234);
        cache.dispatch(0x70, &mut w).unwrap();
        let mut r = IoEvent::read(1);
        cache.dispatch(0x70, &mut r).unwrap();
        assert_eq!(r.data, 0x34);
    }

    #[test]
    fn offset_is_relative_to_handler_start() {
        let ops = RecordingOps::default();
        let log = ops.log();
        let handler = IoHandler::spawn(
            DeviceCore::new("uart", "test"),
            MemoryRegion::new(0x3f8, 8),
            Box::new(ops),
        )
        .unwrap();
        let cache = port_cache(vec![handler], Arc::new(FakePlatform::default()));
        cache.dispatch(0x3fd, &mut IoEvent::write(1, 0x41)).unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), &[(5u64, 0x41u64)]);
    }

    #[test]
    fn unmatched_read_returns_all_ones_and_write_is_dropped() {
        let cache = port_cache(vec![], Arc::new(FakePlatform::default()));
        cache.dispatch(0x80, &mut IoEvent::write(1, 0x12)).unwrap();
        let mut r = IoEvent::read(4);
        cache.dispatch(0x80, &mut r).unwrap();
        assert_eq!(r.data, INVALID_READ & 0xffff_ffff);
        let mut r = IoEvent::read(8);
        cache.dispatch(0x80, &mut r).unwrap();
        assert_eq!(r.data, INVALID_READ);
    }

    #[test]
    fn hot_address_promotes_then_tears_down_on_done() {
        let platform = Arc::new(FakePlatform::default());
        let ops = RecordingOps::default();
        ops.set_keep(true);
        let handler = IoHandler::spawn(
            DeviceCore::new("notify", "test"),
            MemoryRegion::new(0xc000, 0x10),
            Box::new(ops.clone()),
        )
        .unwrap();
        let fallback = invalid_handler(IoSpace::Port).unwrap();
        let cache = IoDispatchCache::new(
            IoSpace::Port,
            vec![handler],
            fallback,
            platform.clone(),
            EventfdPolicy {
                enabled: true,
                threshold: 3,
            },
        );
        let key = DoorbellKey {
            addr: 0xc004,
            size: 2,
            value: 1,
        };

        for _ in 0..2 {
            cache.dispatch(0xc004, &mut IoEvent::write(2, 1)).unwrap();
        }
        assert!(!cache.bridge().is_active(&key));
        cache.dispatch(0xc004, &mut IoEvent::write(2, 1)).unwrap();
        assert!(cache.bridge().is_active(&key));
        let hits_at_promotion = cache.hit_count(0xc004);

        // The next access arrives through the doorbell, not the cache.
        let bell = platform.doorbell(0xc004).unwrap();
        bell.ring(1);
        wait_until(|| ops.log().lock().unwrap().len() == 4);
        assert_eq!(cache.hit_count(0xc004), hits_at_promotion);

        // The device disclaims interest: the doorbell goes away.
        ops.set_keep(false);
        bell.ring(1);
        wait_until(|| !cache.bridge().is_active(&key));
        wait_until(|| bell.is_closed());

        // Following accesses take the lookup path again.
        cache.dispatch(0xc004, &mut IoEvent::write(2, 1)).unwrap();
        assert_eq!(cache.hit_count(0xc004), hits_at_promotion + 1);
    }

    #[test]
    fn reads_never_promote() {
        let platform = Arc::new(FakePlatform::default());
        let ops = RecordingOps::default();
        ops.set_keep(true);
        let handler = IoHandler::spawn(
            DeviceCore::new("notify", "test"),
            MemoryRegion::new(0xc000, 0x10),
            Box::new(ops),
        )
        .unwrap();
        let cache = IoDispatchCache::new(
            IoSpace::Port,
            vec![handler],
            invalid_handler(IoSpace::Port).unwrap(),
            platform,
            EventfdPolicy {
                enabled: true,
                threshold: 1,
            },
        );
        for _ in 0..5 {
            cache.dispatch(0xc000, &mut IoEvent::read(1)).unwrap();
        }
        assert_eq!(cache.bridge().active_count(), 0);
    }
}
