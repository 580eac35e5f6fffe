//! Catch-all handlers for addresses no device claims.
//!
//! Reads return all ones (masked to the access width), writes are
//! discarded.  The dispatch cache falls back to these so that a lookup
//! never fails.

use crate::io::{DeviceCore, IoError, IoHandler, IoOps, IoSpace, WriteOutcome};
use crate::memory::MemoryRegion;
use crate::verified::io::INVALID_READ;

struct InvalidOps;

impl IoOps for InvalidOps {
    fn read(&mut self, _offset: u64, _size: u8) -> Result<u64, IoError> {
        Ok(INVALID_READ)
    }

    fn write(&mut self, _offset: u64, _size: u8, _value: u64) -> Result<WriteOutcome, IoError> {
        Ok(WriteOutcome::Done)
    }
}

/// A handler covering the whole of `space`.
pub fn invalid_handler(space: IoSpace) -> Result<IoHandler, IoError> {
    let size = match space {
        IoSpace::Port => 0x1_0000,
        IoSpace::Memory => u64::MAX,
    };
    IoHandler::spawn(
        DeviceCore::new("invalid", "invalid"),
        MemoryRegion::new(0, size),
        Box::new(InvalidOps),
    )
}
