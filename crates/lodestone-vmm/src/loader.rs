//! Guest image loading.
//!
//! Only flat binaries are understood: the image is copied into user memory
//! in the low 64 KiB and executed from its first byte in real mode.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;

use crate::memory::{AddressSpace, MemoryError};

/// Lowest address a flat image may occupy; page 0 stays free.
pub const FLAT_LOAD_START: u64 = 0x1000;
/// End of the window reachable with a zero code segment.
pub const FLAT_LOAD_END: u64 = 0x1_0000;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Image is empty")]
    Empty,

    #[error("Failed to place image: {0}")]
    Memory(#[from] MemoryError),
}

/// Places a guest image and reports where execution starts.
pub trait Loader {
    fn load(&self, memory: &mut AddressSpace) -> Result<u64, LoaderError>;
}

pub struct FlatImage {
    bytes: Vec<u8>,
}

impl FlatImage {
    pub fn new(bytes: Vec<u8>) -> Result<Self, LoaderError> {
        if bytes.is_empty() {
            return Err(LoaderError::Empty);
        }
        Ok(Self { bytes })
    }

    pub fn from_file(path: &Path) -> Result<Self, LoaderError> {
        let bytes = fs::read(path).map_err(|source| LoaderError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(bytes)
    }
}

impl Loader for FlatImage {
    fn load(&self, memory: &mut AddressSpace) -> Result<u64, LoaderError> {
        let entry = memory.load(FLAT_LOAD_START, FLAT_LOAD_END, &self.bytes, false)?;
        info!("flat image: {} bytes, entry {entry:#x}", self.bytes.len());
        Ok(entry)
    }
}
