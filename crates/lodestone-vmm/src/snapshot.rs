//! Serialisable machine state.
//!
//! A [`VmState`] is taken with every VCPU paused and holds what is needed
//! to inspect a machine or to put an identically configured one back into
//! the same register and device state.  Guest RAM contents are not part of
//! it; the region table is recorded for diagnostics.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devices::DeviceInfo;
use crate::memory::RegionRecord;
use crate::platform::Registers;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to encode or decode snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to access snapshot file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Snapshot has {saved} VCPUs, VM has {actual}")]
    VcpuCount { saved: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuState {
    pub id: u32,
    pub registers: Registers,
    pub single_step: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmState {
    pub vcpus: Vec<VcpuState>,
    pub devices: Vec<DeviceInfo>,
    pub memory: Vec<RegionRecord>,
}

impl VmState {
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        fs::write(path, self.to_json()?).map_err(|source| SnapshotError::File {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let text = fs::read_to_string(path).map_err(|source| SnapshotError::File {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }
}
