//! Guest physical address space for the Lodestone VMM.
//!
//! The [`AddressSpace`] is an ordered set of non-overlapping, typed
//! regions.  Devices populate it while they attach (the BIOS reserves its
//! holes, user memory fills the gaps, buses reserve their windows); the
//! loader then sub-allocates inside user regions to place images.
//!
//! Each region may carry a [`Backing`] buffer: an anonymous, page-aligned
//! mapping that the platform exposes to the guest.  Reserved holes carry no
//! backing.
//!
//! # Example
//!
//! ```no_run
//! use lodestone_vmm::memory::{AddressSpace, Backing, MemoryType};
//! use lodestone_vmm::platform::kvm::KvmPlatform;
//!
//! let platform = KvmPlatform::new(true).unwrap();
//! let mut space = AddressSpace::new();
//! space
//!     .reserve(&platform, "bios", MemoryType::Reserved, 0, 0x1000, None)
//!     .unwrap();
//!
//! let ram = Backing::anonymous(0x10_0000).unwrap();
//! space
//!     .reserve(&platform, "ram", MemoryType::User, 0x10_0000, 0x10_0000, Some(ram))
//!     .unwrap();
//!
//! let entry = space.load(0x10_0000, space.max(), b"\xf4", false).unwrap();
//! assert_eq!(entry, 0x10_0000);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_memory::mmap::MmapRegionError;
use vm_memory::{MmapRegion, VolatileMemory, VolatileMemoryError};

use crate::platform::{PlatformError, VmPlatform};
use crate::verified::region::{self, ProbeCandidates};

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The range overlaps a region or sub-allocation already recorded.
    #[error("Memory conflict at [{start:#x}, +{size:#x})")]
    Conflict { start: u64, size: u64 },

    /// No region of the requested type can hold the range.
    #[error("No {kind} memory region holds [{start:#x}, +{size:#x})")]
    NotFound {
        kind: MemoryType,
        start: u64,
        size: u64,
    },

    /// Start or size is not a multiple of the page size.
    #[error("Unaligned memory region [{start:#x}, +{size:#x})")]
    Unaligned { start: u64, size: u64 },

    /// A user region was reserved or loaded without a backing buffer.
    #[error("No backing buffer for memory at {start:#x}")]
    NoBacking { start: u64 },

    /// The backing buffer does not match the region size.
    #[error("Backing of {backing:#x} bytes does not match region of {size:#x} bytes")]
    BackingSize { size: u64, backing: u64 },

    #[error("Failed to map anonymous backing of {size} bytes: {source}")]
    Mmap {
        size: usize,
        #[source]
        source: MmapRegionError,
    },

    #[error("Backing access at offset {offset:#x} failed: {source}")]
    Access {
        offset: usize,
        #[source]
        source: VolatileMemoryError,
    },

    #[error("Platform failed to map region at {start:#x}: {source}")]
    Platform {
        start: u64,
        #[source]
        source: PlatformError,
    },
}

// ═══════════════════════════════════════════════════════════════════════
//  Regions
// ═══════════════════════════════════════════════════════════════════════

/// How a region is exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryType {
    /// A hole: recorded so nothing else lands there, never mapped.
    Reserved,
    /// Guest RAM.
    User,
    /// Firmware tables; mapped like RAM.
    Acpi,
    /// Platform-private pages (identity map, TSS).
    Special,
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryType::Reserved => "reserved",
            MemoryType::User => "user",
            MemoryType::Acpi => "acpi",
            MemoryType::Special => "special",
        };
        f.write_str(name)
    }
}

/// Half-open guest physical range `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Exclusive end, saturating at `u64::MAX`.
    pub const fn end(&self) -> u64 {
        region::region_end(self.start, self.size)
    }

    pub const fn overlaps(&self, other: &MemoryRegion) -> bool {
        region::overlaps(self.start, self.size, other.start, other.size)
    }

    pub const fn contains(&self, other: &MemoryRegion) -> bool {
        region::contains(self.start, self.size, other.start, other.size)
    }

    pub const fn contains_addr(&self, addr: u64) -> bool {
        region::contains_addr(self.start, self.size, addr)
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Backing buffers
// ═══════════════════════════════════════════════════════════════════════

/// A window onto an anonymous host mapping.
///
/// Windows share the underlying mapping, so handing out a window for a
/// sub-allocation keeps the whole mapping alive.
#[derive(Clone)]
pub struct Backing {
    mmap: Arc<MmapRegion>,
    offset: usize,
    len: usize,
}

impl Backing {
    /// Maps `size` bytes of zeroed anonymous memory.
    pub fn anonymous(size: usize) -> Result<Self, MemoryError> {
        let mmap: MmapRegion =
            MmapRegion::new(size).map_err(|source| MemoryError::Mmap { size, source })?;
        Ok(Self {
            mmap: Arc::new(mmap),
            offset: 0,
            len: size,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host virtual address of the first byte of this window.
    pub fn host_address(&self) -> u64 {
        self.mmap.as_ptr() as u64 + self.offset as u64
    }

    /// A narrower window `[offset, offset + len)` relative to this one.
    pub fn window(&self, offset: usize, len: usize) -> Option<Backing> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Self {
            mmap: Arc::clone(&self.mmap),
            offset: self.offset + offset,
            len,
        })
    }

    /// Copies `data` into the window at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let slice = self
            .mmap
            .get_slice(self.offset + offset, data.len())
            .map_err(|source| MemoryError::Access { offset, source })?;
        slice.copy_from(data);
        Ok(())
    }

    /// Fills `buf` from the window at `offset`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let slice = self
            .mmap
            .get_slice(self.offset + offset, buf.len())
            .map_err(|source| MemoryError::Access { offset, source })?;
        slice.copy_to(buf);
        Ok(())
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("host", &format_args!("{:#x}", self.host_address()))
            .field("len", &self.len)
            .finish()
    }
}

/// A region recorded in the address space.
#[derive(Debug, Clone)]
pub struct TypedMemoryRegion {
    pub region: MemoryRegion,
    pub kind: MemoryType,
    /// Name of the device that reserved it.
    pub owner: String,
    backing: Option<Backing>,
    /// Sub-allocations: offset from `region.start` to length.
    allocations: BTreeMap<u64, u64>,
}

impl TypedMemoryRegion {
    pub fn new(
        owner: impl Into<String>,
        kind: MemoryType,
        region: MemoryRegion,
        backing: Option<Backing>,
    ) -> Self {
        Self {
            region,
            kind,
            owner: owner.into(),
            backing,
            allocations: BTreeMap::new(),
        }
    }

    pub fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    pub fn allocations(&self) -> impl Iterator<Item = MemoryRegion> + '_ {
        self.allocations
            .iter()
            .map(|(&off, &len)| MemoryRegion::new(self.region.start + off, len))
    }

    fn allocate_at(&mut self, offset: u64, size: u64) -> Result<(), MemoryError> {
        let conflict = self
            .allocations
            .iter()
            .any(|(&o, &l)| region::overlaps(o, l, offset, size));
        if conflict {
            return Err(MemoryError::Conflict {
                start: self.region.start + offset,
                size,
            });
        }
        self.allocations.insert(offset, size);
        Ok(())
    }
}

/// Serialisable summary of one region for snapshots and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub region: MemoryRegion,
    pub kind: MemoryType,
    pub owner: String,
    pub allocations: Vec<MemoryRegion>,
}

// ═══════════════════════════════════════════════════════════════════════
//  Address space
// ═══════════════════════════════════════════════════════════════════════

/// Typed regions sorted by start address.  Never shrinks.
#[derive(Debug, Default)]
pub struct AddressSpace {
    regions: Vec<TypedMemoryRegion>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regions(&self) -> &[TypedMemoryRegion] {
        &self.regions
    }

    /// Inserts `typed`, keeping the list sorted.
    ///
    /// Fails with [`MemoryError::Conflict`] iff it overlaps a recorded region.
    pub fn add(&mut self, typed: TypedMemoryRegion) -> Result<(), MemoryError> {
        if self.regions.iter().any(|r| r.region.overlaps(&typed.region)) {
            return Err(MemoryError::Conflict {
                start: typed.region.start,
                size: typed.region.size,
            });
        }
        let at = self
            .regions
            .partition_point(|r| r.region.start < typed.region.start);
        self.regions.insert(at, typed);
        Ok(())
    }

    /// Records a page-aligned region for `owner` and maps it through the
    /// platform according to its type.
    ///
    /// A mapping failure is returned but the region stays recorded.
    pub fn reserve(
        &mut self,
        platform: &dyn VmPlatform,
        owner: &str,
        kind: MemoryType,
        start: u64,
        size: u64,
        backing: Option<Backing>,
    ) -> Result<(), MemoryError> {
        if !region::is_page_aligned(start) || !region::is_page_aligned(size) {
            return Err(MemoryError::Unaligned { start, size });
        }
        if let Some(b) = &backing {
            if b.len() as u64 != size {
                return Err(MemoryError::BackingSize {
                    size,
                    backing: b.len() as u64,
                });
            }
        }
        if matches!(kind, MemoryType::User | MemoryType::Acpi) && backing.is_none() {
            return Err(MemoryError::NoBacking { start });
        }

        let mapped = backing.clone();
        self.add(TypedMemoryRegion::new(
            owner,
            kind,
            MemoryRegion::new(start, size),
            backing,
        ))?;
        info!(
            "{owner}: reserved {kind} {}",
            MemoryRegion::new(start, size)
        );

        let result = match (kind, &mapped) {
            (MemoryType::User | MemoryType::Acpi, Some(b)) => platform.map_user_memory(start, b),
            (MemoryType::Special, _) => platform.map_special_memory(start),
            _ => platform.map_reserved_memory(start, size),
        };
        result.map_err(|source| MemoryError::Platform { start, source })
    }

    /// Finds the region of `kind` holding `[addr, addr + size)` and returns
    /// the backing window for that range, if the region is backed.
    ///
    /// With `allocate` the range is also recorded as a sub-allocation and
    /// must not overlap an earlier one.
    pub fn map(
        &mut self,
        kind: MemoryType,
        addr: u64,
        size: u64,
        allocate: bool,
    ) -> Result<Option<Backing>, MemoryError> {
        let wanted = MemoryRegion::new(addr, size);
        let typed = self
            .regions
            .iter_mut()
            .find(|r| r.kind == kind && r.region.contains(&wanted))
            .ok_or(MemoryError::NotFound {
                kind,
                start: addr,
                size,
            })?;

        let offset = addr - typed.region.start;
        if allocate {
            typed.allocate_at(offset, size)?;
        }
        Ok(typed
            .backing
            .as_ref()
            .and_then(|b| b.window(offset as usize, size as usize)))
    }

    /// First-fit sub-allocation of `size` bytes of `kind` memory within
    /// `[start, end)`, probing page by page from the top or the bottom.
    pub fn allocate(
        &mut self,
        kind: MemoryType,
        start: u64,
        end: u64,
        size: u64,
        from_top: bool,
    ) -> Result<(u64, Option<Backing>), MemoryError> {
        // Candidates outside every region of `kind` can never succeed, so
        // only the parts of [start, end) covered by such regions are probed.
        let mut windows: Vec<(u64, u64)> = self
            .regions
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| (r.region.start.max(start), r.region.end().min(end)))
            .filter(|(s, e)| s < e)
            .collect();
        if from_top {
            windows.reverse();
        }

        for (w_start, w_end) in windows {
            for candidate in ProbeCandidates::new(w_start, w_end, size, from_top) {
                match self.map(kind, candidate, size, true) {
                    Ok(backing) => return Ok((candidate, backing)),
                    Err(MemoryError::Conflict { .. } | MemoryError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(MemoryError::NotFound { kind, start, size })
    }

    /// Places `data` in user memory within `[start, end)` and returns its
    /// guest address.
    pub fn load(
        &mut self,
        start: u64,
        end: u64,
        data: &[u8],
        from_top: bool,
    ) -> Result<u64, MemoryError> {
        let (addr, backing) =
            self.allocate(MemoryType::User, start, end, data.len() as u64, from_top)?;
        let backing = backing.ok_or(MemoryError::NoBacking { start: addr })?;
        backing.write_at(0, data)?;
        info!("loaded {} bytes at {addr:#x}", data.len());
        Ok(addr)
    }

    /// Reads guest memory back out of user regions.
    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let backing = self
            .map(MemoryType::User, addr, buf.len() as u64, false)?
            .ok_or(MemoryError::NoBacking { start: addr })?;
        backing.read_at(0, buf)
    }

    /// End of the highest region, or 0 when empty.
    pub fn max(&self) -> u64 {
        self.regions.last().map_or(0, |r| r.region.end())
    }

    /// Free page-aligned gaps inside `[start, end)`.
    pub fn gaps(&self, start: u64, end: u64) -> Vec<MemoryRegion> {
        let occupied: Vec<(u64, u64)> = self
            .regions
            .iter()
            .map(|r| (r.region.start, r.region.size))
            .collect();
        region::gaps(&occupied, start, end)
            .into_iter()
            .map(|(s, l)| MemoryRegion::new(s, l))
            .collect()
    }

    pub fn records(&self) -> Vec<RegionRecord> {
        self.regions
            .iter()
            .map(|r| RegionRecord {
                region: r.region,
                kind: r.kind,
                owner: r.owner.clone(),
                allocations: r.allocations().collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;
    use proptest::prelude::*;

    const PAGE: u64 = region::PAGE_SIZE;

    fn user(space: &mut AddressSpace, platform: &FakePlatform, start: u64, size: u64) {
        let backing = Backing::anonymous(size as usize).unwrap();
        space
            .reserve(platform, "ram", MemoryType::User, start, size, Some(backing))
            .unwrap();
    }

    fn plain(start: u64, size: u64) -> TypedMemoryRegion {
        TypedMemoryRegion::new("test", MemoryType::Reserved, MemoryRegion::new(start, size), None)
    }

    #[test]
    fn add_keeps_regions_sorted() {
        let mut space = AddressSpace::new();
        space.add(plain(0x5000, PAGE)).unwrap();
        space.add(plain(0x1000, PAGE)).unwrap();
        space.add(plain(0x3000, PAGE)).unwrap();
        let starts: Vec<u64> = space.regions().iter().map(|r| r.region.start).collect();
        assert_eq!(starts, vec![0x1000, 0x3000, 0x5000]);
        assert_eq!(space.max(), 0x6000);
    }

    #[test]
    fn empty_space_max_is_zero() {
        assert_eq!(AddressSpace::new().max(), 0);
    }

    #[test]
    fn reserve_rejects_unaligned() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        let err = space
            .reserve(&platform, "bios", MemoryType::Reserved, 0x800, PAGE, None)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Unaligned { .. }));
        let err = space
            .reserve(&platform, "bios", MemoryType::Reserved, 0, 0x800, None)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Unaligned { .. }));
        assert!(space.regions().is_empty());
    }

    #[test]
    fn reserve_maps_by_type() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        user(&mut space, &platform, 0x10_0000, 0x4000);
        space
            .reserve(&platform, "bios", MemoryType::Special, 0xfffb_c000, 0x4000, None)
            .unwrap();
        space
            .reserve(&platform, "bios", MemoryType::Reserved, 0, PAGE, None)
            .unwrap();
        assert_eq!(platform.user_mappings(), vec![(0x10_0000, 0x4000)]);
        assert_eq!(platform.special_mappings(), vec![0xfffb_c000]);
    }

    #[test]
    fn user_reservation_requires_backing() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        let err = space
            .reserve(&platform, "ram", MemoryType::User, 0, PAGE, None)
            .unwrap_err();
        assert!(matches!(err, MemoryError::NoBacking { .. }));
    }

    #[test]
    fn failed_platform_mapping_keeps_region() {
        let platform = FakePlatform::default();
        platform.fail_mappings(true);
        let mut space = AddressSpace::new();
        let err = space
            .reserve(&platform, "bios", MemoryType::Special, 0x10_000, 0x4000, None)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Platform { .. }));
        assert_eq!(space.regions().len(), 1);
    }

    #[test]
    fn map_rejects_overlapping_suballocation() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        user(&mut space, &platform, 0x1000, 4 * PAGE);
        space.map(MemoryType::User, 0x2000, PAGE, true).unwrap();
        let err = space
            .map(MemoryType::User, 0x2800, PAGE, true)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Conflict { .. }));
        // Lookup without allocation still works.
        assert!(space.map(MemoryType::User, 0x2000, PAGE, false).unwrap().is_some());
    }

    #[test]
    fn map_wrong_type_is_not_found() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        user(&mut space, &platform, 0x1000, PAGE);
        let err = space
            .map(MemoryType::Acpi, 0x1000, PAGE, false)
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));
    }

    #[test]
    fn map_of_reserved_region_has_no_data() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        space
            .reserve(&platform, "bios", MemoryType::Reserved, 0, PAGE, None)
            .unwrap();
        assert!(space
            .map(MemoryType::Reserved, 0, PAGE, true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn allocate_from_bottom_in_small_user_region() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        user(&mut space, &platform, 0x1000, 2 * PAGE);

        let (first, _) = space
            .allocate(MemoryType::User, 0, 0x10000, PAGE, false)
            .unwrap();
        assert_eq!(first, 0x1000);
        let (second, _) = space
            .allocate(MemoryType::User, 0, 0x10000, PAGE, false)
            .unwrap();
        assert_eq!(second, 0x2000);
        let err = space
            .allocate(MemoryType::User, 0, 0x10000, PAGE, false)
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));
    }

    #[test]
    fn allocate_from_top_returns_highest_free_page() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        user(&mut space, &platform, 0x1000, 4 * PAGE);
        space.map(MemoryType::User, 0x4000, PAGE, true).unwrap();

        let (addr, backing) = space
            .allocate(MemoryType::User, 0, 0x10000, PAGE, true)
            .unwrap();
        assert_eq!(addr, 0x3000);
        assert_eq!(backing.unwrap().len(), PAGE as usize);
    }

    #[test]
    fn load_copies_into_backing() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        user(&mut space, &platform, 0x10_0000, 4 * PAGE);

        let image = [0xf4u8, 0x90, 0x90];
        let addr = space.load(0x10_0000, space.max(), &image, false).unwrap();
        assert_eq!(addr, 0x10_0000);

        let mut readback = [0u8; 3];
        space.read(addr, &mut readback).unwrap();
        assert_eq!(readback, image);
    }

    #[test]
    fn load_into_unbacked_memory_fails() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        space
            .reserve(&platform, "hole", MemoryType::Reserved, 0, PAGE, None)
            .unwrap();
        let err = space.load(0, PAGE, b"x", false).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));
    }

    #[test]
    fn gaps_skip_reserved_regions() {
        let platform = FakePlatform::default();
        let mut space = AddressSpace::new();
        space
            .reserve(&platform, "bios", MemoryType::Reserved, 0, PAGE, None)
            .unwrap();
        space
            .reserve(&platform, "hole", MemoryType::Reserved, 0x8000, PAGE, None)
            .unwrap();
        assert_eq!(
            space.gaps(0, 0x10000),
            vec![MemoryRegion::new(0x1000, 0x7000), MemoryRegion::new(0x9000, 0x7000)]
        );
    }

    #[test]
    fn backing_windows_share_storage() {
        let backing = Backing::anonymous(2 * PAGE as usize).unwrap();
        let upper = backing.window(PAGE as usize, PAGE as usize).unwrap();
        upper.write_at(0, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        backing.read_at(PAGE as usize, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(upper.host_address(), backing.host_address() + PAGE);
        assert!(backing.window(PAGE as usize, PAGE as usize + 1).is_none());
    }

    proptest! {
        #[test]
        fn add_conflicts_iff_overlap(a in 0u64..64, alen in 1u64..16, b in 0u64..64, blen in 1u64..16) {
            let mut space = AddressSpace::new();
            space.add(plain(a * PAGE, alen * PAGE)).unwrap();
            let result = space.add(plain(b * PAGE, blen * PAGE));
            let overlap = a < b + blen && b < a + alen;
            prop_assert_eq!(result.is_err(), overlap);
            if let Err(e) = result {
                prop_assert!(matches!(e, MemoryError::Conflict { .. }), "unexpected error");
            }
        }

        #[test]
        fn top_down_allocation_is_highest_free_fit(taken in proptest::collection::btree_set(0u64..16, 0..12), pages in 1u64..3) {
            let platform = FakePlatform::default();
            let mut space = AddressSpace::new();
            let base = 0x10_0000;
            let backing = Backing::anonymous((16 * PAGE) as usize).unwrap();
            space.reserve(&platform, "ram", MemoryType::User, base, 16 * PAGE, Some(backing)).unwrap();
            for &p in &taken {
                space.map(MemoryType::User, base + p * PAGE, PAGE, true).unwrap();
            }
            let size = pages * PAGE;
            let free = |p: u64| (p..p + pages).all(|q| q < 16 && !taken.contains(&q));
            let expected = (0..16u64).rev().find(|&p| free(p)).map(|p| base + p * PAGE);
            let result = space.allocate(MemoryType::User, 0, base + 16 * PAGE, size, true);
            match expected {
                Some(addr) => prop_assert_eq!(result.unwrap().0, addr),
                None => prop_assert!(matches!(result, Err(MemoryError::NotFound { .. })), "expected no fit"),
            }
        }
    }
}
