//! Pure address-range arithmetic for guest physical memory.
//!
//! Regions are half-open intervals `[start, start + size)`.  Ends saturate
//! at `u64::MAX` so that a catch-all region `{0, u64::MAX}` is representable
//! without overflow.
//!
//! # Mapping to `memory.rs`
//!
//! | Verified function      | Used by                                      |
//! |------------------------|----------------------------------------------|
//! | [`region_end`]         | `MemoryRegion::end()`                        |
//! | [`overlaps`]           | `AddressSpace::add()`, `AddressSpace::map()` |
//! | [`contains`]           | `AddressSpace::map()`                        |
//! | [`contains_addr`]      | `IoDispatchCache::lookup()`                  |
//! | [`ProbeCandidates`]    | `AddressSpace::allocate()`                   |
//! | [`gaps`]               | `UserMemory::attach()`                       |

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Guest page size.  Reservations and allocations are aligned to it.
pub const PAGE_SIZE: u64 = 0x1000;

/// First guest physical address above the 32-bit space.
pub const FOUR_GIB: u64 = 0x1_0000_0000;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(FOUR_GIB % PAGE_SIZE == 0);

// ═══════════════════════════════════════════════════════════════════════
//  Alignment
// ═══════════════════════════════════════════════════════════════════════

/// Returns `true` if `value` is a multiple of [`PAGE_SIZE`].
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Rounds `addr` down to the start of its page.
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary, or `None` on overflow.
pub const fn page_align_up(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(page_align_down(v)),
        None => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Interval predicates
// ═══════════════════════════════════════════════════════════════════════

/// Exclusive end of `[start, start + size)`, saturating at `u64::MAX`.
pub const fn region_end(start: u64, size: u64) -> u64 {
    start.saturating_add(size)
}

/// Returns `true` if the two half-open intervals share at least one address.
///
/// Symmetric in its arguments.  Empty intervals overlap nothing.
pub const fn overlaps(a_start: u64, a_size: u64, b_start: u64, b_size: u64) -> bool {
    if a_size == 0 || b_size == 0 {
        return false;
    }
    a_start < region_end(b_start, b_size) && b_start < region_end(a_start, a_size)
}

/// Returns `true` if `[start, start + size)` lies entirely inside the outer
/// interval.
pub const fn contains(outer_start: u64, outer_size: u64, start: u64, size: u64) -> bool {
    start >= outer_start && region_end(start, size) <= region_end(outer_start, outer_size)
}

/// Returns `true` if `addr` lies inside `[start, start + size)`.
pub const fn contains_addr(start: u64, size: u64, addr: u64) -> bool {
    addr >= start && addr < region_end(start, size)
}

// ═══════════════════════════════════════════════════════════════════════
//  Allocation probing
// ═══════════════════════════════════════════════════════════════════════

/// Page-aligned candidate addresses for an allocation of `size` bytes
/// inside `[start, end)`.
///
/// Every yielded `addr` satisfies `addr >= start`, `addr + size <= end` and
/// `is_page_aligned(addr)`.  With `from_top` the candidates are yielded in
/// strictly descending order starting from the highest one, otherwise in
/// strictly ascending order from the lowest.
#[derive(Debug, Clone)]
pub struct ProbeCandidates {
    next: Option<u64>,
    start: u64,
    end: u64,
    size: u64,
    from_top: bool,
}

impl ProbeCandidates {
    pub fn new(start: u64, end: u64, size: u64, from_top: bool) -> Self {
        let first = if size == 0 || end < start || end - start < size {
            None
        } else if from_top {
            Some(page_align_down(end - size)).filter(|&a| a >= start)
        } else {
            page_align_up(start).filter(|&a| a.checked_add(size).is_some_and(|e| e <= end))
        };
        Self {
            next: first,
            start,
            end,
            size,
            from_top,
        }
    }
}

impl Iterator for ProbeCandidates {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let current = self.next?;
        self.next = if self.from_top {
            current
                .checked_sub(PAGE_SIZE)
                .filter(|&a| a >= self.start)
        } else {
            current
                .checked_add(PAGE_SIZE)
                .filter(|&a| a.checked_add(self.size).is_some_and(|e| e <= self.end))
        };
        debug_assert!(is_page_aligned(current));
        Some(current)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Gap search
// ═══════════════════════════════════════════════════════════════════════

/// Free page-aligned gaps inside `[start, end)` given a list of occupied
/// `(start, size)` intervals sorted by start.
///
/// Returned gaps are `(start, size)` pairs in ascending order.  Partial
/// pages adjoining an occupied interval are excluded.
pub fn gaps(occupied: &[(u64, u64)], start: u64, end: u64) -> Vec<(u64, u64)> {
    debug_assert!(occupied.windows(2).all(|w| w[0].0 <= w[1].0));

    let mut result = Vec::new();
    let mut cursor = start;
    for &(o_start, o_size) in occupied {
        if cursor >= end {
            break;
        }
        if o_start > cursor {
            push_gap(&mut result, cursor, o_start.min(end));
        }
        cursor = cursor.max(region_end(o_start, o_size));
    }
    if cursor < end {
        push_gap(&mut result, cursor, end);
    }
    result
}

fn push_gap(out: &mut Vec<(u64, u64)>, from: u64, to: u64) {
    let Some(aligned) = page_align_up(from) else {
        return;
    };
    let top = page_align_down(to);
    if top > aligned {
        out.push((aligned, top - aligned));
    }
}
