//! Pure helpers for guest I/O values.
//!
//! Guest PIO and MMIO accesses are 1, 2, 4 or 8 bytes wide.  Values crossing
//! the device boundary are always masked to the access width: writes before
//! they reach the device, reads after they leave it.

/// Value returned for reads that hit no device.
pub const INVALID_READ: u64 = u64::MAX;

/// Returns `true` for the access widths a guest can issue.
pub const fn is_valid_access_size(size: u8) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
}

/// Bit mask covering the low `size` bytes.
///
/// Sizes of 8 and above select the full 64-bit mask.
pub const fn width_mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size as u32 * 8)) - 1
    }
}

/// Masks `value` to the access width.
///
/// Idempotent: `normalize(normalize(x, n), n) == normalize(x, n)`.
pub const fn normalize(value: u64, size: u8) -> u64 {
    value & width_mask(size)
}

/// Decodes a little-endian guest data buffer (at most 8 bytes).
pub fn value_from_le(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    let mut raw = [0u8; 8];
    let n = bytes.len().min(8);
    raw[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(raw)
}

/// Encodes `value` little-endian into the guest data buffer.
pub fn value_to_le(value: u64, out: &mut [u8]) {
    let raw = value.to_le_bytes();
    let n = out.len().min(8);
    out[..n].copy_from_slice(&raw[..n]);
}

/// Reads `size` bytes at byte `offset` from a register holding `reg`.
///
/// Bytes beyond the 8-byte register read as zero.
pub const fn register_extract(reg: u64, offset: u64, size: u8) -> u64 {
    if offset >= 8 {
        return 0;
    }
    normalize(reg >> (offset * 8), size)
}

/// Writes `size` bytes of `value` at byte `offset` into a register holding
/// `reg`, leaving the other bytes untouched.
pub const fn register_merge(reg: u64, offset: u64, size: u8, value: u64) -> u64 {
    if offset >= 8 {
        return reg;
    }
    let shift = offset * 8;
    let mask = width_mask(size) << shift;
    (reg & !mask) | ((normalize(value, size) << shift) & mask)
}
