//! Pure PCI configuration mechanism #1 arithmetic.

/// Configuration-address port.
pub const CONFIG_ADDRESS_PORT: u64 = 0xcf8;
/// Configuration-data port.
pub const CONFIG_DATA_PORT: u64 = 0xcfc;

/// Offset of the first base address register in the configuration header.
pub const BAR0_OFFSET: u64 = 0x10;
/// Number of BARs in a type-0 header.
pub const BAR_COUNT: usize = 6;
/// Size of the configuration space exposed per function.
pub const CONFIG_SPACE_SIZE: usize = 0x100;

/// BAR flag bits: memory space, 32-bit, prefetchable.
pub const BAR_MEMORY_PREFETCH: u32 = 0x8;

/// Start of the 32-bit PCI memory hole.
pub const PCI_HOLE_START: u64 = 0xf000_0000;
/// IOAPIC base; the PCI hole ends here.
pub const IOAPIC_BASE: u64 = 0xfec0_0000;

const _: () = assert!(PCI_HOLE_START < IOAPIC_BASE);
const _: () = assert!(BAR0_OFFSET + 4 * BAR_COUNT as u64 <= 0x28);

/// A decoded configuration address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigAddress {
    pub enabled: bool,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    /// Dword-aligned register offset.
    pub register: u8,
}

/// Decodes the value latched in the configuration-address port.
pub const fn decode_config_address(value: u32) -> ConfigAddress {
    ConfigAddress {
        enabled: value & 0x8000_0000 != 0,
        bus: ((value >> 16) & 0xff) as u8,
        device: ((value >> 11) & 0x1f) as u8,
        function: ((value >> 8) & 0x7) as u8,
        register: (value & 0xfc) as u8,
    }
}

/// Encodes a configuration address with the enable bit set.
pub const fn encode_config_address(bus: u8, device: u8, function: u8, register: u8) -> u32 {
    0x8000_0000
        | (bus as u32) << 16
        | ((device as u32) & 0x1f) << 11
        | ((function as u32) & 0x7) << 8
        | (register as u32 & 0xfc)
}

/// BAR index for a configuration offset, if the offset falls in a BAR.
pub const fn bar_index(offset: u64) -> Option<usize> {
    if offset >= BAR0_OFFSET && offset < BAR0_OFFSET + 4 * BAR_COUNT as u64 {
        Some(((offset - BAR0_OFFSET) / 4) as usize)
    } else {
        None
    }
}

/// Register value after the guest writes `written` to a BAR of `size`
/// bytes.  `size` must be a power of two of at least 16 bytes.
///
/// Address bits below the BAR size read back as zero, which is how the
/// guest discovers the size by writing all ones.
pub const fn bar_value(written: u32, size: u32) -> u32 {
    (written & !(size - 1) & !0xf) | BAR_MEMORY_PREFETCH
}

/// Guest physical base address encoded in a BAR register.
pub const fn bar_address(value: u32) -> u64 {
    (value & !0xf) as u64
}
