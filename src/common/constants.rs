//! Protocol and emulator constants.

/// Size of a CXL.cache / CXL.mem data line in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Number of low address bits covered by one cache line.
pub const CACHE_LINE_SHIFT: u32 = 6;

/// Largest device or host memory the emulator backs with RAM (1 GiB).
pub const MAX_MEMORY_SIZE: u64 = 1 << 30;

/// Default flit capacity in bytes.
pub const DEFAULT_FLIT_SIZE: usize = 256;

/// Smallest flit capacity accepted by the topology validator.
pub const MIN_FLIT_SIZE: usize = 64;

/// Largest flit capacity accepted by the topology validator.
pub const MAX_FLIT_SIZE: usize = 4096;

/// Size of the transport frame length prefix in bytes.
pub const FRAME_LEN_PREFIX: usize = 4;

/// Width of the physical address carried by CXL.mem and CXL.cache (bits).
pub const PHYS_ADDR_BITS: u32 = 52;

/// Tag space sizes per protocol.
pub const IO_TAG_BITS: u32 = 10;
pub const MEM_TAG_BITS: u32 = 16;
pub const CACHE_TAG_BITS: u32 = 12;

/// Size of a device configuration space in bytes.
pub const CONFIG_SPACE_SIZE: usize = 4096;

/// Default size of a device MMIO register window in bytes.
pub const MMIO_WINDOW_SIZE: u64 = 4096;

/// Vendor id reported by emulated devices.
pub const EMULATED_VENDOR_ID: u16 = 0x1e98;
