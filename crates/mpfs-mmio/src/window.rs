use core::ptr::NonNull;

use crate::RegisterBlock;

/// A volatile view over a memory-mapped register aperture.
#[derive(Debug)]
pub struct MmioWindow {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: `MmioWindow` only performs volatile 32-bit accesses to device memory. Concurrent
// accesses from several contexts are individually atomic at the bus level; read-modify-write
// sequences are serialized by the driver holding the window.
unsafe impl Send for MmioWindow {}
unsafe impl Sync for MmioWindow {}

impl MmioWindow {
    /// Creates a window over `len` bytes of device memory starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapped device aperture of at least `len` bytes that stays mapped
    /// for the lifetime of the returned value, and must be 4-byte aligned. No other code may
    /// treat that range as ordinary memory.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % 4, 0, "unaligned MMIO base");
        Self { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn reg(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "MMIO offset {offset:#x} outside window of {:#x} bytes",
            self.len
        );
        // SAFETY: bounds were checked above and the constructor guarantees the mapping.
        unsafe { self.base.as_ptr().add(offset).cast::<u32>() }
    }
}

impl RegisterBlock for MmioWindow {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `reg` returns an in-bounds, aligned pointer into the mapped aperture.
        unsafe { self.reg(offset).read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: see `read32`.
        unsafe { self.reg(offset).write_volatile(value) }
    }
}
