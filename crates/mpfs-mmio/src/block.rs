use std::sync::Arc;

/// A block of 32-bit registers addressed by byte offset.
///
/// Accesses take `&self`: MMIO has no Rust-visible aliasing rules, and callers that need
/// read-modify-write atomicity across lines are expected to hold their own lock.
pub trait RegisterBlock {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);

    fn modify32<F>(&self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
        Self: Sized,
    {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }

    fn set_bits(&self, offset: usize, bits: u32) {
        let value = self.read32(offset);
        self.write32(offset, value | bits);
    }

    fn clear_bits(&self, offset: usize, bits: u32) {
        let value = self.read32(offset);
        self.write32(offset, value & !bits);
    }
}

impl<T: RegisterBlock + ?Sized> RegisterBlock for &T {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

impl<T: RegisterBlock + ?Sized> RegisterBlock for Arc<T> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Rebases every access to an inner block by a fixed byte offset.
///
/// Used when several logical register blocks share one physical mapping, e.g. a bridge
/// and its control block living at fixed offsets inside a single APB aperture.
#[derive(Debug, Clone)]
pub struct OffsetBlock<R> {
    inner: R,
    base: usize,
}

impl<R: RegisterBlock> OffsetBlock<R> {
    pub fn new(inner: R, base: usize) -> Self {
        Self { inner, base }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: RegisterBlock> RegisterBlock for OffsetBlock<R> {
    fn read32(&self, offset: usize) -> u32 {
        self.inner.read32(self.base + offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.inner.write32(self.base + offset, value)
    }
}
