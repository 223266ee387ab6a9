#![allow(clippy::cast_possible_truncation)]

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};

/// A bounds-checked view of memory shared with the GPU.
///
/// All access is volatile. Reads are followed by an acquire fence and writes are
/// preceded by a release fence, so host stores that precede a doorbell write are
/// visible before the GPU is told to look. The view is neither `Send` nor `Sync`,
/// and borrows whatever owns the mapping for `'a`.
#[derive(Debug)]
pub struct MmioRegion<'a> {
    base: NonNull<u8>,
    len: usize,
    _mapping: PhantomData<&'a [u8]>,
}

impl MmioRegion<'_> {
    /// # Safety
    /// `base..base + len` must stay mapped read-write for the lifetime of the view
    /// and must not be accessed through ordinary references meanwhile.
    #[must_use]
    pub const unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            _mapping: PhantomData,
        }
    }

    /// Returns `None` for a null `addr`.
    ///
    /// # Safety
    /// See [`MmioRegion::new`].
    #[must_use]
    pub unsafe fn from_addr(addr: u64, len: usize) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(|base| unsafe { Self::new(base, len) })
    }

    #[must_use]
    pub fn addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-view of `len` bytes at `offset`.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> MmioRegion<'_> {
        self.check(offset, len);
        unsafe { MmioRegion::new(self.base.add(offset), len) }
    }

    /// # Panics
    /// Panics if `offset..offset + 4` is out of bounds or `offset` is unaligned.
    #[must_use]
    pub fn read32(&self, offset: usize) -> u32 {
        let value = unsafe { self.ptr::<u32>(offset).read_volatile() };
        fence(Ordering::Acquire);
        value
    }

    /// # Panics
    /// Panics if `offset..offset + 8` is out of bounds or `offset` is unaligned.
    #[must_use]
    pub fn read64(&self, offset: usize) -> u64 {
        let value = unsafe { self.ptr::<u64>(offset).read_volatile() };
        fence(Ordering::Acquire);
        value
    }

    /// # Panics
    /// Panics if `offset..offset + 4` is out of bounds or `offset` is unaligned.
    pub fn write32(&self, offset: usize, value: u32) {
        fence(Ordering::Release);
        unsafe { self.ptr::<u32>(offset).write_volatile(value) };
    }

    /// # Panics
    /// Panics if `offset..offset + 8` is out of bounds or `offset` is unaligned.
    pub fn write64(&self, offset: usize, value: u64) {
        fence(Ordering::Release);
        unsafe { self.ptr::<u64>(offset).write_volatile(value) };
    }

    /// Copies `bytes` in at `offset`, one volatile byte at a time.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        self.check(offset, bytes.len());
        fence(Ordering::Release);
        for (i, byte) in bytes.iter().enumerate() {
            unsafe { self.base.as_ptr().add(offset + i).write_volatile(*byte) };
        }
    }

    /// Copies `out.len()` bytes out from `offset`.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        self.check(offset, out.len());
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = unsafe { self.base.as_ptr().add(offset + i).read_volatile() };
        }
        fence(Ordering::Acquire);
    }

    /// Zeroes `len` bytes at `offset`.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub fn fill_zero(&self, offset: usize, len: usize) {
        self.check(offset, len);
        fence(Ordering::Release);
        for i in 0..len {
            unsafe { self.base.as_ptr().add(offset + i).write_volatile(0) };
        }
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "MMIO access 0x{offset:x}+0x{len:x} outside region of 0x{:x} bytes",
            self.len
        );
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        self.check(offset, size_of::<T>());
        assert!(
            offset % align_of::<T>() == 0,
            "unaligned MMIO access at 0x{offset:x}"
        );
        unsafe { self.base.as_ptr().add(offset).cast() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(words: &mut [u64]) -> MmioRegion<'_> {
        let len = words.len() * 8;
        let base = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { MmioRegion::new(base, len) }
    }

    #[test]
    fn scalar_access_is_little_endian() {
        let mut backing = [0u64; 4];
        let mmio = region(&mut backing);
        mmio.write64(8, 0x1122_3344_5566_7788);
        assert_eq!(mmio.read32(8), 0x5566_7788);
        assert_eq!(mmio.read32(12), 0x1122_3344);
        mmio.write32(0, 0xdead_beef);
        assert_eq!(mmio.read64(0), 0xdead_beef);
    }

    #[test]
    fn byte_copies_and_fill() {
        let mut backing = [0u64; 2];
        let mmio = region(&mut backing);
        mmio.write_bytes(3, &[1, 2, 3]);
        let mut out = [0u8; 5];
        mmio.read_bytes(2, &mut out);
        assert_eq!(out, [0, 1, 2, 3, 0]);
        mmio.fill_zero(0, 16);
        assert_eq!(mmio.read64(0), 0);
    }

    #[test]
    fn fill_zero_clears_only_its_range() {
        let mut backing = [u64::MAX; 3];
        let mmio = region(&mut backing);
        mmio.fill_zero(4, 12);
        assert_eq!(mmio.read32(0), u32::MAX);
        assert_eq!(mmio.read32(4), 0);
        assert_eq!(mmio.read64(8), 0);
        assert_eq!(mmio.read64(16), u64::MAX);
    }

    #[test]
    fn slices_are_relative() {
        let mut backing = [0u64; 4];
        let mmio = region(&mut backing);
        let tail = mmio.slice(16, 16);
        tail.write32(4, 7);
        assert_eq!(mmio.read32(20), 7);
        assert_eq!(tail.addr(), mmio.addr() + 16);
    }

    #[test]
    #[should_panic(expected = "outside region")]
    fn out_of_bounds_panics() {
        let mut backing = [0u64; 1];
        let mmio = region(&mut backing);
        let _ = mmio.read64(4);
    }
}
