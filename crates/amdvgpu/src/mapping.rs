//! CPU mappings of shared blobs.
//!
//! Memory behind a [`BlobMapping`] is concurrently written by the host, so every access is a
//! volatile read or write through a raw pointer and every access is bounds-checked.

use std::alloc::{self, Layout};
use std::sync::Arc;

use crate::error::MappingError;

/// Backing store of a mapping. Dropping it tears the mapping down.
pub trait MappedRegion: Send + Sync {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

pub struct BlobMapping {
    region: Box<dyn MappedRegion>,
}

impl std::fmt::Debug for BlobMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobMapping")
            .field("addr", &self.addr())
            .field("len", &self.len())
            .finish()
    }
}

impl BlobMapping {
    pub fn new(region: Box<dyn MappedRegion>) -> Self {
        Self { region }
    }

    pub fn addr(&self) -> usize {
        self.region.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<*mut u8, MappingError> {
        let size = self.len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(self.region.as_ptr().wrapping_add(offset)),
            _ => Err(MappingError::OutOfBounds { offset, len, size }),
        }
    }

    fn check_aligned(&self, offset: usize, len: usize) -> Result<*mut u8, MappingError> {
        let ptr = self.check(offset, len)?;
        if (ptr as usize) % len != 0 {
            return Err(MappingError::Misaligned {
                offset,
                alignment: len,
            });
        }
        Ok(ptr)
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), MappingError> {
        let ptr = self.check(offset, out.len())?;
        for (i, b) in out.iter_mut().enumerate() {
            // SAFETY: `check` proved `offset + out.len()` lies inside the live region.
            *b = unsafe { ptr.add(i).read_volatile() };
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), MappingError> {
        let ptr = self.check(offset, data.len())?;
        for (i, b) in data.iter().enumerate() {
            // SAFETY: see `read_bytes`.
            unsafe { ptr.add(i).write_volatile(*b) };
        }
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<(), MappingError> {
        let ptr = self.check(offset, len)?;
        for i in 0..len {
            // SAFETY: see `read_bytes`.
            unsafe { ptr.add(i).write_volatile(value) };
        }
        Ok(())
    }

    /// Single aligned volatile load; `offset` must be 4-byte aligned in the mapping.
    pub fn read_u32_le(&self, offset: usize) -> Result<u32, MappingError> {
        let ptr = self.check_aligned(offset, 4)?;
        // SAFETY: in bounds and aligned.
        let v = unsafe { (ptr as *const u32).read_volatile() };
        Ok(u32::from_le(v))
    }

    pub fn write_u32_le(&self, offset: usize, v: u32) -> Result<(), MappingError> {
        let ptr = self.check_aligned(offset, 4)?;
        // SAFETY: in bounds and aligned.
        unsafe { (ptr as *mut u32).write_volatile(v.to_le()) };
        Ok(())
    }

    pub fn read_u64_le(&self, offset: usize) -> Result<u64, MappingError> {
        let ptr = self.check_aligned(offset, 8)?;
        // SAFETY: in bounds and aligned.
        let v = unsafe { (ptr as *const u64).read_volatile() };
        Ok(u64::from_le(v))
    }

    pub fn write_u64_le(&self, offset: usize, v: u64) -> Result<(), MappingError> {
        let ptr = self.check_aligned(offset, 8)?;
        // SAFETY: in bounds and aligned.
        unsafe { (ptr as *mut u64).write_volatile(v.to_le()) };
        Ok(())
    }
}

/// Zeroed, page-aligned heap memory that can be mapped more than once.
///
/// Used by the loopback host; both sides keep an `Arc` and see the same bytes.
pub struct HeapBacking {
    data_ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for HeapBacking {}
unsafe impl Sync for HeapBacking {}

impl HeapBacking {
    /// Returns `None` if the size/alignment pair is invalid or the allocation fails.
    pub fn new(len: usize, align: usize) -> Option<Arc<Self>> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, align).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let data_ptr = unsafe { alloc::alloc_zeroed(layout) };
        if data_ptr.is_null() {
            return None;
        }
        Some(Arc::new(Self { data_ptr, layout }))
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HeapBacking {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.data_ptr, self.layout) };
    }
}

/// A window onto a [`HeapBacking`].
pub struct HeapRegion {
    backing: Arc<HeapBacking>,
    len: usize,
}

impl HeapRegion {
    /// Maps the first `len` bytes of `backing`; `None` if `len` exceeds it.
    pub fn new(backing: Arc<HeapBacking>, len: usize) -> Option<Self> {
        (len <= backing.len()).then_some(Self { backing, len })
    }
}

impl MappedRegion for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.backing.data_ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}
