//! Shared memory region and vring layout.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Vring 0 (master rx / remote tx)                                     │
//! │    - Descriptors (num × 16 bytes)                                    │
//! │    - Avail ring (flags, idx, ring[num], used_event)                  │
//! │    - pad to vring_align                                              │
//! │    - Used ring (flags, idx, ring[num] × 8 bytes, avail_event)        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Vring 1 (master tx / remote rx), same shape                         │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Buffer arena                                                        │
//! │    - master rx buffers (num × buffer_size)                           │
//! │    - master tx buffers (num × buffer_size)                           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Vring 1 starts one word-aligned `vring_size` after vring 0, and alignment
//! is measured from the region base. Every multi-byte field is little-endian.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::ShmConfig;

/// Size of one vring descriptor.
pub const DESC_SIZE: usize = 16;
/// Size of one used-ring element.
pub const USED_ELEM_SIZE: usize = 8;

/// Alignment of regions allocated by [`SharedMemory::new`].
const REGION_ALIGN: usize = 64;

// =============================================================================
// Shared memory region
// =============================================================================

/// A memory region both sides of a link can see.
///
/// Control fields are only ever touched through atomics. Buffer contents are
/// touched with plain copies, and only by the side that currently owns the
/// buffer's descriptor.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    len: usize,
    /// Set when we allocated the region ourselves.
    owned: Option<Layout>,
}

// SAFETY: SharedMemory points to memory that is synchronized via atomics and
// descriptor ownership.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Allocate a zeroed region on the heap.
    ///
    /// Used when both sides of a link live in one process.
    pub fn new(len: usize) -> Result<Arc<Self>, LayoutError> {
        if len == 0 {
            return Err(LayoutError::Empty);
        }
        let layout =
            Layout::from_size_align(len, REGION_ALIGN).map_err(|_| LayoutError::Overflow)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(LayoutError::AllocationFailed { len })?;
        Ok(Arc::new(Self {
            ptr,
            len,
            owned: Some(layout),
        }))
    }

    /// Wrap a region reserved by the platform.
    ///
    /// # Safety
    ///
    /// - `ptr` must be valid for reads and writes of `len` bytes for as long
    ///   as the returned value lives.
    /// - Nothing but this link (and its peer) may touch the region.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Result<Arc<Self>, LayoutError> {
        let ptr = NonNull::new(ptr).ok_or(LayoutError::Null)?;
        if ptr.as_ptr() as usize % 4 != 0 {
            return Err(LayoutError::Misaligned {
                addr: ptr.as_ptr() as usize,
            });
        }
        if len == 0 {
            return Err(LayoutError::Empty);
        }
        Ok(Arc::new(Self {
            ptr,
            len,
            owned: None,
        }))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whether `[offset, offset + len)` lies inside the region.
    #[inline]
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }

    #[inline]
    fn atomic_u16(&self, offset: usize) -> &AtomicU16 {
        assert!(self.contains(offset, 2) && offset % 2 == 0, "u16 field out of bounds");
        // SAFETY: in bounds and 2-aligned (region base is at least 4-aligned).
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU16) }
    }

    #[inline]
    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(self.contains(offset, 4) && offset % 4 == 0, "u32 field out of bounds");
        // SAFETY: in bounds and 4-aligned (region base is at least 4-aligned).
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU32) }
    }

    #[inline]
    pub(crate) fn load_u16(&self, offset: usize) -> u16 {
        u16::from_le(self.atomic_u16(offset).load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn store_u16(&self, offset: usize, value: u16) {
        self.atomic_u16(offset).store(value.to_le(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn load_u32(&self, offset: usize) -> u32 {
        u32::from_le(self.atomic_u32(offset).load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn store_u32(&self, offset: usize, value: u32) {
        self.atomic_u32(offset).store(value.to_le(), Ordering::Release);
    }

    /// Borrow bytes of the region.
    ///
    /// # Safety
    ///
    /// The caller must own the bytes (hold the descriptor of the buffer they
    /// belong to) so that nobody writes them during the borrow.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(self.contains(offset, len), "slice out of bounds");
        // SAFETY: bounds checked above; exclusivity guaranteed by the caller.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// Mutably borrow bytes of the region.
    ///
    /// # Safety
    ///
    /// The caller must own the bytes exclusively for the borrow's lifetime.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(self.contains(offset, len), "slice out of bounds");
        // SAFETY: bounds checked above; exclusivity guaranteed by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) }
    }

    /// Zero bytes of the region.
    ///
    /// # Safety
    ///
    /// Nobody else may access the bytes while this runs.
    pub(crate) unsafe fn zero(&self, offset: usize, len: usize) {
        assert!(self.contains(offset, len), "zero out of bounds");
        // SAFETY: bounds checked above; exclusivity guaranteed by the caller.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr().add(offset), 0, len) }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Some(layout) = self.owned {
            // SAFETY: allocated in `new` with this exact layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("owned", &self.owned.is_some())
            .finish()
    }
}

// =============================================================================
// Vring layout
// =============================================================================

/// Bytes one split vring occupies for `num` descriptors at `align`.
pub fn vring_size(num: u16, align: usize) -> usize {
    let num = num as usize;
    let avail_end = DESC_SIZE * num + 2 * (3 + num);
    align_up(avail_end, align) + 2 * 3 + USED_ELEM_SIZE * num
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Offsets of one vring's fields, from the region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VringLayout {
    pub num: u16,
    pub desc: usize,
    pub avail: usize,
    pub used: usize,
    /// One past the last byte of the used ring.
    pub end: usize,
}

impl VringLayout {
    fn at(base: usize, num: u16, align: usize) -> Self {
        let n = num as usize;
        let desc = base;
        let avail = desc + DESC_SIZE * n;
        let used = align_up(avail + 2 * (3 + n), align);
        let end = used + 2 * 3 + USED_ELEM_SIZE * n;
        Self {
            num,
            desc,
            avail,
            used,
            end,
        }
    }

    #[inline]
    pub fn desc(&self, idx: u16) -> usize {
        self.desc + DESC_SIZE * idx as usize
    }

    #[inline]
    pub fn avail_flags(&self) -> usize {
        self.avail
    }

    #[inline]
    pub fn avail_idx(&self) -> usize {
        self.avail + 2
    }

    #[inline]
    pub fn avail_ring(&self, slot: u16) -> usize {
        self.avail + 4 + 2 * slot as usize
    }

    #[inline]
    pub fn used_flags(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn used_idx(&self) -> usize {
        self.used + 2
    }

    #[inline]
    pub fn used_elem(&self, slot: u16) -> usize {
        self.used + 4 + USED_ELEM_SIZE * slot as usize
    }

    /// Bytes from the descriptor table to the end of the used ring.
    #[inline]
    pub fn span(&self) -> usize {
        self.end - self.desc
    }
}

/// Where everything lives in a region built from a [`ShmConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub vrings: [VringLayout; 2],
    /// Offset of the first buffer.
    pub arena: usize,
    pub buffer_size: usize,
    pub buffer_count: u16,
    pub total_size: usize,
}

impl RegionLayout {
    /// Calculate the layout for `config`.
    pub fn calculate(config: &ShmConfig) -> Result<Self, LayoutError> {
        let num = config.buffer_count;
        let align = config.vring_align;

        let stride = align_up(vring_size(num, align), 4);
        let vring0 = VringLayout::at(0, num, align);
        let vring1 = VringLayout::at(stride, num, align);

        // Vring 1's used ring can spill past 2 * stride when the alignment is
        // small next to the ring; keep the arena clear of it.
        let arena = (2 * stride).max(align_up(vring1.end, 4));

        let buffer_size = config.buffer_size();
        let buffers_total = buffer_size
            .checked_mul(2 * num as usize)
            .ok_or(LayoutError::Overflow)?;
        let total_size = arena
            .checked_add(buffers_total)
            .ok_or(LayoutError::Overflow)?;

        Ok(Self {
            vrings: [vring0, vring1],
            arena,
            buffer_size,
            buffer_count: num,
            total_size,
        })
    }

    /// Offset of buffer `n` in the arena (master rx first, then master tx).
    #[inline]
    pub fn buffer(&self, n: usize) -> usize {
        self.arena + n * self.buffer_size
    }

    /// Bytes of the arena.
    #[inline]
    pub fn arena_size(&self) -> usize {
        self.total_size - self.arena
    }

    /// Check that a region of `len` bytes can hold this layout.
    pub fn check_fits(&self, len: usize) -> Result<(), LayoutError> {
        if len < self.total_size {
            return Err(LayoutError::RegionTooSmall {
                required: self.total_size,
                found: len,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from region setup and layout calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Zero-length region.
    Empty,
    /// Null base pointer.
    Null,
    /// Base pointer not word aligned.
    Misaligned { addr: usize },
    /// Heap allocation failed.
    AllocationFailed { len: usize },
    /// Size arithmetic overflowed.
    Overflow,
    /// Region smaller than the layout.
    RegionTooSmall { required: usize, found: usize },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "shared memory region is empty"),
            Self::Null => write!(f, "shared memory base is null"),
            Self::Misaligned { addr } => {
                write!(f, "shared memory base {:#x} is not word aligned", addr)
            }
            Self::AllocationFailed { len } => {
                write!(f, "failed to allocate {} bytes of shared memory", len)
            }
            Self::Overflow => write!(f, "shared memory size overflow"),
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small: need {} bytes, got {}", required, found)
            }
        }
    }
}

impl std::error::Error for LayoutError {}
