//! Timed message buffers.
//!
//! A buffer is a single heap block holding a small header (timestamp, payload size,
//! reference count) followed by the payload. External writers fill a [`WriteBuffer`];
//! once written it becomes a [`BufferHandle`] that is fanned out to every reading
//! fiber of a group without copying. The reference count is stamped once at fan-out
//! and each fiber releases its handle when it drops the input head.

use crate::error::{Result, SimError};
use crate::time::Timepoint;
use std::alloc::{Layout, alloc, dealloc};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

/// Written into the timestamp slot at allocation; replaced when the buffer is published.
pub(crate) const UNSTAMPED: Timepoint = 0xdead_beef;

/// Largest payload a buffer can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[repr(C)]
struct Header {
    timestamp: Timepoint,
    capacity: u16,
    size: u16,
    refcount: AtomicU8,
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

fn layout_for(capacity: usize) -> Layout {
    // capacity <= u16::MAX so this never overflows
    Layout::from_size_align(HEADER_SIZE + capacity, std::mem::align_of::<Header>())
        .unwrap_or_else(|_| Layout::new::<Header>())
}

fn allocate(capacity: usize) -> Result<NonNull<Header>> {
    if capacity > MAX_PAYLOAD {
        return Err(SimError::Invalid);
    }
    let ptr = unsafe { alloc(layout_for(capacity)) } as *mut Header;
    let header = NonNull::new(ptr).ok_or(SimError::Alloc)?;
    unsafe {
        header.as_ptr().write(Header {
            timestamp: UNSTAMPED,
            capacity: capacity as u16,
            size: 0,
            refcount: AtomicU8::new(0),
        });
    }
    Ok(header)
}

/// # Safety
///
/// `header` must come from `allocate` and must not be used afterwards.
unsafe fn free_block(header: NonNull<Header>) {
    unsafe {
        let capacity = header.as_ref().capacity as usize;
        dealloc(header.as_ptr() as *mut u8, layout_for(capacity));
    }
}

fn payload_ptr(header: NonNull<Header>) -> *mut u8 {
    unsafe { (header.as_ptr() as *mut u8).add(HEADER_SIZE) }
}

/// A buffer owned by an external writer, not yet published to a group.
///
/// Dereferences to the full capacity. Dropping it frees the allocation.
pub struct WriteBuffer {
    header: NonNull<Header>,
}

unsafe impl Send for WriteBuffer {}

impl WriteBuffer {
    /// Allocates a buffer able to hold `capacity` payload bytes.
    pub fn alloc(capacity: usize) -> Result<Self> {
        Ok(Self {
            header: allocate(capacity)?,
        })
    }

    /// Allocates a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut buf = Self::alloc(bytes.len())?;
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    pub fn capacity(&self) -> usize {
        unsafe { self.header.as_ref().capacity as usize }
    }

    /// Stamps timestamp and payload size and hands the block over to the channel side.
    pub(crate) fn publish(self, size: usize, timestamp: Timepoint) -> Result<BufferHandle> {
        if size > self.capacity() {
            return Err(SimError::Invalid);
        }
        let header = self.header;
        std::mem::forget(self);
        unsafe {
            let h = &mut *header.as_ptr();
            debug_assert_eq!(h.timestamp, UNSTAMPED, "write buffer was already published");
            h.timestamp = timestamp;
            h.size = size as u16;
        }
        Ok(BufferHandle { header })
    }
}

impl Deref for WriteBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(payload_ptr(self.header), self.capacity()) }
    }
}

impl DerefMut for WriteBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(payload_ptr(self.header), self.capacity()) }
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        unsafe { free_block(self.header) }
    }
}

/// Shared, immutable view of a published buffer.
///
/// Not `Clone`: extra handles are only minted by fan-out, which stamps the
/// reference count to the exact number of handles it creates. Dropping a
/// handle releases one reader.
pub(crate) struct BufferHandle {
    header: NonNull<Header>,
}

unsafe impl Send for BufferHandle {}

impl BufferHandle {
    fn header(&self) -> &Header {
        unsafe { self.header.as_ref() }
    }

    pub fn timestamp(&self) -> Timepoint {
        self.header().timestamp
    }

    pub fn payload_size(&self) -> usize {
        self.header().size as usize
    }

    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(payload_ptr(self.header), self.payload_size()) }
    }

    pub fn refcount(&self) -> u8 {
        self.header().refcount.load(Ordering::Acquire)
    }

    /// Sets the number of readers and returns that many handles to the same block.
    /// `readers` must be non-zero.
    pub fn fan_out(self, readers: u8) -> impl Iterator<Item = BufferHandle> {
        debug_assert!(readers > 0);
        self.header().refcount.store(readers, Ordering::Release);
        let header = self.header;
        std::mem::forget(self);
        (0..readers).map(move |_| BufferHandle { header })
    }
}

impl Drop for BufferHandle {
    /// Drops one reader, freeing the block when the last reader lets go.
    /// A block that was never fanned out has a single implicit owner.
    fn drop(&mut self) {
        let refcount = &self.header().refcount;
        if refcount.load(Ordering::Acquire) == 0 {
            unsafe { free_block(self.header) }
            return;
        }
        let prev = refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "buffer released more times than it was shared");
        if prev == 1 {
            unsafe { free_block(self.header) }
        }
    }
}
