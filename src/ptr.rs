// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::chunk::ChunkHeaderRepr;
use crate::chunk::HEADER_SIZE;
use core::fmt;
use core::ptr::NonNull;

/// Identifies a chunk by the byte offset of its header from the start of the arena buffer.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct ChunkOffset(usize);

impl ChunkOffset {
    pub(crate) const START: Self = Self(0);

    #[inline]
    #[must_use]
    pub(crate) const fn new(offset: usize) -> Self {
        Self(offset)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn get(self) -> usize {
        self.0
    }

    /// Offset of the first payload byte of this chunk.
    #[inline]
    #[must_use]
    pub(crate) const fn payload(self) -> usize {
        self.0 + HEADER_SIZE
    }

    /// Returns a pointer to the header of this chunk inside the buffer starting at `base`.
    ///
    /// # Safety
    ///
    /// `self.get() + HEADER_SIZE` must not exceed the length of the buffer starting at `base`.
    #[inline]
    pub(crate) unsafe fn header_ptr(self, base: NonNull<u8>) -> NonNull<ChunkHeaderRepr> {
        let ptr = unsafe { base.byte_add(self.0) }.cast::<ChunkHeaderRepr>();
        debug_assert!(ptr.is_aligned(), "chunk header is not aligned");
        ptr
    }

    /// Returns a pointer to the payload of this chunk inside the buffer starting at `base`.
    ///
    /// # Safety
    ///
    /// `self.payload()` must not exceed the length of the buffer starting at `base`.
    #[inline]
    pub(crate) unsafe fn payload_ptr(self, base: NonNull<u8>) -> PayloadPtr {
        PayloadPtr::new(unsafe { base.byte_add(self.payload()) })
    }
}

/// A caller-facing payload address.
///
/// This is the only place where a raw address gets turned back into a position inside an arena
/// buffer. No memory is read through a `PayloadPtr`: it is only compared against buffer bounds.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct PayloadPtr {
    ptr: NonNull<u8>,
}

impl PayloadPtr {
    #[inline]
    pub(crate) const fn new(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    #[inline]
    pub(crate) const fn as_nonnull(self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Returns the offset of this payload relative to the start of `block`, if the payload may
    /// belong to a chunk in `block`.
    ///
    /// A payload is always preceded by a header, so offsets smaller than `HEADER_SIZE` are
    /// rejected, as well as offsets at or past the end of the block.
    pub(crate) fn offset_in(self, block: NonNull<[u8]>) -> Option<usize> {
        let start = block.cast::<u8>().as_ptr() as usize;
        self.addr()
            .checked_sub(start)
            .filter(|&offset| offset >= HEADER_SIZE && offset < block.len())
    }
}

impl fmt::Pointer for PayloadPtr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ptr.fmt(f)
    }
}

impl fmt::Debug for PayloadPtr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadPtr({:p})", self)
    }
}
