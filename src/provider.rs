// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::chunk::CHUNK_ALIGN;
use alloc::alloc::alloc_zeroed;
use alloc::alloc::dealloc;
use core::alloc::Layout;
use core::ptr::NonNull;

/// Source of the blocks that back the arenas of a [`Pool`](crate::Pool).
///
/// A pool asks its provider for a new block every time its arena chain needs to grow, and hands
/// every block back when the pool is dropped.
///
/// # Safety
///
/// Implementations must guarantee that every block returned by [`provide`](Self::provide):
///
/// - is exactly `size` bytes long;
/// - starts at an address aligned to [`CHUNK_ALIGN`];
/// - is valid for reads and writes, is initialized (for example, zero-filled), and is not aliased
///   by any other pointer or reference until it is passed back to [`reclaim`](Self::reclaim).
///
/// `provide` and `reclaim` are called while the pool is locked: they must not call back into the
/// pool that owns the provider.
pub unsafe trait BlockProvider {
    /// Returns a new block of `size` bytes, or `None` if no memory is available.
    fn provide(&self, size: usize) -> Option<NonNull<[u8]>>;

    /// Takes back a block previously returned by [`provide`](Self::provide).
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `provide` on this same provider, and must not be used
    /// after this call.
    unsafe fn reclaim(&self, block: NonNull<[u8]>);
}

/// Block provider that obtains zero-filled blocks from the global allocator.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Debug)]
pub struct SystemBlocks;

unsafe impl BlockProvider for SystemBlocks {
    fn provide(&self, size: usize) -> Option<NonNull<[u8]>> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, CHUNK_ALIGN).ok()?;
        // SAFETY: `layout` has a non-zero size
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(NonNull::slice_from_raw_parts(ptr, size))
    }

    unsafe fn reclaim(&self, block: NonNull<[u8]>) {
        // SAFETY: `block` was returned by `provide`, which validated this exact layout
        unsafe {
            let layout = Layout::from_size_align_unchecked(block.len(), CHUNK_ALIGN);
            dealloc(block.cast::<u8>().as_ptr(), layout);
        }
    }
}
