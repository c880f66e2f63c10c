// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Ladle: a pooled allocator that serves chunks out of a growing chain of blocks.
//!
//! Ladle pre-allocates large blocks of memory ("arenas") and carves them into variable-sized
//! chunks. Allocating from a pool does not go through the general-purpose allocator, except when
//! the pool needs to grow. This trades some internal fragmentation for lower overhead and more
//! predictable behavior, and is meant for components that perform many short-lived allocations of
//! similar sizes.
//!
//! This is a no-`std` crate that requires `alloc`: new arenas are obtained from a
//! [`BlockProvider`], which by default is the global allocator ([`SystemBlocks`]).
//!
//! # Quick start & examples
//!
//! There are 2 variants of the pool to choose from:
//!
//! * [`SyncPool`]: every operation is serialized by a spin lock; the pool can be shared between
//!   threads.
//! * [`LocalPool`]: no locking at all; the pool can be moved to another thread, but not shared.
//!
//! ```
//! use ladle::LocalPool;
//! use ladle::PoolConfig;
//!
//! let pool = LocalPool::with_config(PoolConfig::new().with_default_arena_size(4096));
//!
//! let ptr = pool.allocate(100).expect("allocation failed");
//! assert_eq!(pool.arena_count(), 1);
//!
//! assert!(pool.release(ptr.as_ptr()));
//! ```
//!
//! Objects can be moved into the pool and dropped in place:
//!
//! ```
//! use ladle::SyncPool;
//!
//! let pool = SyncPool::new();
//!
//! let point = pool.allocate_typed((1u32, 2u32)).expect("allocation failed");
//! assert_eq!(unsafe { *point.as_ref() }, (1, 2));
//!
//! // SAFETY: `point` was allocated by `pool` as a `(u32, u32)` and is released only once
//! assert!(unsafe { pool.release_typed(point) });
//! ```
//!
//! A [`SyncPool`] can also live in a `static` item:
//!
//! ```
//! use ladle::PoolConfig;
//! use ladle::SpinLock;
//! use ladle::SyncPool;
//! use ladle::SystemBlocks;
//!
//! static POOL: SyncPool = SyncPool::from_parts(PoolConfig::new(), SpinLock::new(), SystemBlocks);
//!
//! let ptr = POOL.allocate(16).expect("allocation failed");
//! assert!(POOL.release(ptr.as_ptr()));
//! ```
//!
//! # Allocation strategy
//!
//! Each arena keeps its chunks in two lists threaded through the chunk headers: the *physical*
//! list, in buffer order, and the *free* list. Links are offsets inside the arena, and every header
//! also records which arena it belongs to.
//!
//! * **Allocation** scans the arenas in the order they were created, and each arena scans its free
//!   list for the first chunk that is large enough. Released chunks are pushed at the front of the
//!   free list, so recently released chunks are tried first. A chunk is split if the remainder can
//!   hold another header and at least one granule of payload; otherwise it is handed over whole.
//! * **Growth**: if no arena can serve a request, one arena of
//!   `max(default_arena_size, size + HEADER_SIZE)` bytes is appended to the chain. Arenas are never
//!   removed or shrunk while the pool is alive.
//! * **Release** finds the owning arena in `O(log n)` through an index of arena addresses, checks
//!   the back-reference stored in the chunk header, and merges the chunk with its free physical
//!   neighbors.
//!
//! # Allocator limits
//!
//! * **Chunk overhead:** [`HEADER_SIZE`] bytes per chunk.
//! * **Alignment:** every payload is aligned to [`CHUNK_ALIGN`], the natural alignment of a
//!   machine word. Types with stricter alignment requirements are refused.
//! * **Granularity:** requested sizes are rounded up to a multiple of [`CHUNK_ALIGN`]. Zero-sized
//!   requests get a chunk of [`CHUNK_ALIGN`] bytes, so that every allocation has a distinct
//!   address.
//!
//! # Caller contract
//!
//! Release each address at most once, and only an address previously returned by the same pool.
//! [`Pool::release`] rejects addresses outside of the pool, addresses that are not the start of a
//! chunk payload, and chunks that are already free. These checks catch the common mistakes, but
//! they cannot detect every misuse: releasing an address that was never returned by the pool is
//! not guaranteed to be caught.
//!
//! # Cargo feature flags
//!
//! * `allocator-api`: enables the implementation of the [`core::alloc::Allocator`] trait (requires
//!   a nightly compiler).

#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "allocator-api", feature(allocator_api))]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stderr)]
#![warn(clippy::print_stdout)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(unused_crate_dependencies)]
#![warn(unused_macro_rules)]
#![warn(unused_qualifications)]
#![doc(test(attr(deny(warnings))))]

extern crate alloc;

mod arena;
mod chunk;
mod config;
mod error;
mod iter;
mod lock;
mod provider;
mod ptr;
mod usage;


use crate::arena::Acquired;
use crate::arena::Arena;
use crate::arena::ArenaId;
use crate::arena::Rejection;
use crate::arena::Released;
use crate::chunk::granule;
use crate::chunk::Chunk;
use crate::ptr::PayloadPtr;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use tracing::debug;
use tracing::error;
use tracing::trace;

#[cfg(feature = "allocator-api")]
use core::alloc::AllocError;
#[cfg(feature = "allocator-api")]
use core::alloc::Allocator;
#[cfg(feature = "allocator-api")]
use core::alloc::Layout;

pub use crate::chunk::CHUNK_ALIGN;
pub use crate::chunk::HEADER_SIZE;
pub use crate::config::PoolConfig;
pub use crate::config::DEFAULT_ARENA_SIZE;
pub use crate::error::PoolError;
pub use crate::lock::Lock;
pub use crate::lock::NoLock;
pub use crate::lock::ScopedGuard;
pub use crate::lock::SpinLock;
pub use crate::lock::SyncLock;
pub use crate::provider::BlockProvider;
pub use crate::provider::SystemBlocks;
pub use crate::usage::Usage;

/// Pool that can be shared between threads.
///
/// See the [module-level documentation](crate#quick-start--examples) for more information.
pub type SyncPool = Pool<SpinLock, SystemBlocks>;

/// Pool for single-threaded use, with no locking overhead.
///
/// See the [module-level documentation](crate#quick-start--examples) for more information.
pub type LocalPool = Pool<NoLock, SystemBlocks>;

/// The Ladle pool allocator.
///
/// A pool owns a chain of arenas, obtained from the block provider `P`, and serializes every
/// operation with the lock `L`:
///
/// * with [`SpinLock`], the pool is `Sync` and may be shared between threads;
/// * with [`NoLock`], the pool is `Send` but not `Sync`.
///
/// All the arenas are handed back to the provider when the pool is dropped. Any address returned
/// by the pool becomes dangling at that point.
#[derive(Debug)]
pub struct Pool<L: Lock = SpinLock, P: BlockProvider = SystemBlocks> {
    lock: L,
    inner: UnsafeCell<PoolInner<P>>,
}

// SAFETY: The arenas point to blocks that are exclusively owned by the pool, and that are only
// accessed through the pool.
unsafe impl<L: Lock + Send, P: BlockProvider + Send> Send for Pool<L, P> {}

// SAFETY: Every access to `inner` happens while holding `lock`, which for `SyncLock` guarantees
// mutual exclusion across threads.
unsafe impl<L: SyncLock, P: BlockProvider + Send> Sync for Pool<L, P> {}

impl<L: Lock, P: BlockProvider> Pool<L, P> {
    /// Constructs an empty pool from its parts.
    ///
    /// No arena is created until the first allocation. This is a `const` function, so it can be
    /// used to initialize `static` items.
    #[inline]
    #[must_use]
    pub const fn from_parts(config: PoolConfig, lock: L, provider: P) -> Self {
        Self {
            lock,
            inner: UnsafeCell::new(PoolInner {
                config,
                provider,
                arenas: Vec::new(),
                index: BTreeMap::new(),
            }),
        }
    }

    /// Runs `f` on the pool state while holding the lock.
    ///
    /// `f` must not run user code, and that includes emitting `tracing` events: subscribers may
    /// call back into the pool. Events are emitted after `with_inner` returns instead.
    fn with_inner<R>(&self, f: impl FnOnce(&mut PoolInner<P>) -> R) -> R {
        let _guard = ScopedGuard::new(&self.lock);
        // SAFETY: the guard gives exclusive access to `inner` for its lifetime. `f` never calls
        // into code that could reach this pool again, except the block provider, which must not
        // do so per the `BlockProvider` contract
        let inner = unsafe { &mut *self.inner.get() };
        f(inner)
    }

    /// Returns the configuration this pool was constructed with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.with_inner(|inner| inner.config)
    }

    /// Allocates a chunk of at least `size` bytes and returns the address of its payload.
    ///
    /// The payload is aligned to [`CHUNK_ALIGN`]. If no arena in the chain has room for the
    /// request, a new arena is appended to the chain.
    ///
    /// A zero `size` is valid, and returns a chunk of [`CHUNK_ALIGN`] bytes.
    ///
    /// # Errors
    ///
    /// * [`PoolError::BlockUnavailable`] if the chain had to grow and the block provider could not
    ///   supply a new block.
    /// * [`PoolError::SizeOverflow`] if `size` is too large to be represented in an arena.
    ///
    /// # Examples
    ///
    /// ```
    /// use ladle::LocalPool;
    /// use ladle::PoolConfig;
    ///
    /// let pool = LocalPool::with_config(PoolConfig::new().with_default_arena_size(64));
    ///
    /// pool.allocate(20).expect("allocation failed");
    /// assert_eq!(pool.arena_count(), 1);
    ///
    /// // The first arena has no room left for this
    /// pool.allocate(60).expect("allocation failed");
    /// assert_eq!(pool.arena_count(), 2);
    /// ```
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        self.allocate_chunk(size).map(|payload| payload.cast::<u8>())
    }

    fn allocate_chunk(&self, size: usize) -> Result<NonNull<[u8]>, PoolError> {
        match self.with_inner(|inner| inner.allocate(size)) {
            Ok(allocation) => {
                if let Some(block_size) = allocation.grown {
                    debug!(
                        arena = allocation.acquired.arena.index(),
                        size = block_size,
                        arenas = allocation.acquired.arena.index() + 1,
                        "appended arena"
                    );
                }
                allocation.acquired.trace();
                Ok(allocation.acquired.payload)
            }
            Err(err @ PoolError::BlockUnavailable { size }) => {
                error!(size, "block provider could not supply a new arena");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Moves `value` into a new chunk and returns a pointer to it.
    ///
    /// The returned pointer must eventually be passed to [`release_typed`](Self::release_typed)
    /// with the same type `T` to drop the value, or the value will be leaked.
    ///
    /// # Errors
    ///
    /// The same errors as [`allocate`](Self::allocate), plus
    /// [`PoolError::UnsupportedAlignment`] if `T` requires an alignment above [`CHUNK_ALIGN`].
    #[inline]
    pub fn allocate_typed<T>(&self, value: T) -> Result<NonNull<T>, PoolError> {
        self.allocate_with(|| value)
    }

    /// Allocates a chunk for a `T`, then constructs the `T` in it by calling `f`.
    ///
    /// `f` is only called if the allocation succeeds. It runs without holding the pool lock, so it
    /// may use the pool itself. If `f` panics, the chunk is released before the panic propagates.
    ///
    /// # Errors
    ///
    /// The same errors as [`allocate_typed`](Self::allocate_typed).
    ///
    /// # Examples
    ///
    /// ```
    /// use ladle::LocalPool;
    ///
    /// let pool = LocalPool::new();
    /// let ptr = pool.allocate_with(|| [7usize; 4]).expect("allocation failed");
    /// assert_eq!(unsafe { ptr.as_ref() }, &[7, 7, 7, 7]);
    /// # assert!(unsafe { pool.release_typed(ptr) });
    /// ```
    pub fn allocate_with<T, F: FnOnce() -> T>(&self, f: F) -> Result<NonNull<T>, PoolError> {
        let align = align_of::<T>();
        if align > CHUNK_ALIGN {
            return Err(PoolError::UnsupportedAlignment {
                align,
                max: CHUNK_ALIGN,
            });
        }

        let ptr = self.allocate(size_of::<T>())?.cast::<T>();
        let reservation = Reservation {
            pool: self,
            ptr: ptr.cast(),
        };
        let value = f();
        reservation.keep();

        // SAFETY: `ptr` is aligned for `T` (checked above), and points to at least
        // `size_of::<T>()` bytes owned by the caller
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Releases the chunk whose payload starts at `ptr`.
    ///
    /// Returns `true` if the chunk was released. Returns `false`, leaving the pool untouched, if
    /// `ptr` is null, does not point into one of the arenas of this pool, is not the payload
    /// address of a chunk, or refers to a chunk that is already free.
    ///
    /// `ptr` must not be used after it's released. See the [caller contract](crate#caller-contract)
    /// for the limits of the checks performed here.
    pub fn release(&self, ptr: *mut u8) -> bool {
        let Some(ptr) = NonNull::new(ptr) else {
            debug!("rejected release of a null pointer");
            return false;
        };
        let payload = PayloadPtr::new(ptr);
        match self.with_inner(|inner| inner.release(payload)) {
            Ok(released) => {
                released.trace();
                true
            }
            Err(reason) => {
                debug!(%reason, "rejected release of {:p}", payload);
                false
            }
        }
    }

    /// Drops the `T` at `ptr` in place, then releases its chunk.
    ///
    /// Returns `false` without dropping anything if `ptr` is not an allocated chunk of this pool
    /// (see [`release`](Self::release)).
    ///
    /// If `T::drop` panics, the chunk is still released before the panic propagates.
    ///
    /// # Safety
    ///
    /// * `ptr` must have been returned by [`allocate_typed`](Self::allocate_typed) or
    ///   [`allocate_with`](Self::allocate_with) on this pool, with this exact type `T`.
    /// * `ptr` must not have been released already.
    /// * The value at `ptr` must not be accessed after this call.
    pub unsafe fn release_typed<T>(&self, ptr: NonNull<T>) -> bool {
        if !self.owns(ptr.as_ptr().cast()) {
            debug!("rejected typed release of {:p}", ptr);
            return false;
        }
        // Releases the chunk even if `T::drop` panics
        let reservation = Reservation {
            pool: self,
            ptr: ptr.cast(),
        };
        // SAFETY: the caller guarantees that `ptr` holds a live `T`
        unsafe { ptr.as_ptr().drop_in_place() };
        reservation.release()
    }

    /// Returns whether `ptr` is the payload address of an allocated chunk of this pool.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let Some(ptr) = NonNull::new(ptr.cast_mut()) else {
            return false;
        };
        self.with_inner(|inner| inner.locate(PayloadPtr::new(ptr)).is_ok())
    }

    /// Returns the number of arenas in the chain.
    #[inline]
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.with_inner(|inner| inner.arenas.len())
    }

    /// Returns memory usage information for this pool.
    ///
    /// This walks every chunk of every arena, so it is a linear-time operation.
    ///
    /// # Examples
    ///
    /// ```
    /// use ladle::LocalPool;
    /// use ladle::PoolConfig;
    /// use ladle::Usage;
    /// use ladle::HEADER_SIZE;
    ///
    /// let pool = LocalPool::with_config(PoolConfig::new().with_default_arena_size(1024));
    /// assert_eq!(pool.usage(), Usage::default());
    ///
    /// let _ = pool.allocate(16);
    /// assert_eq!(
    ///     pool.usage(),
    ///     Usage {
    ///         arenas: 1,
    ///         total: 1024,
    ///         used: 16,
    ///         free: 1024 - 2 * HEADER_SIZE - 16,
    ///         chunks: 2,
    ///         objects: 1,
    ///     }
    /// );
    /// ```
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.with_inner(|inner| Usage::get(&inner.arenas))
    }
}

impl<L: Lock + Default, P: BlockProvider + Default> Pool<L, P> {
    /// Constructs an empty pool with the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::new())
    }

    /// Constructs an empty pool with the given configuration.
    #[inline]
    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        Self::from_parts(config, L::default(), P::default())
    }
}

impl<L: Lock + Default, P: BlockProvider + Default> Default for Pool<L, P> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Lock, P: BlockProvider> Drop for Pool<L, P> {
    fn drop(&mut self) {
        let PoolInner {
            provider, arenas, ..
        } = self.inner.get_mut();
        for arena in arenas.drain(..) {
            trace!(arena = arena.id().index(), size = arena.size(), "reclaiming arena");
            // SAFETY: the block was obtained from this provider, and nothing refers to it anymore
            unsafe { provider.reclaim(arena.into_block()) }
        }
    }
}

#[cfg(feature = "allocator-api")]
unsafe impl<L: Lock, P: BlockProvider> Allocator for Pool<L, P> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > CHUNK_ALIGN {
            return Err(AllocError);
        }
        self.allocate_chunk(layout.size()).map_err(|_| AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        let released = self.release(ptr.as_ptr());
        debug_assert!(released, "deallocated pointer was not allocated by this pool");
    }
}

/// Releases a chunk when dropped, unless [`keep`](Self::keep) is called.
///
/// Covers the chunk while user code (a constructor or a destructor) runs on it.
struct Reservation<'a, L: Lock, P: BlockProvider> {
    pool: &'a Pool<L, P>,
    ptr: NonNull<u8>,
}

impl<L: Lock, P: BlockProvider> Reservation<'_, L, P> {
    #[inline]
    fn keep(self) {
        core::mem::forget(self)
    }

    #[inline]
    fn release(self) -> bool {
        let this = ManuallyDrop::new(self);
        this.pool.release(this.ptr.as_ptr())
    }
}

impl<L: Lock, P: BlockProvider> Drop for Reservation<'_, L, P> {
    fn drop(&mut self) {
        let released = self.pool.release(self.ptr.as_ptr());
        debug_assert!(released, "reserved chunk was released twice");
    }
}

/// What an allocation did, to be logged once the pool is unlocked.
#[derive(Copy, Clone, Debug)]
struct Allocation {
    acquired: Acquired,
    /// Size of the arena appended to serve the request, if the chain had to grow.
    grown: Option<usize>,
}

#[derive(Debug)]
struct PoolInner<P> {
    config: PoolConfig,
    provider: P,
    arenas: Vec<Arena>,
    /// Start address of every arena block, for finding the arena an address falls into.
    index: BTreeMap<usize, ArenaId>,
}

impl<P: BlockProvider> PoolInner<P> {
    fn allocate(&mut self, size: usize) -> Result<Allocation, PoolError> {
        let granule = granule(size).ok_or(PoolError::SizeOverflow { size })?;

        if let Some(acquired) = self
            .arenas
            .iter_mut()
            .find_map(|arena| arena.acquire(granule))
        {
            return Ok(Allocation {
                acquired,
                grown: None,
            });
        }

        let arena = self.grow(size, granule)?;
        let block_size = arena.size();
        let acquired = arena.acquire(granule);
        debug_assert!(acquired.is_some(), "new arena cannot serve the request");
        let acquired = acquired.ok_or(PoolError::SizeOverflow { size })?;
        Ok(Allocation {
            acquired,
            grown: Some(block_size),
        })
    }

    /// Appends an arena that can serve a chunk of `granule` bytes.
    fn grow(&mut self, size: usize, granule: usize) -> Result<&mut Arena, PoolError> {
        let block_size = self
            .config
            .arena_size_for(granule)
            .ok_or(PoolError::SizeOverflow { size })?;
        let id = ArenaId::new(self.arenas.len()).ok_or(PoolError::ChainFull {
            count: self.arenas.len(),
        })?;

        let block = self
            .provider
            .provide(block_size)
            .ok_or(PoolError::BlockUnavailable { size: block_size })?;
        debug_assert_eq!(block.len(), block_size, "block provider returned a wrong size");

        // SAFETY: `block` comes from the provider, and is reclaimed only when the pool is dropped
        let arena = unsafe { Arena::new(id, block) };
        self.index.insert(arena.start_addr(), id);
        self.arenas.push(arena);

        Ok(&mut self.arenas[id.index()])
    }

    /// Finds the allocated chunk at `payload`, in the arena its back-reference names.
    fn locate(&self, payload: PayloadPtr) -> Result<Chunk, Rejection> {
        let (_, &id) = self
            .index
            .range(..=payload.addr())
            .next_back()
            .ok_or(Rejection::OutOfBounds)?;
        let arena = self.arenas.get(id.index()).ok_or(Rejection::OutOfBounds)?;
        if !arena.contains(payload) {
            return Err(Rejection::OutOfBounds);
        }
        arena.locate(payload)
    }

    fn release(&mut self, payload: PayloadPtr) -> Result<Released, Rejection> {
        let chunk = self.locate(payload)?;
        let arena = self
            .arenas
            .get_mut(chunk.header.owner.index())
            .ok_or(Rejection::ForeignOwner)?;
        Ok(arena.release(chunk))
    }
}
