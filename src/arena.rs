// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::chunk::Chunk;
use crate::chunk::ChunkHeader;
use crate::chunk::ChunkHeaderRepr;
use crate::chunk::CHUNK_ALIGN;
use crate::chunk::HEADER_SIZE;
use crate::iter::ArenaChunks;
use crate::iter::Link;
use crate::ptr::ChunkOffset;
use crate::ptr::PayloadPtr;
use core::fmt;
use core::ptr::NonNull;
use tracing::trace;

/// Handle of an arena inside the chain of a pool. Stored in every chunk header as the
/// back-reference to the owning arena.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct ArenaId(u32);

impl ArenaId {
    #[inline]
    #[must_use]
    pub(crate) fn new(index: usize) -> Option<Self> {
        u32::try_from(index).ok().map(Self)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A chunk handed over by [`Arena::acquire`].
///
/// Events are not logged while the pool is locked: the caller logs the outcome with
/// [`trace`](Self::trace) after unlocking.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Acquired {
    pub(crate) arena: ArenaId,
    pub(crate) offset: ChunkOffset,
    pub(crate) payload: NonNull<[u8]>,
    /// Size of the free chunk carved out of the remainder, if the chunk was split.
    pub(crate) remainder: Option<usize>,
}

impl Acquired {
    pub(crate) fn trace(&self) {
        if let Some(remainder) = self.remainder {
            trace!(
                arena = self.arena.index(),
                offset = self.offset.get(),
                size = self.payload.len(),
                remainder,
                "split chunk"
            );
        }
        trace!(
            arena = self.arena.index(),
            offset = self.offset.get(),
            size = self.payload.len(),
            "acquired chunk"
        );
    }
}

/// A chunk returned to the free list by [`Arena::release`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct Released {
    pub(crate) arena: ArenaId,
    pub(crate) offset: ChunkOffset,
    pub(crate) size: usize,
    /// Number of free neighbors the chunk was merged with (0, 1 or 2).
    pub(crate) merges: usize,
}

impl Released {
    pub(crate) fn trace(&self) {
        trace!(
            arena = self.arena.index(),
            offset = self.offset.get(),
            size = self.size,
            merges = self.merges,
            "released chunk"
        );
    }
}

/// Reasons for refusing to release an address.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Rejection {
    OutOfBounds,
    Misaligned,
    NoHeader,
    ForeignOwner,
    BrokenLinks,
    AlreadyFree,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfBounds => "address is outside of the arena",
            Self::Misaligned => "address is not aligned to a chunk payload",
            Self::NoHeader => "no live chunk header precedes the address",
            Self::ForeignOwner => "chunk header belongs to another arena",
            Self::BrokenLinks => "chunk header is not linked to its neighbors",
            Self::AlreadyFree => "chunk is already free",
        })
    }
}

/// A single block of memory, partitioned into chunks.
///
/// Every chunk is linked to its physical neighbors (in buffer order), and free chunks are also
/// linked together in the free list. Links are byte offsets from the start of the block.
///
/// The arena does not own the block in the sense of freeing it: the pool hands the block back to
/// its provider through [`into_block`](Self::into_block).
pub(crate) struct Arena {
    id: ArenaId,
    block: NonNull<[u8]>,
    free_head: Option<ChunkOffset>,
    chunk_count: usize,
}

impl Arena {
    /// Lays out a single free chunk spanning the whole `block`.
    ///
    /// If `block` is too small to hold even a chunk header, the arena has no chunks and every
    /// [`acquire`](Self::acquire) fails.
    ///
    /// # Safety
    ///
    /// `block` must satisfy the requirements listed on [`BlockProvider`](crate::BlockProvider),
    /// and must stay valid until it's taken back with [`into_block`](Self::into_block).
    pub(crate) unsafe fn new(id: ArenaId, block: NonNull<[u8]>) -> Self {
        debug_assert!(
            block.cast::<u8>().align_offset(CHUNK_ALIGN) == 0,
            "block is not aligned"
        );
        debug_assert!(
            block.len() % CHUNK_ALIGN == 0,
            "block size is not a multiple of the chunk alignment"
        );

        let mut arena = Self {
            id,
            block,
            free_head: None,
            chunk_count: 0,
        };

        if let Some(size) = block.len().checked_sub(HEADER_SIZE) {
            let first = Chunk::new(ChunkOffset::START, ChunkHeader::detached(id, size, true));
            arena.write(&first);
            arena.free_head = Some(first.offset);
            arena.chunk_count = 1;
        }

        arena
    }

    #[inline]
    #[must_use]
    pub(crate) const fn id(&self) -> ArenaId {
        self.id
    }

    /// Total size of the block, headers included.
    #[inline]
    #[must_use]
    pub(crate) const fn size(&self) -> usize {
        self.block.len()
    }

    /// Number of chunks (free and allocated) in the physical list.
    #[inline]
    #[must_use]
    pub(crate) const fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    #[inline]
    #[must_use]
    pub(crate) const fn start(&self) -> NonNull<u8> {
        self.block.cast()
    }

    #[inline]
    #[must_use]
    pub(crate) fn start_addr(&self) -> usize {
        self.start().as_ptr() as usize
    }

    #[inline]
    #[must_use]
    pub(crate) fn contains(&self, payload: PayloadPtr) -> bool {
        let start = self.start_addr();
        let addr = payload.addr();
        addr >= start && addr - start < self.size()
    }

    /// Iterates over all chunks in buffer order.
    pub(crate) fn chunks(&self) -> ArenaChunks<'_> {
        let first = (self.chunk_count > 0).then_some(ChunkOffset::START);
        ArenaChunks::new(self, first, Link::Physical)
    }

    /// Iterates over the free chunks in free-list order.
    pub(crate) fn free_chunks(&self) -> ArenaChunks<'_> {
        ArenaChunks::new(self, self.free_head, Link::Free)
    }

    pub(crate) fn into_block(self) -> NonNull<[u8]> {
        self.block
    }

    /// Reads the chunk at `offset`, which must come from a link of a live chunk.
    pub(crate) fn read(&self, offset: ChunkOffset) -> Chunk {
        debug_assert!(
            offset.get() + HEADER_SIZE <= self.size(),
            "`offset` exceeds the size of the arena"
        );
        // SAFETY: links always point to headers inside the block
        let repr = unsafe { offset.header_ptr(self.start()).read() };
        let header = ChunkHeader::decode(&repr);
        debug_assert!(header.is_some(), "linked chunk has no live header");
        // SAFETY: links always point to live headers, written by `write()`
        Chunk::new(offset, unsafe { header.unwrap_unchecked() })
    }

    /// Reads the chunk at an untrusted `offset`, returning `None` if the offset is out of bounds,
    /// misaligned, or does not hold a live header.
    fn try_read(&self, offset: ChunkOffset) -> Option<Chunk> {
        let end = offset.get().checked_add(HEADER_SIZE)?;
        if end > self.size() || offset.get() % CHUNK_ALIGN != 0 {
            return None;
        }
        // SAFETY: the header is in bounds and aligned, and the block is initialized
        let repr = unsafe { offset.header_ptr(self.start()).read() };
        ChunkHeader::decode(&repr).map(|header| Chunk::new(offset, header))
    }

    fn write(&mut self, chunk: &Chunk) {
        debug_assert!(
            chunk.offset.get() + HEADER_SIZE <= self.size(),
            "`offset` exceeds the size of the arena"
        );
        debug_assert_eq!(chunk.header.owner, self.id, "chunk belongs to another arena");
        // SAFETY: chunks are only ever laid out inside the block
        unsafe { chunk.offset.header_ptr(self.start()).write(chunk.header.encode()) }
    }

    fn erase(&mut self, offset: ChunkOffset) {
        // SAFETY: `offset` held a live header until now
        unsafe {
            offset
                .header_ptr(self.start())
                .write(ChunkHeaderRepr::ERASED)
        }
    }

    /// Takes a chunk of at least `size` bytes out of the free list.
    ///
    /// This is a first-fit search over the free list. Because released chunks are pushed at the
    /// front of the list, the most recently released chunks are tried first.
    ///
    /// `size` must be a multiple of [`CHUNK_ALIGN`].
    pub(crate) fn acquire(&mut self, size: usize) -> Option<Acquired> {
        debug_assert_eq!(size % CHUNK_ALIGN, 0, "`size` is not a granule");

        if size.checked_add(HEADER_SIZE)? > self.size() {
            return None;
        }

        let chunk = self.free_chunks().find(|chunk| chunk.size() >= size)?;
        let (chunk, remainder) = self.split(chunk, size);
        self.unlink_free(chunk);

        // SAFETY: the payload of a chunk lies inside the block
        let payload = unsafe { chunk.offset.payload_ptr(self.start()) };
        Some(Acquired {
            arena: self.id,
            offset: chunk.offset,
            payload: NonNull::slice_from_raw_parts(payload.as_nonnull(), chunk.size()),
            remainder,
        })
    }

    /// Shrinks `chunk` to `size` bytes, carving a free chunk out of the remainder.
    ///
    /// The chunk is left untouched when the remainder could not hold a header plus at least one
    /// byte of payload: in that case the whole chunk is handed over. Returns the shrunk chunk and
    /// the size of the remainder, if any.
    fn split(&mut self, mut chunk: Chunk, size: usize) -> (Chunk, Option<usize>) {
        let remainder = match chunk
            .size()
            .checked_sub(size)
            .and_then(|rest| rest.checked_sub(HEADER_SIZE))
        {
            Some(remainder) if remainder > 0 => remainder,
            _ => return (chunk, None),
        };

        let rest = Chunk::new(
            ChunkOffset::new(chunk.offset.payload() + size),
            ChunkHeader {
                phys_prev: Some(chunk.offset),
                phys_next: chunk.header.phys_next,
                free_prev: Some(chunk.offset),
                free_next: chunk.header.free_next,
                size: remainder,
                is_free: true,
                owner: self.id,
            },
        );
        self.write(&rest);

        if let Some(next) = rest.header.phys_next {
            let mut next = self.read(next);
            next.header.phys_prev = Some(rest.offset);
            self.write(&next);
        }
        if let Some(next) = rest.header.free_next {
            let mut next = self.read(next);
            next.header.free_prev = Some(rest.offset);
            self.write(&next);
        }

        chunk.header.size = size;
        chunk.header.phys_next = Some(rest.offset);
        chunk.header.free_next = Some(rest.offset);
        self.write(&chunk);
        self.chunk_count += 1;

        (chunk, Some(remainder))
    }

    fn unlink_free(&mut self, mut chunk: Chunk) {
        match chunk.header.free_prev {
            None => self.free_head = chunk.header.free_next,
            Some(prev) => {
                let mut prev = self.read(prev);
                prev.header.free_next = chunk.header.free_next;
                self.write(&prev);
            }
        }
        if let Some(next) = chunk.header.free_next {
            let mut next = self.read(next);
            next.header.free_prev = chunk.header.free_prev;
            self.write(&next);
        }

        chunk.header.free_prev = None;
        chunk.header.free_next = None;
        chunk.header.is_free = false;
        self.write(&chunk);
    }

    fn push_free(&mut self, mut chunk: Chunk) {
        if let Some(head) = self.free_head {
            let mut head = self.read(head);
            head.header.free_prev = Some(chunk.offset);
            self.write(&head);
        }

        chunk.header.free_prev = None;
        chunk.header.free_next = self.free_head;
        chunk.header.is_free = true;
        self.write(&chunk);
        self.free_head = Some(chunk.offset);
    }

    /// Finds the allocated chunk whose payload starts at `payload`.
    ///
    /// The address is checked against the bounds of the block before any header is read, and the
    /// header is only trusted if it carries a live tag, names this arena as its owner, and is
    /// linked back by its physical neighbors.
    pub(crate) fn locate(&self, payload: PayloadPtr) -> Result<Chunk, Rejection> {
        let payload_offset = payload
            .offset_in(self.block)
            .ok_or(Rejection::OutOfBounds)?;
        if payload_offset % CHUNK_ALIGN != 0 {
            return Err(Rejection::Misaligned);
        }

        let chunk = self
            .try_read(ChunkOffset::new(payload_offset - HEADER_SIZE))
            .ok_or(Rejection::NoHeader)?;
        if chunk.header.owner != self.id {
            return Err(Rejection::ForeignOwner);
        }
        if !self.is_linked(&chunk) {
            return Err(Rejection::BrokenLinks);
        }
        if chunk.is_free() {
            return Err(Rejection::AlreadyFree);
        }

        Ok(chunk)
    }

    fn is_linked(&self, chunk: &Chunk) -> bool {
        let Some(end) = chunk.end() else {
            return false;
        };

        let prev_ok = match chunk.header.phys_prev {
            None => chunk.offset == ChunkOffset::START,
            Some(prev) => {
                prev < chunk.offset
                    && self.try_read(prev).is_some_and(|prev| {
                        prev.header.phys_next == Some(chunk.offset)
                            && prev.end() == Some(chunk.offset.get())
                    })
            }
        };

        let next_ok = match chunk.header.phys_next {
            None => end == self.size(),
            Some(next) => {
                next.get() == end
                    && self
                        .try_read(next)
                        .is_some_and(|next| next.header.phys_prev == Some(chunk.offset))
            }
        };

        prev_ok && next_ok
    }

    /// Returns `chunk` to the free list, merging it with its free neighbors.
    ///
    /// `chunk` must have just been returned by [`locate`](Self::locate) on this arena, with no
    /// other change to the arena in between.
    pub(crate) fn release(&mut self, chunk: Chunk) -> Released {
        debug_assert_eq!(chunk.header.owner, self.id, "chunk belongs to another arena");
        debug_assert!(!chunk.is_free(), "chunk is already free");

        self.push_free(chunk);
        let mut merges = 0;

        // Merging into the predecessor moves the released chunk; pick up whichever chunk now
        // covers its position before looking at the successor.
        let survivor = match chunk.header.phys_prev {
            Some(prev) if self.merge(prev, chunk.offset) => {
                merges += 1;
                prev
            }
            _ => chunk.offset,
        };
        if let Some(next) = self.read(survivor).header.phys_next {
            if self.merge(survivor, next) {
                merges += 1;
            }
        }

        Released {
            arena: self.id,
            offset: chunk.offset,
            size: chunk.size(),
            merges,
        }
    }

    /// Merges `right` into `left` if both are free. `right` must be the physical successor of
    /// `left`.
    fn merge(&mut self, left: ChunkOffset, right: ChunkOffset) -> bool {
        let left_chunk = self.read(left);
        let right_chunk = self.read(right);
        debug_assert_eq!(
            left_chunk.header.phys_next,
            Some(right),
            "chunks are not physical neighbors"
        );

        if !left_chunk.is_free() || !right_chunk.is_free() {
            return false;
        }

        self.unlink_free(right_chunk);

        // Unlinking may have rewritten the free links of `left`
        let mut left_chunk = self.read(left);
        left_chunk.header.phys_next = right_chunk.header.phys_next;
        left_chunk.header.size += HEADER_SIZE + right_chunk.size();
        self.write(&left_chunk);

        if let Some(next) = right_chunk.header.phys_next {
            let mut next = self.read(next);
            next.header.phys_prev = Some(left);
            self.write(&next);
        }

        self.erase(right);
        self.chunk_count -= 1;

        true
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("start", &self.start())
            .field("size", &self.size())
            .field("free_head", &self.free_head)
            .field("chunk_count", &self.chunk_count)
            .finish()
    }
}
