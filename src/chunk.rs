// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::arena::ArenaId;
use crate::ptr::ChunkOffset;

macro_rules! const_assert {
    ( $( $tt:tt )* ) => {
        const _: () = assert!($($tt)*);
    }
}

/// Size in bytes of the header that precedes every chunk payload.
pub const HEADER_SIZE: usize = size_of::<ChunkHeaderRepr>();

/// Alignment of every chunk header and payload.
///
/// This is the natural alignment of a machine word. Payload sizes are always rounded up to a
/// multiple of this value, so that the header following a payload stays aligned too.
pub const CHUNK_ALIGN: usize = align_of::<ChunkHeaderRepr>();

const_assert!(CHUNK_ALIGN == align_of::<usize>());
const_assert!(HEADER_SIZE % CHUNK_ALIGN == 0);

/// Link value that encodes "no chunk".
const NIL: usize = usize::MAX;

/// Tag of a live header. The lowest bit is reserved for the is-free flag.
const TAG_MAGIC: u32 = 0x1AD1_E5A0;
const TAG_FREE: u32 = 0x1;

/// In-buffer representation of a chunk header.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(crate) struct ChunkHeaderRepr {
    phys_prev: usize,
    phys_next: usize,
    free_prev: usize,
    free_next: usize,
    size: usize,
    owner: u32,
    tag: u32,
}

impl ChunkHeaderRepr {
    /// Written over headers that have been absorbed by a merge.
    pub(crate) const ERASED: Self = Self {
        phys_prev: NIL,
        phys_next: NIL,
        free_prev: NIL,
        free_next: NIL,
        size: 0,
        owner: 0,
        tag: 0,
    };
}

#[inline]
const fn encode_link(link: Option<ChunkOffset>) -> usize {
    match link {
        Some(offset) => offset.get(),
        None => NIL,
    }
}

#[inline]
const fn decode_link(value: usize) -> Option<ChunkOffset> {
    if value == NIL {
        None
    } else {
        Some(ChunkOffset::new(value))
    }
}

/// Rounds a requested payload size up to the size of the chunk that will serve it.
///
/// Zero-sized requests are served with the smallest chunk possible, so that every allocation
/// returns a distinct address that can be released.
#[inline]
#[must_use]
pub(crate) fn granule(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(CHUNK_ALIGN)
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct ChunkHeader {
    pub(crate) phys_prev: Option<ChunkOffset>,
    pub(crate) phys_next: Option<ChunkOffset>,
    pub(crate) free_prev: Option<ChunkOffset>,
    pub(crate) free_next: Option<ChunkOffset>,
    pub(crate) size: usize,
    pub(crate) is_free: bool,
    pub(crate) owner: ArenaId,
}

impl ChunkHeader {
    /// Header of a chunk that is not linked to anything yet.
    #[inline]
    #[must_use]
    pub(crate) const fn detached(owner: ArenaId, size: usize, is_free: bool) -> Self {
        Self {
            phys_prev: None,
            phys_next: None,
            free_prev: None,
            free_next: None,
            size,
            is_free,
            owner,
        }
    }

    /// Decodes a header, returning `None` if `repr` does not carry a live tag.
    #[must_use]
    pub(crate) fn decode(repr: &ChunkHeaderRepr) -> Option<Self> {
        if repr.tag & !TAG_FREE != TAG_MAGIC {
            return None;
        }
        Some(Self {
            phys_prev: decode_link(repr.phys_prev),
            phys_next: decode_link(repr.phys_next),
            free_prev: decode_link(repr.free_prev),
            free_next: decode_link(repr.free_next),
            size: repr.size,
            is_free: repr.tag & TAG_FREE != 0,
            owner: ArenaId::from_raw(repr.owner),
        })
    }

    #[must_use]
    pub(crate) fn encode(&self) -> ChunkHeaderRepr {
        ChunkHeaderRepr {
            phys_prev: encode_link(self.phys_prev),
            phys_next: encode_link(self.phys_next),
            free_prev: encode_link(self.free_prev),
            free_next: encode_link(self.free_next),
            size: self.size,
            owner: self.owner.raw(),
            tag: if self.is_free {
                TAG_MAGIC | TAG_FREE
            } else {
                TAG_MAGIC
            },
        }
    }
}

/// A decoded chunk: its position in the arena buffer and its header.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct Chunk {
    pub(crate) offset: ChunkOffset,
    pub(crate) header: ChunkHeader,
}

impl Chunk {
    #[inline]
    #[must_use]
    pub(crate) const fn new(offset: ChunkOffset, header: ChunkHeader) -> Self {
        Self { offset, header }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn size(&self) -> usize {
        self.header.size
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_free(&self) -> bool {
        self.header.is_free
    }

    /// Offset of the first byte past the payload; this is where the next physical chunk starts.
    #[inline]
    #[must_use]
    pub(crate) fn end(&self) -> Option<usize> {
        self.offset.payload().checked_add(self.header.size)
    }
}
