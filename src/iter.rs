// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::arena::Arena;
use crate::chunk::Chunk;
use crate::ptr::ChunkOffset;

/// Which of the two lists threaded through the chunk headers to follow.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Link {
    Physical,
    Free,
}

#[derive(Clone, Debug)]
pub(crate) struct ArenaChunks<'a> {
    arena: &'a Arena,
    next: Option<ChunkOffset>,
    link: Link,
}

impl<'a> ArenaChunks<'a> {
    pub(crate) const fn new(arena: &'a Arena, first: Option<ChunkOffset>, link: Link) -> Self {
        Self {
            arena,
            next: first,
            link,
        }
    }
}

impl Iterator for ArenaChunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.arena.read(self.next?);
        self.next = match self.link {
            Link::Physical => chunk.header.phys_next,
            Link::Free => chunk.header.free_next,
        };
        Some(chunk)
    }
}
