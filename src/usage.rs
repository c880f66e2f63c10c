// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::arena::Arena;
use crate::chunk::HEADER_SIZE;

/// Memory usage information.
///
/// This structure is returned by [`Pool::usage`](crate::Pool::usage). See that method
/// documentation for information and examples.
#[derive(Default, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Usage {
    /// Number of arenas in the chain.
    pub arenas: usize,
    /// Total memory obtained from the block provider, summed over all arenas.
    ///
    /// This includes the chunk headers. Note that `total` equals `used + free + chunks *
    /// HEADER_SIZE`, where [`HEADER_SIZE`] is the fixed header overhead of each chunk.
    pub total: usize,
    /// Total payload capacity of the allocated chunks.
    ///
    /// This may be larger than the sum of the requested sizes: requests are rounded up to the
    /// [chunk alignment](crate::CHUNK_ALIGN), and a chunk is handed over whole when splitting it
    /// would leave no room for another chunk.
    pub used: usize,
    /// Total payload capacity of the free chunks.
    ///
    /// Free memory may be fragmented across chunks and arenas: an allocation of `free` bytes is
    /// not guaranteed to succeed without growing the chain.
    pub free: usize,
    /// Number of chunks, free and allocated, across all arenas.
    pub chunks: usize,
    /// Number of allocated chunks.
    pub objects: usize,
}

impl Usage {
    pub(crate) fn get(arenas: &[Arena]) -> Self {
        let mut usage = Self {
            arenas: arenas.len(),
            ..Self::default()
        };

        for arena in arenas {
            usage.total += arena.size();
            usage.chunks += arena.chunk_count();
            for chunk in arena.chunks() {
                if chunk.is_free() {
                    usage.free += chunk.size();
                } else {
                    usage.used += chunk.size();
                    usage.objects += 1;
                }
            }
        }

        debug_assert_eq!(
            usage.total,
            usage.used + usage.free + usage.chunks * HEADER_SIZE,
            "chunks do not cover the arenas"
        );

        usage
    }
}
