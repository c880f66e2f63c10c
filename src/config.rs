// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::chunk::CHUNK_ALIGN;
use crate::chunk::HEADER_SIZE;

/// Default size of the arenas appended to a pool: 64 KiB.
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024;

/// Construction-time configuration of a [`Pool`](crate::Pool).
///
/// # Examples
///
/// ```
/// use ladle::PoolConfig;
///
/// let config = PoolConfig::new().with_default_arena_size(4096);
/// assert_eq!(config.default_arena_size(), 4096);
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PoolConfig {
    default_arena_size: usize,
}

impl PoolConfig {
    /// Returns the default configuration.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            default_arena_size: DEFAULT_ARENA_SIZE,
        }
    }

    /// Sets the size of the arenas appended when the pool needs to grow.
    ///
    /// Each new arena is at least this big (headers included). An allocation that does not fit in
    /// an arena of this size gets an arena of its own, sized for that allocation alone.
    #[inline]
    #[must_use]
    pub const fn with_default_arena_size(mut self, size: usize) -> Self {
        self.default_arena_size = size;
        self
    }

    /// Size of the arenas appended when the pool needs to grow.
    #[inline]
    #[must_use]
    pub const fn default_arena_size(&self) -> usize {
        self.default_arena_size
    }

    /// Size of the block needed by a new arena that must be able to serve a `payload`-byte chunk.
    pub(crate) fn arena_size_for(&self, payload: usize) -> Option<usize> {
        payload
            .checked_add(HEADER_SIZE)?
            .max(self.default_arena_size)
            .checked_next_multiple_of(CHUNK_ALIGN)
    }
}

impl Default for PoolConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
