// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

/// Errors returned by the allocating operations of a [`Pool`](crate::Pool).
///
/// Releasing memory never fails with an error: invalid releases are reported as `false`.
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PoolError {
    /// No arena could serve the request, and the block provider could not supply a new block.
    #[error("block provider could not supply a block of {size} bytes")]
    BlockUnavailable {
        /// Size of the block that was requested from the provider.
        size: usize,
    },

    /// The requested size, plus the chunk overhead, does not fit in a `usize`.
    #[error("allocation of {size} bytes overflows the maximum arena size")]
    SizeOverflow {
        /// Size that was requested by the caller.
        size: usize,
    },

    /// The type to allocate requires a stricter alignment than chunks provide.
    #[error("alignment of {align} bytes exceeds the chunk alignment of {max} bytes")]
    UnsupportedAlignment {
        /// Alignment required by the type.
        align: usize,
        /// Alignment of every chunk payload.
        max: usize,
    },

    /// The arena chain reached the maximum number of arenas.
    #[error("arena chain is full ({count} arenas)")]
    ChainFull {
        /// Number of arenas in the chain.
        count: usize,
    },
}
