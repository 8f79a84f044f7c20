//! Error types shared by the allocator engines.

use snafu::{Location, Snafu};

/// Errors reported while binding an allocator to a memory region.
///
/// Initialization is the only place where the engines validate their
/// configuration against the supplied region; once `init` succeeds, the
/// allocation paths report failures through `None` instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum InitError {
    /// The region length does not divide evenly into slots.
    #[snafu(display(
        "region length {limit} is not a multiple of the slot size {slot_size}"
    ))]
    RegionNotSlotMultiple {
        /// Length of the supplied region in bytes.
        limit: usize,
        /// Size of one slot in bytes.
        slot_size: usize,
        #[snafu(implicit)]
        location: Location,
    },

    /// The region cannot hold the configured number of slots or the
    /// largest block.
    #[snafu(display("region length {limit} is too small, need at least {required} bytes"))]
    RegionTooSmall {
        /// Length of the supplied region in bytes.
        limit: usize,
        /// Minimum region length for this configuration.
        required: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Error reported when `free` rejects a pointer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum FreeError {
    /// The pointer was not produced by this allocator, or its control
    /// information has been overwritten since.
    #[snafu(display("pointer {addr:#x} does not belong to this allocator"))]
    ForeignPointer {
        /// Address passed to `free`.
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
}
