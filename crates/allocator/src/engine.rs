//! The shared allocate/free skeleton.
//!
//! Every engine supplies the same five primitive operations; the public
//! [`MemoryAllocator`] contract is implemented once on top of them. The
//! engine is selected at compile time through a generic parameter, so the
//! composition costs nothing at run time.

use core::ptr::NonNull;

use crate::{
    align::Aligner,
    error::{ForeignPointerSnafu, FreeError},
};

/// A unit of allocation handed around between the skeleton and an engine.
///
/// The only capability a block exposes is the address returned to the
/// caller of [`MemoryAllocator::allocate`].
pub trait BlockHandle {
    /// Returns the payload address of this block.
    fn payload(&self) -> NonNull<u8>;
}

/// The five primitive operations an allocation engine implements.
///
/// Blocks returned by [`find_free`](Self::find_free) and
/// [`lookup`](Self::lookup) are only ever fed back into the same engine by
/// the skeleton, so implementations may trust their own handles.
pub trait Engine {
    /// The engine's block representation.
    type Block: BlockHandle;
    /// Size adjustment applied before the engine is consulted.
    type Aligner: Aligner;

    /// Finds a free block covering `size` bytes, where `size` has already
    /// been adjusted by the aligner. Returns `None` when no block fits.
    fn find_free(&mut self, size: usize) -> Option<Self::Block>;

    /// Returns a freed block to the engine so later searches can find it.
    /// Engines may coalesce the block with its neighbors here.
    fn put_free(&mut self, block: Self::Block);

    /// Marks a block unavailable to later searches.
    fn mark_used(&mut self, block: &mut Self::Block);

    /// Marks a block available again.
    fn mark_free(&mut self, block: &mut Self::Block);

    /// Resolves a payload address back to its block.
    ///
    /// Returns `None` when the address cannot belong to this allocator.
    ///
    /// # Safety
    ///
    /// `payload` must be null-checked already; engines that keep in-band
    /// control data will read it at a fixed offset from `payload`, so the
    /// caller must guarantee the address was produced by this allocator.
    unsafe fn lookup(&mut self, payload: NonNull<u8>) -> Option<Self::Block>;
}

/// Public contract shared by all allocators in this crate.
pub trait MemoryAllocator {
    /// Allocates `size` bytes and returns the payload address.
    ///
    /// Returns `None` when `size` is zero or no free block can satisfy the
    /// request; the allocator state is unchanged in both cases.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a previously allocated payload address.
    ///
    /// Freeing a null pointer succeeds without side effects. A pointer the
    /// allocator does not recognize is rejected with an error and the
    /// allocator state stays untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload address previously returned by
    /// [`allocate`](Self::allocate) on this allocator and not freed since.
    unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), FreeError>;
}

impl<E: Engine> MemoryAllocator for E {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let size = E::Aligner::align(size);
        let Some(mut block) = self.find_free(size) else {
            log::debug!("failed to find a free block to hold {size} bytes");
            return None;
        };

        self.mark_used(&mut block);
        Some(block.payload())
    }

    unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        let Some(payload) = NonNull::new(ptr) else {
            return Ok(());
        };

        let Some(mut block) = (unsafe { self.lookup(payload) }) else {
            log::debug!("failed to find the block that owns pointer {ptr:p}");
            return ForeignPointerSnafu {
                addr: payload.addr().get(),
            }
            .fail();
        };

        self.mark_free(&mut block);
        self.put_free(block);
        Ok(())
    }
}
