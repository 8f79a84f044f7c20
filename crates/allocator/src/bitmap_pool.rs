//! Fixed-size pool with a bitmap of free slots.
//!
//! The pool divides the region into `N` slots of `size_of::<T>()` bytes and
//! tracks their availability with one bit per slot, kept inside the
//! allocator object. The region itself holds nothing but raw slots, and a
//! set bit means the slot is free.
//!
//! Allocation scans for the lowest set bit, so it is O(N) in the worst
//! case; freeing sets a single bit and is O(1). Because no control data is
//! written into the slots, a freed slot's bytes are left exactly as the
//! caller last wrote them.
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::bitmap_pool::BitmapPool;
//!
//! let mut region = [0u64; 8];
//! let mut pool = BitmapPool::<u64, 8>::new();
//! unsafe {
//!     pool.init(region.as_mut_ptr().cast(), size_of_val(&region)).unwrap();
//! }
//!
//! let slot = pool.allocate_one().unwrap();
//! unsafe {
//!     slot.write(0xfeed);
//!     pool.free_one(slot).unwrap();
//! }
//! ```

use core::ptr::{self, NonNull};

use fixedbitset::FixedBitSet;
use snafu::ensure;

use crate::{
    align::Identity,
    engine::{BlockHandle, Engine, MemoryAllocator as _},
    error::{FreeError, InitError, RegionNotSlotMultipleSnafu, RegionTooSmallSnafu},
};

/// A slot handle: the slot address plus its bitmap index.
pub struct Slot {
    ptr: NonNull<u8>,
    index: usize,
}

impl BlockHandle for Slot {
    fn payload(&self) -> NonNull<u8> {
        self.ptr
    }
}

/// Fixed-size pool of `N` slots of type `T`, tracked by a free bitmap.
pub struct BitmapPool<T, const N: usize> {
    slots: *mut T,
    bitmap: FixedBitSet,
}

unsafe impl<T: Send, const N: usize> Send for BitmapPool<T, N> {}

impl<T, const N: usize> Default for BitmapPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> BitmapPool<T, N> {
    const SLOT_SIZE: usize = {
        assert!(size_of::<T>() > 0, "zero-sized slot types are not supported");
        size_of::<T>()
    };

    /// Creates a pool that is not yet bound to a region.
    ///
    /// All allocations fail until [`init`](Self::init) succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: ptr::null_mut(),
            bitmap: FixedBitSet::new(),
        }
    }

    /// Binds the pool to the region `[start, start + limit)`.
    ///
    /// Fails when `limit` is not a multiple of the slot size or holds fewer
    /// than `N` slots. A region holding more than `N` slots is accepted,
    /// but the excess is never handed out.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the region is valid, writable,
    /// aligned for `T`, and used by nothing else for as long as this pool
    /// is in use.
    pub unsafe fn init(&mut self, start: *mut u8, limit: usize) -> Result<(), InitError> {
        let slot_size = Self::SLOT_SIZE;
        ensure!(
            limit % slot_size == 0,
            RegionNotSlotMultipleSnafu { limit, slot_size }
        );
        ensure!(
            limit / slot_size >= N,
            RegionTooSmallSnafu {
                limit,
                required: N * slot_size,
            }
        );
        if limit / slot_size > N {
            log::warn!(
                "region holds {} slots but only {N} are managed; {} bytes are wasted",
                limit / slot_size,
                limit - N * slot_size
            );
        }

        self.slots = start.cast();
        self.bitmap.grow(N);
        self.bitmap.insert_range(..);
        Ok(())
    }

    /// Allocates one slot and returns it as a typed pointer.
    pub fn allocate_one(&mut self) -> Option<NonNull<T>> {
        self.allocate(Self::SLOT_SIZE).map(NonNull::cast)
    }

    /// Releases a slot obtained from [`allocate_one`](Self::allocate_one).
    ///
    /// # Safety
    ///
    /// `slot` must have been returned by this pool and not freed since.
    pub unsafe fn free_one(&mut self, slot: NonNull<T>) -> Result<(), FreeError> {
        unsafe { self.free(slot.as_ptr().cast()) }
    }

    /// Number of slots currently available.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.bitmap.count_ones(..)
    }

    fn index_of(&self, payload: NonNull<u8>) -> usize {
        let offset = payload.addr().get() - self.slots.addr();
        debug_assert_eq!(offset % Self::SLOT_SIZE, 0);
        let index = offset / Self::SLOT_SIZE;
        debug_assert!(index < N);
        index
    }
}

impl<T, const N: usize> Engine for BitmapPool<T, N> {
    type Block = Slot;
    type Aligner = Identity;

    fn find_free(&mut self, size: usize) -> Option<Slot> {
        if size != Self::SLOT_SIZE {
            log::debug!(
                "inconsistent size: requested {size} bytes but every slot is {} bytes",
                Self::SLOT_SIZE
            );
            return None;
        }

        let index = self.bitmap.ones().next()?;
        let ptr = NonNull::new(unsafe { self.slots.add(index) })?.cast();
        Some(Slot { ptr, index })
    }

    fn put_free(&mut self, _block: Slot) {
        // The bitmap already reflects the slot's state.
    }

    fn mark_used(&mut self, block: &mut Slot) {
        self.bitmap.set(block.index, false);
    }

    fn mark_free(&mut self, block: &mut Slot) {
        self.bitmap.set(block.index, true);
    }

    unsafe fn lookup(&mut self, payload: NonNull<u8>) -> Option<Slot> {
        let index = self.index_of(payload);
        Some(Slot {
            ptr: payload,
            index,
        })
    }
}
