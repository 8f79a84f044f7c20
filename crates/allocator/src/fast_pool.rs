//! Fixed-size pool with an intrusive free list.
//!
//! Like [`BitmapPool`](crate::bitmap_pool::BitmapPool), this pool carves
//! the region into slots of `size_of::<T>()` bytes, but instead of a
//! bitmap it threads every free slot onto an intrusive list whose links
//! live in the slot's own leading bytes. Allocation pops the head and
//! freeing pushes the tail, so both are O(1).
//!
//! ```text
//! Free Slot Layout:
//! ┌───────────────────────────────────┬──────────────────────┐
//! │ Links (2 x pointer)               │ Remaining slot bytes │
//! │ ┌──────────────┬────────────────┐ │                      │
//! │ │ prev: *Slot  │ next: *Slot    │ │                      │
//! │ └──────────────┴────────────────┘ │                      │
//! └───────────────────────────────────┴──────────────────────┘
//! ```
//!
//! The slot type must be at least as large and as aligned as the two link
//! fields; both constraints are enforced at compile time. Once a slot is
//! handed out, all of its bytes belong to the caller. The pool keeps no
//! per-slot metadata at all, which also means it can never be extended to
//! page slots out.

use core::{marker::PhantomData, ptr::NonNull};

use snafu::ensure;

use crate::{
    align::Identity,
    engine::{BlockHandle, Engine, MemoryAllocator as _},
    error::{FreeError, InitError, RegionNotSlotMultipleSnafu},
    list::{LinkedList, Node},
};

/// The link fields at the start of every free slot.
type FreeSlot = Node<()>;

/// A slot handle; the slot address is the payload address.
pub struct Slot(NonNull<u8>);

impl BlockHandle for Slot {
    fn payload(&self) -> NonNull<u8> {
        self.0
    }
}

/// Fixed-size pool that recycles slots of type `T` through an intrusive
/// free list.
pub struct FastPool<T> {
    free_list: LinkedList<()>,
    _slots: PhantomData<*mut T>,
}

unsafe impl<T: Send> Send for FastPool<T> {}

impl<T> Default for FastPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FastPool<T> {
    const SLOT_SIZE: usize = {
        assert!(
            size_of::<T>() >= size_of::<FreeSlot>(),
            "slot type must be able to hold the intrusive free-list links"
        );
        assert!(
            align_of::<T>() >= align_of::<FreeSlot>(),
            "slot type must be aligned for the intrusive free-list links"
        );
        size_of::<T>()
    };

    /// Creates a pool that is not yet bound to a region.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_list: LinkedList::new(),
            _slots: PhantomData,
        }
    }

    /// Binds the pool to the region `[start, start + limit)` and threads
    /// every slot onto the free list in ascending address order.
    ///
    /// Fails when `limit` is not a multiple of the slot size.
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

        let mut current = start;
        let end = unsafe { start.add(limit) };
        while current < end {
            unsafe {
                self.free_list
                    .push_back(NonNull::new_unchecked(current.cast::<FreeSlot>()));
                current = current.add(slot_size);
            }
        }
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
        self.free_list.len
    }
}

impl<T> Engine for FastPool<T> {
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

        self.free_list.pop_front().map(|node| Slot(node.cast()))
    }

    fn put_free(&mut self, block: Slot) {
        unsafe {
            self.free_list.push_back(block.0.cast::<FreeSlot>());
        }
    }

    fn mark_used(&mut self, _block: &mut Slot) {
        // Membership in the free list is the only state there is.
    }

    fn mark_free(&mut self, _block: &mut Slot) {}

    unsafe fn lookup(&mut self, payload: NonNull<u8>) -> Option<Slot> {
        Some(Slot(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryAllocator;

    struct Frame {
        id: u64,
        len: u64,
    }

    const SLOT: usize = size_of::<Frame>();

    fn with_test_heap<F>(heap_size: usize, test_fn: F)
    where
        F: FnOnce(*mut u8),
    {
        unsafe {
            let layout = std::alloc::Layout::from_size_align(heap_size, 16).unwrap();
            let heap_start = std::alloc::alloc(layout);
            heap_start.write_bytes(0x11, heap_size);
            test_fn(heap_start);
            std::alloc::dealloc(heap_start, layout);
        }
    }

    #[test]
    fn init_rejects_uneven_region() {
        with_test_heap(SLOT * 4 + 1, |heap| unsafe {
            let mut pool = FastPool::<Frame>::new();
            assert!(matches!(
                pool.init(heap, SLOT * 4 + 1),
                Err(InitError::RegionNotSlotMultiple { .. })
            ));
        });
    }

    #[test]
    fn slots_come_out_in_address_order() {
        with_test_heap(SLOT * 8, |heap| unsafe {
            let mut pool = FastPool::<Frame>::new();
            pool.init(heap, SLOT * 8).unwrap();
            assert_eq!(pool.free_slots(), 8);

            let mut frames = Vec::new();
            for index in 0..8 {
                let frame = pool.allocate_one().unwrap();
                assert_eq!(frame.as_ptr().cast::<u8>(), heap.add(index * SLOT));
                assert_eq!(pool.free_slots(), 8 - index - 1);
                frames.push(frame);
            }

            assert_eq!(pool.free_list.len, 0);
            assert!(pool.allocate_one().is_none());
        });
    }

    #[test]
    fn freed_slots_are_recycled_in_fifo_order() {
        with_test_heap(SLOT * 8, |heap| unsafe {
            let mut pool = FastPool::<Frame>::new();
            pool.init(heap, SLOT * 8).unwrap();

            let frames: Vec<_> = (0..8).map(|_| pool.allocate_one().unwrap()).collect();
            assert!(pool.allocate_one().is_none());

            // Free the first and the last slot; they must come back in the
            // order they were freed.
            pool.free_one(frames[0]).unwrap();
            assert_eq!(pool.free_slots(), 1);
            pool.free_one(frames[7]).unwrap();
            assert_eq!(pool.free_slots(), 2);

            assert_eq!(pool.allocate_one().unwrap(), frames[0]);
            assert_eq!(pool.allocate_one().unwrap(), frames[7]);
            assert_eq!(pool.free_slots(), 0);
        });
    }

    #[test]
    fn free_count_plus_allocated_count_is_constant() {
        with_test_heap(SLOT * 8, |heap| unsafe {
            let mut pool = FastPool::<Frame>::new();
            pool.init(heap, SLOT * 8).unwrap();

            let mut held = Vec::new();
            for _ in 0..5 {
                held.push(pool.allocate_one().unwrap());
                assert_eq!(pool.free_slots() + held.len(), 8);
            }
            while let Some(frame) = held.pop() {
                pool.free_one(frame).unwrap();
                assert_eq!(pool.free_slots() + held.len(), 8);
            }
        });
    }

    #[test]
    fn allocated_slots_are_fully_writable() {
        with_test_heap(SLOT * 8, |heap| unsafe {
            let mut pool = FastPool::<Frame>::new();
            pool.init(heap, SLOT * 8).unwrap();

            let frame = pool.allocate_one().unwrap();
            frame.write(Frame { id: 7, len: 42 });
            assert_eq!(frame.as_ref().id, 7);
            assert_eq!(frame.as_ref().len, 42);
            pool.free_one(frame).unwrap();
        });
    }

    #[test]
    fn size_mismatch_is_rejected() {
        with_test_heap(SLOT * 8, |heap| unsafe {
            let mut pool = FastPool::<Frame>::new();
            pool.init(heap, SLOT * 8).unwrap();
            assert!(pool.allocate(SLOT / 2).is_none());
            assert_eq!(pool.free_slots(), 8);
        });
    }

    #[test]
    fn zero_size_and_null_free_are_no_ops() {
        with_test_heap(SLOT * 8, |heap| unsafe {
            let mut pool = FastPool::<Frame>::new();
            pool.init(heap, SLOT * 8).unwrap();
            assert!(pool.allocate(0).is_none());
            pool.free(core::ptr::null_mut()).unwrap();
            assert_eq!(pool.free_slots(), 8);
        });
    }
}
