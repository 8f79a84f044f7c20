//! Kernel service routines over a region allocator.
//!
//! The engines in the `allocator` crate are single-threaded and take
//! `&mut self`; a kernel wants one global heap with C-style entry points
//! instead. [`KernelHeap`] provides exactly that serialization
//! layer: a spin lock around any engine, with `kmalloc`/`kfree` methods
//! that speak raw pointers.
//!
//! ```rust
//! use allocator::{align::Multiple, free_list::FreeListAllocator};
//! use kmalloc::KernelHeap;
//!
//! static HEAP: KernelHeap<FreeListAllocator<Multiple<8>>> =
//!     KernelHeap::new(FreeListAllocator::new());
//!
//! // At boot, hand the reserved region to the heap exactly once.
//! let region = Box::leak(vec![0u64; 512].into_boxed_slice());
//! HEAP.with(|heap| unsafe {
//!     heap.init(region.as_mut_ptr().cast(), size_of_val(region))
//! })
//! .unwrap();
//!
//! let ptr = HEAP.kmalloc(100);
//! assert!(!ptr.is_null());
//! assert!(unsafe { HEAP.kfree(ptr) });
//! ```
//!
//! # Integration with the Global Allocator
//!
//! A heap over the free-list engine also implements [`GlobalAlloc`], so it
//! can serve `alloc::boxed::Box` and friends once its region is bound:
//!
//! ```rust,ignore
//! use allocator::{align::Multiple, free_list::FreeListAllocator};
//! use kmalloc::KernelHeap;
//!
//! #[global_allocator]
//! static HEAP: KernelHeap<FreeListAllocator<Multiple<8>>> =
//!     KernelHeap::new(FreeListAllocator::new());
//! ```

#![cfg_attr(not(test), no_std)]

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use allocator::{MemoryAllocator, align::Aligner, free_list::FreeListAllocator};
use spin::Mutex;

/// A lock-protected global heap over any allocation engine.
pub struct KernelHeap<A> {
    inner: Mutex<A>,
}

impl<A> KernelHeap<A> {
    /// Wraps an engine; usable in statics.
    ///
    /// The engine still has to be bound to its memory region through
    /// [`with`](Self::with) before the first allocation.
    pub const fn new(engine: A) -> Self {
        Self {
            inner: Mutex::new(engine),
        }
    }

    /// Runs `f` with the locked engine, e.g. to call its `init`.
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<A: MemoryAllocator> KernelHeap<A> {
    /// Allocates `size` bytes, returning a null pointer on failure.
    pub fn kmalloc(&self, size: usize) -> *mut u8 {
        self.inner
            .lock()
            .allocate(size)
            .map_or(core::ptr::null_mut(), |ptr| ptr.as_ptr())
    }

    /// Frees a pointer obtained from [`kmalloc`](Self::kmalloc).
    ///
    /// Returns `false` when the allocator rejects the pointer. Freeing a
    /// null pointer succeeds.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`kmalloc`](Self::kmalloc) on this heap and not freed since.
    pub unsafe fn kfree(&self, ptr: *mut u8) -> bool {
        unsafe { self.inner.lock().free(ptr) }.is_ok()
    }
}

/// Global-allocator entry points for a free-list heap.
///
/// The engine aligns sizes, not addresses: a payload sits right behind its
/// pointer-aligned header, so requests for alignment above pointer
/// alignment are refused with a null pointer. The heap's aligner must
/// round sizes to a pointer multiple (for example `Multiple<8>` on 64-bit
/// targets) to keep successive headers pointer-aligned.
unsafe impl<A: Aligner> GlobalAlloc for KernelHeap<FreeListAllocator<A>> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > align_of::<usize>() {
            return ptr::null_mut();
        }
        self.kmalloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe {
            self.kfree(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator::{align::Multiple, buddy::BuddyAllocator, free_list::FreeListAllocator};

    static HEAP: KernelHeap<FreeListAllocator<Multiple<8>>> =
        KernelHeap::new(FreeListAllocator::new());

    #[test]
    fn static_heap_round_trip() {
        let region = Box::leak(vec![0u64; 512].into_boxed_slice());
        HEAP.with(|heap| unsafe { heap.init(region.as_mut_ptr().cast(), size_of_val(region)) })
            .unwrap();

        let ptr = HEAP.kmalloc(100);
        assert!(!ptr.is_null());
        unsafe {
            ptr.write_bytes(0xab, 100);

            // A pointer into the middle of the allocation is rejected.
            assert!(!HEAP.kfree(ptr.add(32)));

            assert!(HEAP.kfree(ptr));
            assert!(HEAP.kfree(core::ptr::null_mut()));
        }
    }

    #[test]
    fn global_alloc_honors_its_alignment_guarantee() {
        let region = Box::leak(vec![0u64; 512].into_boxed_slice());
        let heap: KernelHeap<FreeListAllocator<Multiple<8>>> =
            KernelHeap::new(FreeListAllocator::new());
        heap.with(|engine| unsafe { engine.init(region.as_mut_ptr().cast(), size_of_val(region)) })
            .unwrap();

        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = GlobalAlloc::alloc(&heap, layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr.addr() % 8, 0);

            // Alignment beyond what the in-band headers guarantee is
            // refused up front.
            let over_aligned = Layout::from_size_align(64, 64).unwrap();
            assert!(GlobalAlloc::alloc(&heap, over_aligned).is_null());

            GlobalAlloc::dealloc(&heap, ptr, layout);
        }

        assert_eq!(heap.with(|engine| engine.free_region_count()), 1);
    }

    #[test]
    fn works_with_any_engine() {
        let region = Box::leak(vec![0u64; 512].into_boxed_slice());
        let heap = KernelHeap::new(BuddyAllocator::<6, 64>::new());
        heap.with(|buddy| unsafe { buddy.init(region.as_mut_ptr().cast(), 4096) })
            .unwrap();

        let ptr = heap.kmalloc(4096);
        assert!(!ptr.is_null());
        assert!(heap.kmalloc(64).is_null());
        assert!(unsafe { heap.kfree(ptr) });
        assert!(!heap.kmalloc(64).is_null());
    }
}
