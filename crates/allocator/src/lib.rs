//! Memory allocators over caller-supplied regions.
//!
//! This crate provides four allocation engines for kernel-space and
//! embedded use. None of them owns its backing memory: the caller hands a
//! contiguous byte region to `init` once (statically reserved, or carved
//! out of a parent allocator), and the engine hands out sub-regions of it.
//! There is no system heap underneath and no growing; when the region is
//! exhausted, allocation fails with `None`.
//!
//! # Available Allocators
//!
//! ## [`BitmapPool`](bitmap_pool::BitmapPool)
//!
//! A fixed-size pool tracking `N` slots with one bit each. Best suited for:
//!
//! - Object pools with a known worst-case population
//! - Callers that want freed slots reused lowest-address-first
//!
//! **Performance**: O(N) allocation, O(1) free.
//!
//! ## [`FastPool`](fast_pool::FastPool)
//!
//! A fixed-size pool threading free slots onto an intrusive list. Best
//! suited for:
//!
//! - High-frequency allocate/free cycles of one object type
//! - Situations where a slot is at least two pointers large
//!
//! **Performance**: O(1) allocation and free.
//!
//! ## [`FreeListAllocator`](free_list::FreeListAllocator)
//!
//! A variable-size first-fit allocator with in-band headers and eager
//! coalescing. Best suited for:
//!
//! - General-purpose allocation with unpredictable sizes
//! - Low bookkeeping overhead (one header per block)
//!
//! **Performance**: O(n) allocation and free in the number of free blocks.
//!
//! ## [`BuddyAllocator`](buddy::BuddyAllocator)
//!
//! A binary-buddy allocator with power-of-two block sizes. Best suited for:
//!
//! - Workloads dominated by power-of-two-sized requests
//! - Bounded fragmentation with cheap coalescing
//!
//! **Performance**: allocation scans one tree level per order and splits at
//! most `MAX_ORDER` times; free merges at most `MAX_ORDER` times.
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::{MemoryAllocator, align::Multiple, free_list::FreeListAllocator};
//!
//! // Any properly aligned reserved region works; a static would, too.
//! let mut region = [0u64; 128];
//! let mut heap = FreeListAllocator::<Multiple<8>>::new();
//! unsafe {
//!     heap.init(region.as_mut_ptr().cast(), size_of_val(&region)).unwrap();
//! }
//!
//! let ptr = heap.allocate(100).unwrap();
//! // ... use the 100 (rounded up to 104) bytes at `ptr` ...
//! unsafe {
//!     heap.free(ptr.as_ptr()).unwrap();
//! }
//! ```
//!
//! # Choosing an Engine
//!
//! | Engine | Sizes | Allocate | Free | In-region metadata |
//! |--------|-------|----------|------|--------------------|
//! | `BitmapPool` | one | O(N) | O(1) | none |
//! | `FastPool` | one | O(1) | O(1) | links in free slots |
//! | `FreeListAllocator` | any | O(n) | O(n) | header per block |
//! | `BuddyAllocator` | powers of two | O(tree) | O(depth) | none |
//!
//! # Thread Safety
//!
//! All engines are `Send` but not `Sync`: they mutate their bookkeeping in
//! place and take `&mut self`. Callers that share an allocator across
//! threads must wrap it in a lock (see the `kmalloc` crate in this
//! workspace).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod align;
pub mod bitmap_pool;
pub mod buddy;
pub mod error;
pub mod fast_pool;
pub mod free_list;

mod engine;
mod list;

pub use engine::MemoryAllocator;
