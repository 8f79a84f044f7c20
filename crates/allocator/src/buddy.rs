//! Binary-buddy allocator.
//!
//! The region is treated as one block of `BLOCK_SIZE << MAX_ORDER` bytes
//! that can be split in half recursively, down to blocks of `BLOCK_SIZE`
//! bytes. A block of order `k` is `BLOCK_SIZE << k` bytes; splitting a
//! block of order `k` yields two buddies of order `k - 1` that are merged
//! back as soon as both are free.
//!
//! # Tree Encoding
//!
//! All `2^(MAX_ORDER + 1) - 1` blocks form a perfect binary tree stored as
//! one *free bit* per node in the allocator object; the region itself
//! carries no metadata. A struct of child pointers would cost two words per
//! node, the bit vector costs one bit. The price is that one bit cannot
//! distinguish three states on its own, so a node's state is read together
//! with its children's bits:
//!
//! - **Free**: own bit set, both children's bits clear (for a leaf: own bit
//!   set). Searches at the children's order will not hand out a child of a
//!   free block, so a free block is never split needlessly.
//! - **Allocated**: own bit clear, both children's bits set (for a leaf:
//!   own bit clear). The children's set bits are phantoms; the search
//!   checks the parent before trusting a set bit.
//! - **Split**: own bit clear and not both children set. The children carry
//!   their own states.
//!
//! Initially only the root bit is set: the whole region is one free block.
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::{MemoryAllocator, buddy::BuddyAllocator};
//!
//! // 4 KiB region managed as blocks of 64 bytes to 4 KiB.
//! let mut region = [0u64; 512];
//! let mut buddy = BuddyAllocator::<6, 64>::new();
//! unsafe {
//!     buddy.init(region.as_mut_ptr().cast(), 4096).unwrap();
//! }
//!
//! let a = buddy.allocate(100).unwrap(); // takes a 128-byte block
//! let b = buddy.allocate(64).unwrap();
//! assert_ne!(a, b);
//! unsafe {
//!     buddy.free(a.as_ptr()).unwrap();
//!     buddy.free(b.as_ptr()).unwrap();
//! }
//! ```

use core::{fmt, ptr, ptr::NonNull};

use fixedbitset::FixedBitSet;
use snafu::ensure;

use crate::{
    align::Identity,
    engine::{BlockHandle, Engine},
    error::{InitError, RegionTooSmallSnafu},
};

/// A block handle: its start address and its node index in the tree.
pub struct TreeBlock {
    ptr: NonNull<u8>,
    index: usize,
}

impl BlockHandle for TreeBlock {
    fn payload(&self) -> NonNull<u8> {
        self.ptr
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NodeStatus {
    Free,
    Allocated,
    Split,
}

/// Buddy allocator over blocks of `BLOCK_SIZE << k` bytes for
/// `k` in `0..=MAX_ORDER`.
///
/// The managed region must hold at least one block of the maximum order,
/// i.e. `BLOCK_SIZE << MAX_ORDER` bytes; anything beyond that is ignored.
pub struct BuddyAllocator<const MAX_ORDER: usize, const BLOCK_SIZE: usize> {
    start: *mut u8,
    tree: FixedBitSet,
}

unsafe impl<const MAX_ORDER: usize, const BLOCK_SIZE: usize> Send
    for BuddyAllocator<MAX_ORDER, BLOCK_SIZE>
{
}

impl<const MAX_ORDER: usize, const BLOCK_SIZE: usize> Default
    for BuddyAllocator<MAX_ORDER, BLOCK_SIZE>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAX_ORDER: usize, const BLOCK_SIZE: usize> BuddyAllocator<MAX_ORDER, BLOCK_SIZE> {
    /// Number of nodes in the perfect binary tree.
    const NODE_COUNT: usize = {
        assert!(BLOCK_SIZE > 0, "the basic block size must be non-zero");
        assert!(
            MAX_ORDER < usize::BITS as usize - 1,
            "the maximum order does not fit a usize"
        );
        (1 << (MAX_ORDER + 1)) - 1
    };

    /// Size of the largest block, which is also the managed region size.
    pub const MAX_BLOCK_SIZE: usize = BLOCK_SIZE << MAX_ORDER;

    /// Creates an allocator that is not yet bound to a region.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: ptr::null_mut(),
            tree: FixedBitSet::new(),
        }
    }

    /// Binds the allocator to the region `[start, start + limit)`.
    ///
    /// Fails when the region cannot hold a block of the maximum order;
    /// warns when it holds more than that (the excess is never used).
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the region is valid, writable, and
    /// used by nothing else for as long as this allocator is in use.
    pub unsafe fn init(&mut self, start: *mut u8, limit: usize) -> Result<(), InitError> {
        ensure!(
            limit >= Self::MAX_BLOCK_SIZE,
            RegionTooSmallSnafu {
                limit,
                required: Self::MAX_BLOCK_SIZE,
            }
        );
        if limit > Self::MAX_BLOCK_SIZE {
            log::warn!(
                "region is {limit} bytes but the maximum block is {} bytes; {} bytes are wasted",
                Self::MAX_BLOCK_SIZE,
                limit - Self::MAX_BLOCK_SIZE
            );
        }

        self.start = start;
        self.tree.grow(Self::NODE_COUNT);
        self.tree.clear();
        self.tree.insert(0);
        Ok(())
    }

    // Tree navigation. Nodes of depth `d` occupy the contiguous index range
    // `[2^d - 1, 2^(d+1) - 2]`; node 0 is the root.

    fn left_child(index: usize) -> usize {
        index * 2 + 1
    }

    fn right_child(index: usize) -> usize {
        index * 2 + 2
    }

    fn parent(index: usize) -> usize {
        assert!(index != 0, "the root block has no parent");
        (index - 1) / 2
    }

    fn is_leaf(index: usize) -> bool {
        Self::left_child(index) >= Self::NODE_COUNT
    }

    fn is_left_child(index: usize) -> bool {
        assert!(index != 0, "the root block is no child");
        index & 1 == 1
    }

    fn buddy_of(index: usize) -> usize {
        if Self::is_left_child(index) {
            index + 1
        } else {
            index - 1
        }
    }

    fn depth_of(index: usize) -> usize {
        (index + 1).ilog2() as usize
    }

    fn order_of(index: usize) -> usize {
        MAX_ORDER - Self::depth_of(index)
    }

    fn first_index_at_depth(depth: usize) -> usize {
        (1 << depth) - 1
    }

    /// Size in bytes of a block of order `order`.
    fn size_of_order(order: usize) -> usize {
        BLOCK_SIZE << order
    }

    /// Order of the smallest block that holds `size` bytes. May exceed
    /// `MAX_ORDER` for oversized requests.
    fn size_to_order(size: usize) -> usize {
        let blocks = size.div_ceil(BLOCK_SIZE);
        blocks.next_power_of_two().ilog2() as usize
    }

    // Status checks; see the module docs for the encoding.

    fn is_free(&self, index: usize) -> bool {
        if Self::is_leaf(index) {
            return self.tree.contains(index);
        }
        self.tree.contains(index)
            && !self.tree.contains(Self::left_child(index))
            && !self.tree.contains(Self::right_child(index))
    }

    fn is_allocated(&self, index: usize) -> bool {
        if Self::is_leaf(index) {
            return !self.tree.contains(index);
        }
        !self.tree.contains(index)
            && self.tree.contains(Self::left_child(index))
            && self.tree.contains(Self::right_child(index))
    }

    fn is_split(&self, index: usize) -> bool {
        if Self::is_leaf(index) {
            return false;
        }
        !self.tree.contains(index)
            && !(self.tree.contains(Self::left_child(index))
                && self.tree.contains(Self::right_child(index)))
    }

    fn node_status(&self, index: usize) -> NodeStatus {
        if self.is_free(index) {
            NodeStatus::Free
        } else if self.is_allocated(index) {
            NodeStatus::Allocated
        } else {
            debug_assert!(self.is_split(index));
            NodeStatus::Split
        }
    }

    /// Splits a free block in two, returning the left half.
    fn split_block(&mut self, index: usize) -> usize {
        assert!(!Self::is_leaf(index), "cannot split an order-0 block");
        assert!(self.is_free(index), "attempt to split a non-free block");

        self.tree.set(index, false);
        self.tree.insert(Self::left_child(index));
        self.tree.insert(Self::right_child(index));
        Self::left_child(index)
    }

    /// Merges a free block with its free buddy, returning the parent.
    fn merge_block(&mut self, index: usize) -> usize {
        let buddy = Self::buddy_of(index);
        let parent = Self::parent(index);
        assert!(
            self.is_free(buddy),
            "attempt to merge block {index} with its non-free buddy"
        );

        self.tree.set(index, false);
        self.tree.set(buddy, false);
        self.tree.insert(parent);
        parent
    }

    /// Finds (or creates, by splitting) a free block of exactly `order`.
    fn find_free_block(&mut self, order: usize) -> Option<usize> {
        if order > MAX_ORDER {
            log::trace!("requested order {order} exceeds the maximum order {MAX_ORDER}");
            return None;
        }

        let depth = MAX_ORDER - order;
        let mut lo = Self::first_index_at_depth(depth);
        let hi = Self::first_index_at_depth(depth + 1) - 1;

        while lo <= hi {
            let Some(index) = (lo..=hi).find(|&i| self.tree.contains(i)) else {
                break;
            };

            if index == 0 {
                // The root has no parent to double-check.
                return Some(index);
            }

            let parent = Self::parent(index);
            if self.is_allocated(parent) {
                // The set bit is a phantom encoding the parent's allocated
                // state. Skip the buddy as well when on the left child.
                lo = index + if Self::is_left_child(index) { 2 } else { 1 };
                log::trace!(
                    "free bit {index} is shadowed by allocated parent {parent}, \
                     continuing at {lo}"
                );
                continue;
            }

            assert!(
                self.is_split(parent),
                "parent of free block {index} must be split"
            );
            assert!(self.is_free(index), "block {index} must be free");
            return Some(index);
        }

        // No free block of this order; carve one out of the next order up.
        let upper = self.find_free_block(order + 1)?;
        log::trace!("splitting order-{} block {upper}", order + 1);
        Some(self.split_block(upper))
    }

    fn fmt_node(
        &self,
        f: &mut fmt::Formatter<'_>,
        index: usize,
        padding: &str,
        pointer: &str,
    ) -> fmt::Result {
        use alloc::{format, string::String};

        if index >= Self::NODE_COUNT {
            return Ok(());
        }

        let status = match self.node_status(index) {
            NodeStatus::Free => "Free",
            NodeStatus::Allocated => "Alloc",
            NodeStatus::Split => "Split",
        };
        writeln!(
            f,
            "{padding}{pointer}Block{index:02} [Order {}] ({status})",
            Self::order_of(index)
        )?;

        let child_padding = if index == 0 {
            String::from(padding)
        } else if Self::is_left_child(index) {
            format!("{padding}│   ")
        } else {
            format!("{padding}    ")
        };
        self.fmt_node(f, Self::left_child(index), &child_padding, "├───")?;
        self.fmt_node(f, Self::right_child(index), &child_padding, "└───")
    }
}

/// Renders the tree in preorder, one block per line with its status.
impl<const MAX_ORDER: usize, const BLOCK_SIZE: usize> fmt::Debug
    for BuddyAllocator<MAX_ORDER, BLOCK_SIZE>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, 0, "", "")
    }
}

impl<const MAX_ORDER: usize, const BLOCK_SIZE: usize> Engine
    for BuddyAllocator<MAX_ORDER, BLOCK_SIZE>
{
    type Block = TreeBlock;
    type Aligner = Identity;

    fn find_free(&mut self, size: usize) -> Option<TreeBlock> {
        let order = Self::size_to_order(size);
        log::trace!("request of {size} bytes needs a block of order {order}");

        let index = self.find_free_block(order)?;

        let depth = MAX_ORDER - order;
        let stride = index - Self::first_index_at_depth(depth);
        let offset = stride * Self::size_of_order(order);
        let ptr = NonNull::new(unsafe { self.start.add(offset) })?;
        Some(TreeBlock { ptr, index })
    }

    fn put_free(&mut self, block: TreeBlock) {
        // Walk up the tree, merging as long as the buddy is free too.
        let mut index = block.index;
        while index != 0 {
            let buddy = Self::buddy_of(index);
            if !self.is_free(buddy) {
                log::trace!("buddy {buddy} of block {index} is busy, no merge");
                break;
            }
            index = self.merge_block(index);
            log::trace!("merged buddies into block {index}");
        }
    }

    fn mark_used(&mut self, block: &mut TreeBlock) {
        self.tree.set(block.index, false);
        if !Self::is_leaf(block.index) {
            // Children must show the phantom pattern of an allocated block.
            self.tree.insert(Self::left_child(block.index));
            self.tree.insert(Self::right_child(block.index));
        }
    }

    fn mark_free(&mut self, block: &mut TreeBlock) {
        self.tree.insert(block.index);
        if !Self::is_leaf(block.index) {
            self.tree.set(Self::left_child(block.index), false);
            self.tree.set(Self::right_child(block.index), false);
        }
    }

    unsafe fn lookup(&mut self, payload: NonNull<u8>) -> Option<TreeBlock> {
        let addr = payload.addr().get();
        let base = self.start.addr();
        if addr < base || addr >= base + Self::MAX_BLOCK_SIZE {
            log::debug!("pointer {addr:#x} is outside the managed region");
            return None;
        }

        // Binary descent: at every level the pointer selects the half it
        // falls into, until it hits the start of an allocated block.
        let mut saddr = base;
        let mut index = 0;
        let mut order = MAX_ORDER;
        loop {
            if addr == saddr {
                assert!(
                    !self.is_free(index),
                    "resolved pointer {addr:#x} to free block {index}"
                );
                if self.is_allocated(index) {
                    return Some(TreeBlock {
                        ptr: payload,
                        index,
                    });
                }
                // The block is split; the pointer belongs to its left
                // descendant of some smaller order.
                debug_assert!(self.is_split(index));
                index = Self::left_child(index);
                order -= 1;
                continue;
            }

            if order == 0 {
                log::debug!("pointer {addr:#x} is not a block boundary");
                return None;
            }

            let half = Self::size_of_order(order - 1);
            if addr < saddr + half {
                index = Self::left_child(index);
            } else {
                saddr += half;
                index = Self::right_child(index);
            }
            order -= 1;
        }
    }
}
