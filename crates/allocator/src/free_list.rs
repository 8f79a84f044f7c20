//! Variable-size allocator backed by an address-ordered free list.
//!
//! Every managed block is preceded by an in-band header; free headers are
//! threaded onto a doubly linked list sorted by ascending address, which is
//! what makes eager coalescing possible: a freed block only ever has to
//! look at its two list neighbors to decide whether it touches them in
//! memory.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┬─────────────────┐
//! │ Header                                       │ Payload         │
//! │ ┌────────────┬────────────┬────────┬───────┐ │                 │
//! │ │ prev: link │ next: link │ size   │ magic │ │ `size` bytes    │
//! │ └────────────┴────────────┴────────┴───────┘ │                 │
//! └──────────────────────────────────────────────┴─────────────────┘
//! ```
//!
//! While a block is free, `prev`/`next` are real list links and `magic` is
//! `FREE`. While it is allocated, `magic` is `USED` and the link fields
//! carry the `FIRE` and `WOLF` canary tags instead; `free` refuses any
//! pointer whose header does not show all three tags, which catches most
//! double frees and header overwrites.
//!
//! # Algorithm
//!
//! - **Allocation**: first fit. The list is scanned from the lowest
//!   address; the first header with enough payload wins. If carving the
//!   request out of the winner leaves more than one header's worth of
//!   memory, the tail is split off as a new free block.
//! - **Deallocation**: the header is validated, re-inserted in address
//!   order, and merged with its predecessor and successor when they are
//!   exactly adjacent.
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) in the number of free blocks
//! - **Deallocation**: O(n) for the ordered insert, O(1) for the merges
//! - **Overhead**: one header per block, plus internal fragmentation up to
//!   the aligner's granularity

use core::{marker::PhantomData, ptr, ptr::NonNull};

use crate::{
    align::{Aligner, Identity},
    engine::{BlockHandle, Engine},
    error::InitError,
    list::{LinkedList, Node},
};

/// Control data carried by every header, after the two list links.
#[repr(C)]
pub(crate) struct HeaderData {
    /// Payload length in bytes, excluding the header itself.
    size: u32,
    /// Lifecycle tag; also borrowed as scratch space between the free-block
    /// search and the used-marking step.
    magic: u32,
}

/// The in-band header: two links followed by [`HeaderData`].
pub(crate) type Header = Node<HeaderData>;

/// Header footprint in bytes.
pub const HEADER_SIZE: usize = size_of::<Header>();

const MAGIC_USED: u32 = u32::from_be_bytes(*b"USED");
const MAGIC_FREE: u32 = u32::from_be_bytes(*b"FREE");
const LINK_FIRE: usize = u32::from_be_bytes(*b"FIRE") as usize;
const LINK_WOLF: usize = u32::from_be_bytes(*b"WOLF") as usize;

impl Header {
    /// Writes a fresh free header at `at` and returns it.
    ///
    /// # Safety
    ///
    /// `at` must point to writable memory with room for the header, aligned
    /// for `Header`.
    unsafe fn write_free(at: NonNull<u8>, size: u32) -> NonNull<Header> {
        let header = at.cast::<Header>();
        unsafe {
            header.write(Header {
                prev: None,
                next: None,
                data: HeaderData {
                    size,
                    magic: MAGIC_FREE,
                },
            });
        }
        header
    }

    /// Returns the payload address right after `header`.
    fn payload_of(header: NonNull<Header>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(header.as_ptr().add(1)) }.cast()
    }

    /// Returns the header preceding the payload address `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must point at least `HEADER_SIZE` bytes into memory this
    /// allocator manages.
    unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Header> {
        unsafe { NonNull::new_unchecked(payload.cast::<Header>().as_ptr().sub(1)) }
    }

    /// First address past the payload described by `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to a live header.
    unsafe fn end_addr(header: NonNull<Header>) -> usize {
        Self::payload_of(header).addr().get() + unsafe { header.as_ref().data.size } as usize
    }

    /// Stamps the used-state tags.
    fn set_used(mut header: NonNull<Header>) {
        let h = unsafe { header.as_mut() };
        h.data.magic = MAGIC_USED;
        h.prev = NonNull::new(ptr::without_provenance_mut(LINK_FIRE));
        h.next = NonNull::new(ptr::without_provenance_mut(LINK_WOLF));
    }

    /// Stamps the free-state tags and clears the links.
    fn set_free(mut header: NonNull<Header>) {
        let h = unsafe { header.as_mut() };
        h.data.magic = MAGIC_FREE;
        h.prev = None;
        h.next = None;
    }

    /// Recovers the header of an allocated payload, validating the canary
    /// tags. Any mismatch means the pointer is foreign, already freed, or
    /// the header has been overwritten.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload address inside this allocator's region.
    unsafe fn read_used(payload: NonNull<u8>) -> Option<NonNull<Header>> {
        let header = unsafe { Self::from_payload(payload) };
        let h = unsafe { header.as_ref() };

        if h.data.magic != MAGIC_USED {
            return None;
        }
        if h.prev.map(|link| link.addr().get()) != Some(LINK_FIRE) {
            return None;
        }
        if h.next.map(|link| link.addr().get()) != Some(LINK_WOLF) {
            return None;
        }
        Some(header)
    }
}

/// A handle to a managed block, i.e. its header.
pub struct HeaderBlock(NonNull<Header>);

impl BlockHandle for HeaderBlock {
    fn payload(&self) -> NonNull<u8> {
        Header::payload_of(self.0)
    }
}

/// Variable-size first-fit allocator with eager coalescing.
///
/// The aligner `A` adjusts every requested size before the free list is
/// searched. It must map [`HEADER_SIZE`] to itself: an aligner coarser
/// than the header would leave dead bytes between the header and the
/// payload, which the pointer arithmetic here cannot tolerate. This is
/// checked once at [`init`](Self::init).
pub struct FreeListAllocator<A = Identity> {
    free_list: LinkedList<HeaderData>,
    _aligner: PhantomData<A>,
}

unsafe impl<A> Send for FreeListAllocator<A> {}

impl<A> Default for FreeListAllocator<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> FreeListAllocator<A> {
    /// Creates an allocator that is not yet bound to a region.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_list: LinkedList::new(),
            _aligner: PhantomData,
        }
    }

    /// Number of free regions currently on the list.
    #[must_use]
    pub fn free_region_count(&self) -> usize {
        self.free_list.len
    }
}

impl<A: Aligner> FreeListAllocator<A> {
    /// Binds the allocator to the region `[start, start + limit)`.
    ///
    /// Always succeeds. When `start` is not aligned according to `A`, the
    /// managed range is shrunk to begin at the next aligned address (with
    /// a warning). A region too small to hold even one header is accepted
    /// with a warning and simply provides no memory.
    ///
    /// # Panics
    ///
    /// Panics when `A` does not map [`HEADER_SIZE`] to itself; that is a
    /// configuration bug, not a runtime condition.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the region is valid, writable,
    /// aligned for the header (pointer alignment), and used by nothing else
    /// for as long as this allocator is in use.
    pub unsafe fn init(&mut self, start: *mut u8, limit: usize) -> Result<(), InitError> {
        assert_eq!(
            A::align(HEADER_SIZE),
            HEADER_SIZE,
            "the aligner must map the header size to itself"
        );

        let addr = start.addr();
        let aligned = A::align(addr);
        if aligned != addr {
            log::warn!("region start {addr:#x} is not aligned, managing from {aligned:#x}");
        }
        let start = start.with_addr(aligned);
        let limit = limit.saturating_sub(aligned - addr);

        if limit <= HEADER_SIZE {
            log::warn!("region of {limit} bytes cannot hold a header, no memory is available");
            return Ok(());
        }
        let mut payload = limit - HEADER_SIZE;
        if payload > u32::MAX as usize {
            log::warn!(
                "region payload of {payload} bytes exceeds the addressable {} bytes, \
                 the excess is wasted",
                u32::MAX
            );
            payload = u32::MAX as usize;
        }

        let header =
            unsafe { Header::write_free(NonNull::new_unchecked(start), payload as u32) };
        unsafe {
            self.free_list.push_back(header);
        }
        Ok(())
    }

    /// Removes `block` from the free list, splitting off the unused tail as
    /// a new free block when it is big enough to be worth a header.
    ///
    /// The caller's actual (aligned) request size has been stashed in the
    /// block's `magic` field by the free-block search. When the leftover is
    /// too small to split, the block keeps its original `size`, slightly
    /// over-accounted, and is folded back in whole once it is freed again.
    unsafe fn remove_with_update(&mut self, mut block: NonNull<Header>) {
        unsafe {
            self.free_list.remove(block);

            let actual = block.as_ref().data.magic;
            let leftover = block.as_ref().data.size - actual;

            if leftover as usize > HEADER_SIZE {
                block.as_mut().data.size = actual;
                let rest = Header::write_free(
                    Header::payload_of(block).add(actual as usize),
                    leftover - HEADER_SIZE as u32,
                );
                self.free_list.insert_sorted(rest);
            }
        }
    }

    /// Inserts `block` in address order and eagerly merges it with its
    /// neighbors when they are exactly adjacent in memory.
    unsafe fn insert_with_merge(&mut self, block: NonNull<Header>) {
        unsafe {
            self.free_list.insert_sorted(block);

            let mut block = block;

            // Absorb the block into its predecessor.
            if let Some(mut prev) = block.as_ref().prev
                && Header::end_addr(prev) == block.addr().get()
            {
                prev.as_mut().data.size += HEADER_SIZE as u32 + block.as_ref().data.size;
                prev.as_mut().next = block.as_ref().next;
                match block.as_ref().next {
                    Some(mut next) => next.as_mut().prev = Some(prev),
                    None => self.free_list.tail = Some(prev),
                }
                self.free_list.len -= 1;
                block = prev;
            }

            // Absorb the successor into the block.
            if let Some(next) = block.as_ref().next
                && Header::end_addr(block) == next.addr().get()
            {
                block.as_mut().data.size += HEADER_SIZE as u32 + next.as_ref().data.size;
                match next.as_ref().next {
                    Some(mut after) => after.as_mut().prev = Some(block),
                    None => self.free_list.tail = Some(block),
                }
                block.as_mut().next = next.as_ref().next;
                self.free_list.len -= 1;
            }
        }
    }
}

impl<A: Aligner> Engine for FreeListAllocator<A> {
    type Block = HeaderBlock;
    type Aligner = A;

    fn find_free(&mut self, size: usize) -> Option<HeaderBlock> {
        debug_assert!(size <= u32::MAX as usize);
        let header = self
            .free_list
            .first_match(|data| data.size as usize >= size)?;

        // Stash the actual request into `magic`; the block is about to
        // leave the list and nothing reads the tag until it is restamped.
        unsafe {
            (*header.as_ptr()).data.magic = size as u32;
        }
        Some(HeaderBlock(header))
    }

    fn put_free(&mut self, block: HeaderBlock) {
        unsafe {
            self.insert_with_merge(block.0);
        }
    }

    fn mark_used(&mut self, block: &mut HeaderBlock) {
        unsafe {
            self.remove_with_update(block.0);
        }
        Header::set_used(block.0);
    }

    fn mark_free(&mut self, block: &mut HeaderBlock) {
        Header::set_free(block.0);
    }

    unsafe fn lookup(&mut self, payload: NonNull<u8>) -> Option<HeaderBlock> {
        unsafe { Header::read_used(payload) }.map(HeaderBlock)
    }
}
