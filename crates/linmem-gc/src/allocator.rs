//! Free-list block allocator
//!
//! The allocator region `[allocator_base, allocator_top)` is always tiled by
//! blocks that abut each other (see [`crate::block`] for the header format).
//!
//! ## Design
//!
//! - **Explicit free list**: doubly linked through the first two data words of
//!   each free block; the head is the most recently freed block
//! - **First fit**: allocation takes the first listed block that is big enough
//!   and splits off the remainder when it can hold a block of its own
//! - **Forward coalescing**: `free` merges with the following free blocks;
//!   `coalesce_all` merges every run after a sweep and whenever a search of
//!   the free list comes up empty
//! - **Page growth**: when nothing fits, the region grows by whole pages and
//!   the new span becomes one free block
//!
//! Bookkeeping is plain word arithmetic over the owned region; nothing here
//! allocates managed memory.

use crate::address::{Address, checked_align_up};
use crate::block::{
    BlockHeader, HEADER_SIZE, MIN_BLOCK_SIZE, NEXT_LINK_OFFSET, PREV_LINK_OFFSET, block_of,
    inner_of, padded_inner_size,
};
use crate::error::{HeapError, fatal};
use crate::layout::RegionLayout;
use crate::memory::{self, MemoryView, RegionHost};

/// Byte written over free memory when poisoning is enabled.
///
/// Its low bit is clear, so a poisoned word never decodes as an allocated
/// header.
pub const CANARY: u8 = 0xDE;

/// Debug switches for the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorOptions {
    /// Check pointers passed to `free` and the shape of the heap
    pub verify: bool,
    /// Fill free memory with [`CANARY`]
    pub poison: bool,
}

/// Byte counters of the allocator region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Size of the allocator region
    pub heap_bytes: usize,
    /// Bytes in allocated blocks (headers included)
    pub used_bytes: usize,
    /// Bytes in free blocks (headers included)
    pub free_bytes: usize,
    /// Size of the whole linear memory
    pub region_bytes: usize,
}

/// Block allocator over the allocator region of a linear memory.
pub struct BlockAllocator<H: RegionHost> {
    host: H,
    layout: RegionLayout,
    free_head: Address,
    used_bytes: usize,
    free_bytes: usize,
    options: AllocatorOptions,
}

impl<H: RegionHost> BlockAllocator<H> {
    /// Create an allocator with an empty allocator region.
    ///
    /// # Panics
    /// Panics if the host does not cover `layout.min_bytes()`, the layout was
    /// computed for a different page size, or the allocator region is not
    /// empty.
    pub fn new(host: H, layout: RegionLayout, options: AllocatorOptions) -> Self {
        assert_eq!(host.page_size(), layout.page_size(), "page size mismatch");
        assert!(
            host.byte_len() >= layout.allocator_top().as_usize(),
            "host does not cover the initial layout"
        );
        assert_eq!(layout.heap_bytes(), 0, "allocator region must start empty");
        Self {
            host,
            layout,
            free_head: Address::NULL,
            used_bytes: 0,
            free_bytes: 0,
            options,
        }
    }

    /// The host memory.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Current layout.
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Debug switches.
    pub fn options(&self) -> AllocatorOptions {
        self.options
    }

    /// Head of the free list (null when empty).
    pub fn free_list_head(&self) -> Address {
        self.free_head
    }

    /// Bytes in allocated blocks.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Bytes in free blocks.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Size of the allocator region.
    pub fn heap_bytes(&self) -> usize {
        self.layout.heap_bytes()
    }

    /// Snapshot of the byte counters.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            heap_bytes: self.heap_bytes(),
            used_bytes: self.used_bytes,
            free_bytes: self.free_bytes,
            region_bytes: self.host.byte_len(),
        }
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    /// Allocate a raw block with at least `requested` usable bytes.
    ///
    /// Grows the region when no free block fits. Returns the data pointer, or
    /// `None` for a zero-byte request or when growth is refused.
    pub fn allocate(&mut self, requested: usize) -> Option<Address> {
        self.allocate_block(requested, false, true)
    }

    /// Allocate a block for a managed object.
    ///
    /// With `may_grow == false` only the free list is searched, which lets the
    /// caller collect before the region grows.
    pub fn allocate_managed(&mut self, requested: usize, may_grow: bool) -> Option<Address> {
        self.allocate_block(requested, true, may_grow)
    }

    fn allocate_block(&mut self, requested: usize, is_object: bool, may_grow: bool) -> Option<Address> {
        if requested == 0 {
            return None;
        }
        let padded = padded_inner_size(requested)?;

        let block = match self.find_fit(padded) {
            Some(block) => block,
            None => match self.find_fit_after_coalescing(padded) {
                Some(block) => block,
                None if may_grow => self.grow_by(padded.checked_add(HEADER_SIZE)?)?,
                None => return None,
            },
        };
        Some(self.take(block, padded, is_object))
    }

    /// Merge runs left by backward-adjacent frees, then search again.
    fn find_fit_after_coalescing(&mut self, padded: usize) -> Option<Address> {
        if self.coalesce_all() == 0 {
            return None;
        }
        self.find_fit(padded)
    }

    /// First free block whose data area holds `padded` bytes.
    fn find_fit(&self, padded: usize) -> Option<Address> {
        let mut cursor = self.free_head;
        while !cursor.is_null() {
            let header = self.header(cursor);
            if self.options.verify {
                if let Err(error) = self.check_free_entry(cursor, header) {
                    fatal(error);
                }
            }
            if header.inner_size() >= padded {
                return Some(cursor);
            }
            cursor = self.next_link(cursor);
        }
        None
    }

    /// Hand out the free `block`, splitting off the tail when it is big enough.
    fn take(&mut self, block: Address, padded: usize, is_object: bool) -> Address {
        let header = self.header(block);
        let needed = HEADER_SIZE + padded;
        let remainder = header.size() - needed;

        let taken = if remainder >= MIN_BLOCK_SIZE {
            let rest = block.add(needed);
            self.write_header(rest, BlockHeader::free(remainder));
            self.replace_free(block, rest);
            needed
        } else {
            // Too small to stand alone: keep it as internal waste
            self.unlink_free(block);
            header.size()
        };

        self.write_header(block, BlockHeader::new(taken, true, is_object));
        self.free_bytes -= taken;
        self.used_bytes += taken;
        inner_of(block)
    }

    /// Extend the allocator region by at least `bytes`, rounded up to whole
    /// pages, and add the new span to the free list as one block.
    ///
    /// Returns the new block, or `None` if the host refuses to grow.
    pub fn grow_by(&mut self, bytes: usize) -> Option<Address> {
        if bytes == 0 {
            return None;
        }
        let old_top = self.layout.allocator_top();
        let target = old_top.checked_add(bytes)?;
        let new_top = Address::new(checked_align_up(target.as_usize(), self.layout.page_size())?);
        self.layout.ensure_covers(&mut self.host, new_top)?;
        self.layout.set_allocator_top(new_top);

        let size = new_top.offset_from(old_top);
        self.write_header(old_top, BlockHeader::free(size));
        self.poison(old_top.add(MIN_BLOCK_SIZE), size - MIN_BLOCK_SIZE);
        self.push_free(old_top);
        self.free_bytes += size;

        tracing::debug!(
            target: "linmem::alloc",
            grown_bytes = size,
            heap_bytes = self.heap_bytes(),
            "allocator region extended"
        );
        Some(old_top)
    }

    // ---------------------------------------------------------------
    // Release
    // ---------------------------------------------------------------

    /// Free the block owning `inner` and merge it with following free blocks.
    ///
    /// Freeing null does nothing. Freeing a block that is not allocated is
    /// fatal.
    pub fn free(&mut self, inner: Address) {
        if inner.is_null() {
            return;
        }
        let block = self.checked_block_of(inner);
        let header = self.header(block);
        if !header.is_allocated() {
            fatal(HeapError::DoubleFree(inner));
        }
        self.release(block);
        self.coalesce_forward(block);
    }

    /// Return an allocated block to the free list without coalescing.
    pub fn release(&mut self, block: Address) {
        let header = self.header(block);
        debug_assert!(header.is_allocated(), "releasing a free block at {block}");
        let size = header.size();

        self.write_header(block, BlockHeader::free(size));
        self.used_bytes -= size;
        self.free_bytes += size;
        self.poison(block.add(MIN_BLOCK_SIZE), size - MIN_BLOCK_SIZE);
        self.push_free(block);
    }

    /// Resize by allocate, copy, free. Never grows in place.
    ///
    /// A null pointer behaves like [`allocate`](Self::allocate). When the new
    /// allocation fails the old block is left untouched and `None` is returned.
    pub fn realloc(&mut self, inner: Address, new_size: usize) -> Option<Address> {
        if inner.is_null() {
            return self.allocate(new_size);
        }
        let old = self.header(self.checked_block_of(inner));
        if !old.is_allocated() {
            fatal(HeapError::DoubleFree(inner));
        }

        let fresh = self.allocate_block(new_size, old.is_object(), true)?;
        let len = old.inner_size().min(new_size);
        let src = inner.as_usize();
        self.host
            .bytes_mut()
            .copy_within(src..src + len, fresh.as_usize());
        self.free(inner);
        Some(fresh)
    }

    /// Merge every run of adjacent free blocks into its first block.
    ///
    /// Returns the number of blocks absorbed.
    pub fn coalesce_all(&mut self) -> usize {
        let mut merged = 0;
        let mut cursor = self.first_block();
        while let Some(block) = cursor {
            if !self.header(block).is_allocated() {
                merged += self.coalesce_forward(block);
            }
            cursor = self.next_block(block);
        }
        merged
    }

    /// Absorb the free blocks directly after the free `block`.
    fn coalesce_forward(&mut self, block: Address) -> usize {
        let top = self.layout.allocator_top();
        let mut header = self.header(block);
        let mut merged = 0;

        loop {
            let next = block.add(header.size());
            if next >= top {
                break;
            }
            let next_header = self.header(next);
            if next_header.is_allocated() {
                break;
            }
            self.unlink_free(next);
            self.poison(next, MIN_BLOCK_SIZE);
            header = header.with_size(header.size() + next_header.size());
            self.write_header(block, header);
            merged += 1;
        }
        merged
    }

    // ---------------------------------------------------------------
    // Free list
    // ---------------------------------------------------------------

    fn push_free(&mut self, block: Address) {
        let head = self.free_head;
        self.set_next_link(block, head);
        self.set_prev_link(block, Address::NULL);
        if !head.is_null() {
            self.set_prev_link(head, block);
        }
        self.free_head = block;
    }

    fn unlink_free(&mut self, block: Address) {
        let next = self.next_link(block);
        let prev = self.prev_link(block);
        if prev.is_null() {
            self.free_head = next;
        } else {
            self.set_next_link(prev, next);
        }
        if !next.is_null() {
            self.set_prev_link(next, prev);
        }
    }

    /// Put `new` in the free-list position held by `old`.
    fn replace_free(&mut self, old: Address, new: Address) {
        let next = self.next_link(old);
        let prev = self.prev_link(old);
        self.set_next_link(new, next);
        self.set_prev_link(new, prev);
        if prev.is_null() {
            self.free_head = new;
        } else {
            self.set_next_link(prev, new);
        }
        if !next.is_null() {
            self.set_prev_link(next, new);
        }
    }

    pub(crate) fn next_link(&self, block: Address) -> Address {
        Address::from_word(self.read_word(block.add(NEXT_LINK_OFFSET)))
    }

    pub(crate) fn prev_link(&self, block: Address) -> Address {
        Address::from_word(self.read_word(block.add(PREV_LINK_OFFSET)))
    }

    fn set_next_link(&mut self, block: Address, next: Address) {
        self.write_word(block.add(NEXT_LINK_OFFSET), next.to_word());
    }

    fn set_prev_link(&mut self, block: Address, prev: Address) {
        self.write_word(block.add(PREV_LINK_OFFSET), prev.to_word());
    }

    // ---------------------------------------------------------------
    // Block walk
    // ---------------------------------------------------------------

    /// First block of the allocator region, if the region is not empty.
    pub fn first_block(&self) -> Option<Address> {
        let base = self.layout.allocator_base();
        (base < self.layout.allocator_top()).then_some(base)
    }

    /// Block that follows `block`, if any.
    pub fn next_block(&self, block: Address) -> Option<Address> {
        let size = self.header(block).size();
        if size < MIN_BLOCK_SIZE {
            fatal(HeapError::CorruptHeader {
                address: block,
                reason: "block smaller than the minimum block size",
            });
        }
        let next = block.add(size);
        (next < self.layout.allocator_top()).then_some(next)
    }

    /// Iterate over every block in address order.
    pub fn blocks(&self) -> Blocks<'_, H> {
        Blocks {
            allocator: self,
            cursor: self.first_block(),
        }
    }

    // ---------------------------------------------------------------
    // Memory access
    // ---------------------------------------------------------------

    /// Header of the block at `block`.
    #[inline]
    pub fn header(&self, block: Address) -> BlockHeader {
        BlockHeader::from_raw(self.read_word(block))
    }

    #[inline]
    pub(crate) fn write_header(&mut self, block: Address, header: BlockHeader) {
        self.write_word(block, header.raw());
    }

    /// Usable bytes behind the data pointer `inner`.
    pub fn usable_size(&self, inner: Address) -> usize {
        self.header(self.checked_block_of(inner)).inner_size()
    }

    /// Read a word anywhere in the region.
    #[inline]
    #[track_caller]
    pub fn read_word(&self, addr: Address) -> u64 {
        memory::read_word(self.host.bytes(), addr)
    }

    /// Write a word anywhere in the region.
    #[inline]
    #[track_caller]
    pub fn write_word(&mut self, addr: Address, value: u64) {
        memory::write_word(self.host.bytes_mut(), addr, value);
    }

    /// Bytes `[addr, addr + len)` of the region.
    #[track_caller]
    pub fn read_bytes(&self, addr: Address, len: usize) -> &[u8] {
        let at = addr.as_usize();
        &self.host.bytes()[at..at + len]
    }

    /// Overwrite bytes starting at `addr`.
    #[track_caller]
    pub fn write_bytes(&mut self, addr: Address, bytes: &[u8]) {
        let at = addr.as_usize();
        self.host.bytes_mut()[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Fill `[addr, addr + len)` with `value`.
    #[track_caller]
    pub fn fill(&mut self, addr: Address, len: usize, value: u8) {
        let at = addr.as_usize();
        self.host.bytes_mut()[at..at + len].fill(value);
    }

    /// Shared cell view of the region, used while collecting.
    pub fn memory_view(&mut self) -> MemoryView<'_> {
        MemoryView::new(self.host.bytes_mut())
    }

    fn poison(&mut self, addr: Address, len: usize) {
        if self.options.poison && len > 0 {
            self.fill(addr, len, CANARY);
        }
    }

    /// Block of the data pointer `inner`, checked in verification mode.
    #[track_caller]
    pub(crate) fn checked_block_of(&self, inner: Address) -> Address {
        if self.options.verify {
            if let Err(error) = self.check_block_pointer(inner) {
                fatal(error);
            }
        }
        block_of(inner)
    }
}

/// Address-order iterator over the blocks of an allocator.
pub struct Blocks<'a, H: RegionHost> {
    allocator: &'a BlockAllocator<H>,
    cursor: Option<Address>,
}

impl<H: RegionHost> Iterator for Blocks<'_, H> {
    type Item = (Address, BlockHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.cursor?;
        let header = self.allocator.header(block);
        self.cursor = self.allocator.next_block(block);
        Some((block, header))
    }
}
