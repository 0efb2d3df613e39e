//! Heap verification
//!
//! Debug-only consistency checks over the allocator region. A full
//! [`BlockAllocator::verify`] pass walks every block, then the free list, and
//! cross-checks the two:
//!
//! - every header is 8-byte aligned with a size that is a multiple of 8, at
//!   least [`MIN_BLOCK_SIZE`] and inside the region, and the blocks tile the
//!   region exactly
//! - the reserved header bit is never set
//! - every free-list entry is a free block, appears once, and has a `prev`
//!   link naming its predecessor
//! - the free list holds exactly the free blocks
//! - byte counters match the walk
//! - with poisoning enabled, free data beyond the links holds the canary

use rustc_hash::FxHashSet;

use crate::address::Address;
use crate::allocator::{BlockAllocator, CANARY};
use crate::block::{BLOCK_ALIGN, BlockHeader, HEADER_SIZE, MIN_BLOCK_SIZE, block_of};
use crate::error::{HeapError, Result};
use crate::memory::RegionHost;

/// Summary of a successful verification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorReport {
    /// Blocks walked
    pub blocks: usize,
    /// Allocated blocks
    pub allocated_blocks: usize,
    /// Allocated blocks holding managed objects
    pub object_blocks: usize,
    /// Free blocks
    pub free_blocks: usize,
    /// Bytes in allocated blocks
    pub used_bytes: usize,
    /// Bytes in free blocks
    pub free_bytes: usize,
    /// Largest free block
    pub largest_free_block: usize,
}

fn corrupt(address: Address, reason: &'static str) -> HeapError {
    HeapError::CorruptHeader { address, reason }
}

impl<H: RegionHost> BlockAllocator<H> {
    /// Check every block and the free list.
    pub fn verify(&self) -> Result<AllocatorReport> {
        let base = self.layout().allocator_base();
        let top = self.layout().allocator_top();
        let mut report = AllocatorReport::default();
        let mut free_blocks: FxHashSet<Address> = FxHashSet::default();

        // Phase 1: walk blocks in address order
        let mut block = base;
        while block < top {
            let header = self.header(block);
            self.check_header(block, header)?;
            if block.add(header.size()) > top {
                return Err(corrupt(block, "block runs past the allocator top"));
            }

            report.blocks += 1;
            if header.is_allocated() {
                report.allocated_blocks += 1;
                report.used_bytes += header.size();
                if header.is_object() {
                    report.object_blocks += 1;
                }
            } else {
                if header.is_object() {
                    return Err(corrupt(block, "free block flagged as object"));
                }
                report.free_blocks += 1;
                report.free_bytes += header.size();
                report.largest_free_block = report.largest_free_block.max(header.size());
                free_blocks.insert(block);
                if self.options().poison {
                    self.check_canary(block, header)?;
                }
            }
            block = block.add(header.size());
        }

        // Phase 2: walk the free list
        let mut listed: FxHashSet<Address> = FxHashSet::default();
        let mut prev = Address::NULL;
        let mut cursor = self.free_list_head();
        while !cursor.is_null() {
            if !free_blocks.contains(&cursor) {
                return Err(corrupt(cursor, "free list entry is not a free block"));
            }
            if !listed.insert(cursor) {
                return Err(corrupt(cursor, "free list contains a cycle"));
            }
            if self.prev_link(cursor) != prev {
                return Err(corrupt(cursor, "free list prev link is inconsistent"));
            }
            prev = cursor;
            cursor = self.next_link(cursor);
        }
        if listed.len() != free_blocks.len() {
            let missing = free_blocks
                .iter()
                .copied()
                .filter(|block| !listed.contains(block))
                .min()
                .unwrap_or(base);
            return Err(corrupt(missing, "free block missing from the free list"));
        }

        // Phase 3: counters
        if report.used_bytes != self.used_bytes() || report.free_bytes != self.free_bytes() {
            return Err(corrupt(base, "byte counters disagree with the heap walk"));
        }

        Ok(report)
    }

    /// Check a single header against the region bounds.
    pub(crate) fn check_header(&self, block: Address, header: BlockHeader) -> Result<()> {
        if !block.is_aligned(BLOCK_ALIGN) {
            return Err(corrupt(block, "unaligned block header"));
        }
        if header.has_reserved_bit() {
            return Err(corrupt(block, "reserved header bit set"));
        }
        if header.size() < MIN_BLOCK_SIZE {
            return Err(corrupt(block, "block smaller than the minimum block size"));
        }
        if header.size() > self.heap_bytes() {
            return Err(corrupt(block, "block larger than the allocator region"));
        }
        Ok(())
    }

    /// Check a block reached through the free list.
    pub(crate) fn check_free_entry(&self, block: Address, header: BlockHeader) -> Result<()> {
        if !self.layout().contains_heap(block) {
            return Err(corrupt(block, "free list link outside the allocator region"));
        }
        self.check_header(block, header)?;
        if header.is_allocated() {
            return Err(corrupt(block, "allocated block on the free list"));
        }
        Ok(())
    }

    /// Check a data pointer handed back by the mutator.
    pub(crate) fn check_block_pointer(&self, inner: Address) -> Result<()> {
        if !inner.is_aligned(BLOCK_ALIGN) {
            return Err(corrupt(inner, "unaligned block pointer"));
        }
        let base = self.layout().allocator_base();
        if inner < base.add(HEADER_SIZE) || !self.layout().contains_heap(inner) {
            return Err(corrupt(inner, "pointer outside the allocator region"));
        }
        let block = block_of(inner);
        self.check_header(block, self.header(block))?;
        if !self.is_block_start(block) {
            return Err(corrupt(inner, "pointer does not start a block"));
        }
        Ok(())
    }

    fn is_block_start(&self, target: Address) -> bool {
        self.blocks()
            .map(|(block, _)| block)
            .take_while(|&block| block <= target)
            .any(|block| block == target)
    }

    fn check_canary(&self, block: Address, header: BlockHeader) -> Result<()> {
        let data = block.add(MIN_BLOCK_SIZE);
        let len = header.size() - MIN_BLOCK_SIZE;
        match self.read_bytes(data, len).iter().position(|&b| b != CANARY) {
            Some(offset) => Err(corrupt(data.add(offset), "free memory canary overwritten")),
            None => Ok(()),
        }
    }
}
