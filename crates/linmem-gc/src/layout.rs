//! Region layout
//!
//! The linear memory is partitioned once at startup:
//!
//! ```text
//! 0            page          image_end   stack_start        stack_end
//! ┌────────────┬─────────────┬──────────┬──────────────────┬──────────────────┐
//! │ guard page │ image (RO*) │ padding  │ stack            │ allocator region │ ...
//! └────────────┴─────────────┴──────────┴──────────────────┴──────────────────┘
//!                                                          allocator_base ──► allocator_top
//! ```
//!
//! The image holds pre-populated data that is never collected (*except for its
//! writable slots, which are roots). Only the allocator region grows, always
//! by whole pages at the end of the memory.

use crate::address::{Address, WORD_SIZE, checked_align_up};
use crate::memory::RegionHost;

/// Boundaries of the partitioned linear memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    page_size: usize,
    image_start: Address,
    image_end: Address,
    stack_start: Address,
    stack_end: Address,
    allocator_base: Address,
    allocator_top: Address,
}

impl RegionLayout {
    /// Lay out guard page, image, stack and an empty allocator region.
    ///
    /// # Panics
    /// Panics if `page_size` is not a power of two of at least one word, or if
    /// the layout does not fit in the address space.
    pub fn compute_initial_layout(page_size: usize, image_size: usize, stack_pages: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= WORD_SIZE,
            "page size must be a power of two of at least one word"
        );

        let image_start = page_size;
        let image_end = image_start
            .checked_add(image_size)
            .expect("image does not fit in the address space");
        let stack_start =
            checked_align_up(image_end, page_size).expect("image does not fit in the address space");
        let stack_end = stack_pages
            .checked_mul(page_size)
            .and_then(|bytes| stack_start.checked_add(bytes))
            .expect("stack does not fit in the address space");

        Self {
            page_size,
            image_start: Address::new(image_start),
            image_end: Address::new(image_end),
            stack_start: Address::new(stack_start),
            stack_end: Address::new(stack_end),
            allocator_base: Address::new(stack_end),
            allocator_top: Address::new(stack_end),
        }
    }

    /// Page size the layout was computed for.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start of the image region (end of the guard page).
    pub fn image_start(&self) -> Address {
        self.image_start
    }

    /// End of the image region (not page aligned).
    pub fn image_end(&self) -> Address {
        self.image_end
    }

    /// Start of the stack region.
    pub fn stack_start(&self) -> Address {
        self.stack_start
    }

    /// End of the stack region.
    pub fn stack_end(&self) -> Address {
        self.stack_end
    }

    /// Start of the allocator region.
    pub fn allocator_base(&self) -> Address {
        self.allocator_base
    }

    /// Current end of the allocator region.
    pub fn allocator_top(&self) -> Address {
        self.allocator_top
    }

    /// Bytes currently in the allocator region.
    pub fn heap_bytes(&self) -> usize {
        self.allocator_top.offset_from(self.allocator_base)
    }

    /// Minimum bytes the host must provide before the heap exists.
    pub fn min_bytes(&self) -> usize {
        self.allocator_base.as_usize()
    }

    /// True if `addr` lies inside the image region.
    pub fn contains_image(&self, addr: Address) -> bool {
        addr >= self.image_start && addr < self.image_end
    }

    /// True if `addr` lies inside the allocator region.
    pub fn contains_heap(&self, addr: Address) -> bool {
        addr >= self.allocator_base && addr < self.allocator_top
    }

    /// Current top of the whole region.
    pub fn region_top<H: RegionHost>(&self, host: &H) -> Address {
        Address::new(host.byte_len())
    }

    /// Make sure the region extends at least to `target`.
    ///
    /// Returns the (possibly new) region top, or `None` if the host refused to
    /// grow. The region never shrinks.
    pub fn ensure_covers<H: RegionHost>(&self, host: &mut H, target: Address) -> Option<Address> {
        let top = self.region_top(host);
        if target <= top {
            return Some(top);
        }

        let wanted = checked_align_up(target.as_usize(), self.page_size)?;
        let pages = (wanted - top.as_usize()) / self.page_size;
        match host.grow(pages) {
            Some(old_pages) => {
                let new_top = self.region_top(host);
                tracing::debug!(
                    target: "linmem::alloc",
                    old_pages,
                    grown_pages = pages,
                    top = %new_top,
                    "linear memory grown"
                );
                Some(new_top)
            }
            None => {
                tracing::warn!(
                    target: "linmem::alloc",
                    pages,
                    top = %top,
                    "host refused to grow linear memory"
                );
                None
            }
        }
    }

    /// Move the allocator top to `top`.
    pub(crate) fn set_allocator_top(&mut self, top: Address) {
        debug_assert!(top.is_aligned(self.page_size), "allocator top must be page aligned");
        debug_assert!(top >= self.allocator_top, "allocator region never shrinks");
        self.allocator_top = top;
    }
}
