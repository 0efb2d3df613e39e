//! The heap: layout, allocator and collector behind one owner
//!
//! One `Heap` is created per linear memory at startup and threaded through
//! the runtime by reference. Raw blocks (`malloc`/`free`/`realloc`) are managed
//! explicitly by the mutator; managed objects (`allocate_object`) are reclaimed
//! by the collector.
//!
//! ## Managed allocation
//!
//! 1. Search the free list without growing
//! 2. On failure, collect (`GcCause::AllocationFailure`), growing if the
//!    survivors crowd the heap
//! 3. Search again, growing the region if needed
//! 4. Report `OutOfMemory`
//!
//! Objects handed out earlier survive step 2 only if they are reachable from
//! the roots passed in.

use crate::address::{Address, WORD_SIZE};
use crate::allocator::{AllocatorOptions, AllocatorStats, BlockAllocator};
use crate::collector::{CollectionOutcome, Collector, GcCause, GcPhase, GcStats, GrowthPolicy};
use crate::color::{Color, ColorHeader};
use crate::error::{HeapError, Result, fatal};
use crate::layout::RegionLayout;
use crate::memory::{LinearMemory, RegionHost};
use crate::roots::GcRoots;
use crate::verify::AllocatorReport;

/// Heap configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes reserved for the image (after the guard page)
    pub image_size: usize,
    /// Pages reserved for the mutator stack
    pub stack_pages: usize,
    /// Pages the allocator region starts with
    pub initial_heap_pages: usize,
    /// Grow after a collection when survivors exceed this percentage
    pub growth_threshold_percent: usize,
    /// Grow to this percentage of the current heap size
    pub growth_factor_percent: usize,
    /// Check pointers on free and verify the heap after every collection
    pub verify_heap: bool,
    /// Fill free memory with a canary byte
    pub poison_free_memory: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            image_size: 0,
            stack_pages: 1,
            initial_heap_pages: 1,
            growth_threshold_percent: 75,
            growth_factor_percent: 200,
            verify_heap: false,
            poison_free_memory: false,
        }
    }
}

impl HeapConfig {
    /// Verification and poisoning on, for tests and debugging.
    pub fn debug() -> Self {
        Self {
            verify_heap: true,
            poison_free_memory: true,
            ..Self::default()
        }
    }

    fn growth_policy(&self) -> GrowthPolicy {
        GrowthPolicy {
            threshold_percent: self.growth_threshold_percent,
            growth_factor_percent: self.growth_factor_percent,
        }
    }

    fn allocator_options(&self) -> AllocatorOptions {
        AllocatorOptions {
            verify: self.verify_heap,
            poison: self.poison_free_memory,
        }
    }
}

/// Allocator and collector over one linear memory.
pub struct Heap<H: RegionHost = LinearMemory> {
    config: HeapConfig,
    allocator: BlockAllocator<H>,
    collector: Collector,
}

impl<H: RegionHost> Heap<H> {
    /// Create a heap with the default configuration.
    pub fn new(host: H) -> Result<Self> {
        Self::with_config(HeapConfig::default(), host)
    }

    /// Lay out `host` and format the initial allocator region.
    ///
    /// Fails with `OutOfMemory` if the host cannot provide the guard page,
    /// image, stack and initial heap pages.
    pub fn with_config(config: HeapConfig, mut host: H) -> Result<Self> {
        let layout =
            RegionLayout::compute_initial_layout(host.page_size(), config.image_size, config.stack_pages);
        let min_bytes = layout.min_bytes();
        if layout.ensure_covers(&mut host, Address::new(min_bytes)).is_none() {
            return Err(HeapError::OutOfMemory { requested: min_bytes });
        }

        let mut allocator = BlockAllocator::new(host, layout, config.allocator_options());
        let initial = config.initial_heap_pages.saturating_mul(allocator.layout().page_size());
        if initial > 0 && allocator.grow_by(initial).is_none() {
            return Err(HeapError::OutOfMemory { requested: initial });
        }

        tracing::debug!(
            target: "linmem::gc",
            page_size = allocator.layout().page_size(),
            allocator_base = %allocator.layout().allocator_base(),
            heap_bytes = allocator.heap_bytes(),
            "heap initialized"
        );

        Ok(Self {
            collector: Collector::new(config.growth_policy()),
            config,
            allocator,
        })
    }

    // ---------------------------------------------------------------
    // Raw blocks
    // ---------------------------------------------------------------

    /// Allocate a raw block of at least `size` bytes.
    ///
    /// Never collects. Returns `None` for `size == 0` or when the region
    /// cannot grow.
    pub fn malloc(&mut self, size: usize) -> Option<Address> {
        self.allocator.allocate(size)
    }

    /// Free a raw block. Null is ignored; freeing a free block is fatal.
    pub fn free(&mut self, ptr: Address) {
        self.allocator.free(ptr);
    }

    /// Resize a raw block by allocate, copy, free.
    pub fn realloc(&mut self, ptr: Address, new_size: usize) -> Option<Address> {
        self.allocator.realloc(ptr, new_size)
    }

    // ---------------------------------------------------------------
    // Managed objects
    // ---------------------------------------------------------------

    /// Allocate a White object of `size` bytes whose first word refers to
    /// `type_descriptor`. The rest of the object is zeroed.
    pub fn allocate_object(
        &mut self,
        roots: &GcRoots<'_>,
        type_descriptor: Address,
        size: usize,
    ) -> Result<Address> {
        let size = size.max(WORD_SIZE);

        let object = match self.allocator.allocate_managed(size, false) {
            Some(object) => object,
            None => {
                self.run_collection(roots, GcCause::AllocationFailure, true);
                self.allocator
                    .allocate_managed(size, true)
                    .ok_or(HeapError::OutOfMemory { requested: size })?
            }
        };

        let usable = self.allocator.usable_size(object);
        self.allocator.fill(object, usable, 0);
        self.allocator
            .write_word(object, ColorHeader::new(type_descriptor).raw());
        Ok(object)
    }

    /// Run one full collection, growing the heap if the survivors crowd it.
    pub fn collect(&mut self, roots: &GcRoots<'_>, cause: GcCause) -> CollectionOutcome {
        self.run_collection(roots, cause, true)
    }

    /// Run one full collection without growing, leaving the minimal footprint.
    pub fn collect_completely(&mut self, roots: &GcRoots<'_>, cause: GcCause) -> CollectionOutcome {
        self.run_collection(roots, cause, false)
    }

    fn run_collection(&mut self, roots: &GcRoots<'_>, cause: GcCause, grow: bool) -> CollectionOutcome {
        let outcome = self.collector.collect(&mut self.allocator, roots, cause, grow);
        if self.config.verify_heap {
            if let Err(error) = self.allocator.verify() {
                fatal(error);
            }
        }
        outcome
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Check block tiling, the free list and the byte counters.
    pub fn verify(&self) -> Result<AllocatorReport> {
        self.allocator.verify()
    }

    /// Allocator byte counters.
    pub fn stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// Cumulative collector statistics.
    pub fn gc_stats(&self) -> &GcStats {
        self.collector.stats()
    }

    /// Current collector phase.
    pub fn phase(&self) -> GcPhase {
        self.collector.phase()
    }

    /// Current layout.
    pub fn layout(&self) -> &RegionLayout {
        self.allocator.layout()
    }

    /// Configuration the heap was built with.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The underlying allocator.
    pub fn allocator(&self) -> &BlockAllocator<H> {
        &self.allocator
    }

    /// The host memory.
    pub fn host(&self) -> &H {
        self.allocator.host()
    }

    /// Visit every managed object in address order with its color header.
    pub fn for_each_object(&self, mut f: impl FnMut(Address, ColorHeader)) {
        for (block, header) in self.allocator.blocks() {
            if header.is_allocated() && header.is_object() {
                let object = crate::block::inner_of(block);
                f(object, ColorHeader::from_raw(self.allocator.read_word(object)));
            }
        }
    }

    /// Color of a managed object. Image objects are always Black.
    pub fn color_of(&self, object: Address) -> Color {
        if self.layout().contains_image(object) {
            return Color::Black;
        }
        ColorHeader::from_raw(self.allocator.read_word(object)).color()
    }

    /// Usable bytes of the block behind `ptr`.
    pub fn usable_size(&self, ptr: Address) -> usize {
        self.allocator.usable_size(ptr)
    }

    // ---------------------------------------------------------------
    // Mutator memory access
    // ---------------------------------------------------------------

    /// Read a word.
    #[track_caller]
    pub fn read_word(&self, addr: Address) -> u64 {
        self.allocator.read_word(addr)
    }

    /// Write a word.
    #[track_caller]
    pub fn write_word(&mut self, addr: Address, value: u64) {
        self.allocator.write_word(addr, value);
    }

    /// Bytes `[addr, addr + len)`.
    #[track_caller]
    pub fn read_bytes(&self, addr: Address, len: usize) -> &[u8] {
        self.allocator.read_bytes(addr, len)
    }

    /// Overwrite bytes starting at `addr`.
    #[track_caller]
    pub fn write_bytes(&mut self, addr: Address, bytes: &[u8]) {
        self.allocator.write_bytes(addr, bytes);
    }

    /// Copy `image` to the start of the image region.
    ///
    /// # Panics
    /// Panics if `image` is larger than the configured image size.
    pub fn load_image(&mut self, image: &[u8]) {
        let start = self.layout().image_start();
        let capacity = self.layout().image_end().offset_from(start);
        assert!(
            image.len() <= capacity,
            "image of {} bytes exceeds the {capacity}-byte image region",
            image.len()
        );
        self.allocator.write_bytes(start, image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{HEADER_SIZE, block_of};
    use crate::roots::NoRoots;

    const PAGE: usize = 4096;

    fn heap(max_pages: usize) -> Heap {
        Heap::with_config(HeapConfig::debug(), LinearMemory::new(PAGE, 0, max_pages)).unwrap()
    }

    #[test]
    fn test_initial_heap() {
        let heap = heap(16);
        let layout = heap.layout();
        assert_eq!(layout.allocator_base(), Address::new(2 * PAGE));
        assert_eq!(heap.stats().heap_bytes, PAGE);
        assert_eq!(heap.stats().free_bytes, PAGE);
        assert_eq!(heap.stats().region_bytes, 3 * PAGE);
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert_eq!(heap.verify().unwrap().free_blocks, 1);
    }

    #[test]
    fn test_host_too_small() {
        let result = Heap::with_config(HeapConfig::default(), LinearMemory::new(PAGE, 0, 2));
        assert!(matches!(result, Err(HeapError::OutOfMemory { requested: PAGE })));

        let result = Heap::with_config(HeapConfig::default(), LinearMemory::new(PAGE, 0, 1));
        assert!(matches!(result, Err(HeapError::OutOfMemory { .. })));
    }

    #[test]
    fn test_allocate_object_header() {
        let mut heap = heap(16);
        let roots = GcRoots::from_runtime(&NoRoots);
        let descriptor = Address::new(0x1000);

        let object = heap.allocate_object(&roots, descriptor, 3).unwrap();
        let header = ColorHeader::from_raw(heap.read_word(object));
        assert_eq!(header.type_descriptor(), descriptor);
        assert!(header.is_white());
        assert!(heap.allocator().header(block_of(object)).is_object());
        // Raised to one word, padded to the minimum block
        assert_eq!(heap.usable_size(object), 16);
        assert_eq!(heap.read_word(object.add(8)), 0);
    }

    #[test]
    fn test_allocate_object_collects_before_growing() {
        let mut heap = heap(16);
        let roots = GcRoots::from_runtime(&NoRoots);
        let descriptor = Address::new(0x1000);

        // Fill the first page with unreachable objects
        let size = PAGE / 4 - HEADER_SIZE;
        for _ in 0..4 {
            heap.allocate_object(&roots, descriptor, size).unwrap();
        }
        assert_eq!(heap.stats().free_bytes, 0);

        heap.allocate_object(&roots, descriptor, size).unwrap();
        assert_eq!(heap.gc_stats().collections, 1);
        assert_eq!(heap.stats().heap_bytes, PAGE);
    }

    #[test]
    fn test_out_of_memory() {
        let mut heap = heap(3);
        let roots = GcRoots::from_runtime(&NoRoots);
        let result = heap.allocate_object(&roots, Address::new(0x1000), 2 * PAGE);
        assert_eq!(result, Err(HeapError::OutOfMemory { requested: 2 * PAGE }));
        assert!(heap.verify().is_ok());
    }

    #[test]
    fn test_color_of_image_is_black() {
        let config = HeapConfig {
            image_size: 64,
            ..HeapConfig::debug()
        };
        let mut heap = Heap::with_config(config, LinearMemory::new(PAGE, 0, 16)).unwrap();
        heap.load_image(&[0u8; 64]);
        assert_eq!(heap.color_of(heap.layout().image_start()), Color::Black);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_oversized_image_panics() {
        let mut heap = heap(16);
        heap.load_image(&[1u8; 8]);
    }
}
