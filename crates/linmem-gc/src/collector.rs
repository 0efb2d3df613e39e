//! Stop-the-world tri-color mark/sweep collector
//!
//! ## Phases
//!
//! ```text
//! Idle → Marking → Blackening → Sweeping → Growing → Idle
//! ```
//!
//! - **Marking**: shade every object referenced from a writable image slot or
//!   from a live root slot of a mutator frame (White → Gray)
//! - **Blackening**: depth-first through a fixed-capacity mark stack. Objects
//!   that do not fit on the stack stay Gray; when the stack runs dry while
//!   Gray objects remain, the heap is rescanned for them
//! - **Sweeping**: White objects are released, Black objects turn White for
//!   the next cycle, then adjacent free blocks are merged
//! - **Growing**: when the survivors fill more than the configured share of
//!   the allocator region, the region grows
//!
//! Marking neither recurses nor allocates: the mark stack lives inline in the
//! per-cycle state, and the rescan loop takes over whenever it overflows.

use std::time::Duration;

use crate::address::Address;
use crate::allocator::BlockAllocator;
use crate::block::{BlockHeader, HEADER_SIZE, MIN_BLOCK_SIZE, block_of, inner_of};
use crate::color::{Color, ColorHeader};
use crate::error::{HeapError, fatal};
use crate::memory::{MemoryView, RegionHost};
use crate::roots::{GcRoots, ImageRegion, ReferenceWalker, StackWalker};

/// Capacity of the mark stack.
pub const MARK_STACK_CAPACITY: usize = 128;

/// Collector phase.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No collection in progress
    Idle = 0,
    /// Shading objects referenced from roots
    Marking = 1,
    /// Scanning Gray objects until none remain
    Blackening = 2,
    /// Releasing White objects
    Sweeping = 3,
    /// Applying the growth heuristic
    Growing = 4,
}

/// Why a collection was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// A managed allocation found no free block
    AllocationFailure,
    /// Requested by the runtime or the program
    Explicit,
}

/// When and how much to grow after a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthPolicy {
    /// Grow when surviving bytes exceed this percentage of the heap
    pub threshold_percent: usize,
    /// Target heap size as a percentage of the current one
    pub growth_factor_percent: usize,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            threshold_percent: 75,
            growth_factor_percent: 200,
        }
    }
}

impl GrowthPolicy {
    /// Bytes to add for a heap of `heap_bytes` holding `used_bytes`
    /// survivors, or `None` when no growth is wanted.
    pub fn growth_for(&self, used_bytes: usize, heap_bytes: usize) -> Option<usize> {
        if heap_bytes == 0 {
            return None;
        }
        let occupied = used_bytes as u128 * 100;
        let threshold = self.threshold_percent as u128 * heap_bytes as u128;
        if occupied <= threshold {
            return None;
        }
        let extra = heap_bytes as u128 * self.growth_factor_percent.saturating_sub(100) as u128 / 100;
        match usize::try_from(extra) {
            Ok(0) => None,
            Ok(extra) => Some(extra),
            Err(_) => Some(usize::MAX),
        }
    }
}

/// Result of the growth step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthOutcome {
    /// The cycle was run without the growth step
    Skipped,
    /// Survivors stayed under the threshold
    NotNeeded,
    /// The allocator region grew
    Grew {
        /// Bytes added
        bytes: usize,
    },
    /// The host refused to grow; the collection itself still happened
    Failed {
        /// Bytes asked for
        requested: usize,
    },
}

/// Summary of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionOutcome {
    /// Why the cycle ran
    pub cause: GcCause,
    /// Bytes of released blocks (headers included)
    pub reclaimed_bytes: usize,
    /// Objects released
    pub freed_objects: usize,
    /// Bytes of surviving allocated blocks, raw blocks included
    pub live_bytes: usize,
    /// Objects that survived
    pub live_objects: usize,
    /// Objects blackened during marking
    pub marked_objects: usize,
    /// Full heap passes needed after mark stack overflow
    pub rescans: usize,
    /// Free blocks absorbed by coalescing
    pub merged_blocks: usize,
    /// Growth step result
    pub growth: GrowthOutcome,
}

/// Cumulative collector statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Number of collections
    pub collections: u64,
    /// Total pause time
    pub total_pause: Duration,
    /// Pause time of the last collection
    pub last_pause: Duration,
    /// Bytes reclaimed in the last collection
    pub last_reclaimed: usize,
    /// Bytes reclaimed across all collections
    pub total_reclaimed: usize,
    /// Objects marked in the last collection
    pub last_marked: usize,
    /// Growth attempts the host refused
    pub growth_failures: u64,
}

/// Fixed-capacity stack of Gray objects.
pub struct MarkStack {
    entries: [Address; MARK_STACK_CAPACITY],
    len: usize,
}

impl MarkStack {
    /// Empty stack.
    pub const fn new() -> Self {
        Self {
            entries: [Address::NULL; MARK_STACK_CAPACITY],
            len: 0,
        }
    }

    /// Push `object`; returns false when the stack is full.
    #[inline]
    pub fn push(&mut self, object: Address) -> bool {
        if self.len == MARK_STACK_CAPACITY {
            return false;
        }
        self.entries[self.len] = object;
        self.len += 1;
        true
    }

    /// Pop the most recently pushed object.
    #[inline]
    pub fn pop(&mut self) -> Option<Address> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.entries[self.len])
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for MarkStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-cycle marking state.
#[derive(Default)]
struct CollectionState {
    gray_count: usize,
    marked_objects: usize,
    rescans: usize,
    overflows: usize,
    stack: MarkStack,
}

#[derive(Default)]
struct SweepTotals {
    reclaimed_bytes: usize,
    freed_objects: usize,
    live_bytes: usize,
    live_objects: usize,
}

/// Pause clock. `wasm32-unknown-unknown` has no monotonic clock in std and
/// panics in `Instant::now`, so pauses read as zero there.
struct PauseTimer {
    #[cfg(not(all(target_arch = "wasm32", target_os = "unknown")))]
    start: std::time::Instant,
}

impl PauseTimer {
    fn start() -> Self {
        Self {
            #[cfg(not(all(target_arch = "wasm32", target_os = "unknown")))]
            start: std::time::Instant::now(),
        }
    }

    #[cfg(not(all(target_arch = "wasm32", target_os = "unknown")))]
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    fn elapsed(&self) -> Duration {
        Duration::ZERO
    }
}

/// Mark/sweep collector.
pub struct Collector {
    phase: GcPhase,
    in_progress: bool,
    policy: GrowthPolicy,
    stats: GcStats,
}

impl Collector {
    /// Create a collector with the given growth policy.
    pub fn new(policy: GrowthPolicy) -> Self {
        Self {
            phase: GcPhase::Idle,
            in_progress: false,
            policy,
            stats: GcStats::default(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// True while a cycle is running (or was abandoned by a panic).
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Growth policy.
    pub fn policy(&self) -> GrowthPolicy {
        self.policy
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Run a full cycle over `allocator`.
    ///
    /// With `grow == false` the growth step is skipped. Starting a cycle while
    /// another one is marked in progress is fatal.
    pub fn collect<H: RegionHost>(
        &mut self,
        allocator: &mut BlockAllocator<H>,
        roots: &GcRoots<'_>,
        cause: GcCause,
        grow: bool,
    ) -> CollectionOutcome {
        if self.in_progress {
            fatal(HeapError::ReentrantCollection);
        }
        self.in_progress = true;
        let timer = PauseTimer::start();

        tracing::debug!(
            target: "linmem::gc",
            ?cause,
            heap_bytes = allocator.heap_bytes(),
            used_bytes = allocator.used_bytes(),
            "GC cycle starting"
        );

        // Phase 1 + 2: mark from roots, then blacken until no Gray remains
        let mut state = CollectionState::default();
        self.phase = GcPhase::Marking;
        {
            let base = allocator.layout().allocator_base();
            let top = allocator.layout().allocator_top();
            let verify = allocator.options().verify;
            let mut marker = Marker {
                memory: allocator.memory_view(),
                base,
                top,
                verify,
                references: roots.references,
                image: roots.image,
                state: &mut state,
            };
            marker.scan_roots(roots.stack);

            self.phase = GcPhase::Blackening;
            marker.blacken_all();
        }

        // Phase 3: sweep, then merge free runs
        self.phase = GcPhase::Sweeping;
        let totals = sweep(allocator);
        let mut merged_blocks = allocator.coalesce_all();

        // Phase 4: grow if the survivors crowd the heap
        let growth = if grow {
            self.phase = GcPhase::Growing;
            let growth = self.grow(allocator);
            if let GrowthOutcome::Grew { .. } = growth {
                merged_blocks += allocator.coalesce_all();
            }
            growth
        } else {
            GrowthOutcome::Skipped
        };

        self.phase = GcPhase::Idle;
        self.in_progress = false;

        let elapsed = timer.elapsed();
        self.stats.collections += 1;
        self.stats.total_pause += elapsed;
        self.stats.last_pause = elapsed;
        self.stats.last_reclaimed = totals.reclaimed_bytes;
        self.stats.total_reclaimed += totals.reclaimed_bytes;
        self.stats.last_marked = state.marked_objects;

        if let GrowthOutcome::Failed { requested } = growth {
            self.stats.growth_failures += 1;
            tracing::warn!(
                target: "linmem::gc",
                requested,
                heap_bytes = allocator.heap_bytes(),
                "heap growth after collection refused"
            );
        }

        tracing::info!(
            target: "linmem::gc",
            collection = self.stats.collections,
            ?cause,
            reclaimed_bytes = totals.reclaimed_bytes,
            freed_objects = totals.freed_objects,
            live_bytes = totals.live_bytes,
            marked = state.marked_objects,
            rescans = state.rescans,
            stack_overflows = state.overflows,
            pause_us = elapsed.as_micros() as u64,
            "GC cycle complete"
        );

        CollectionOutcome {
            cause,
            reclaimed_bytes: totals.reclaimed_bytes,
            freed_objects: totals.freed_objects,
            live_bytes: totals.live_bytes,
            live_objects: totals.live_objects,
            marked_objects: state.marked_objects,
            rescans: state.rescans,
            merged_blocks,
            growth,
        }
    }

    fn grow<H: RegionHost>(&self, allocator: &mut BlockAllocator<H>) -> GrowthOutcome {
        let before = allocator.heap_bytes();
        match self.policy.growth_for(allocator.used_bytes(), before) {
            None => GrowthOutcome::NotNeeded,
            Some(requested) => match allocator.grow_by(requested) {
                Some(_) => GrowthOutcome::Grew {
                    bytes: allocator.heap_bytes() - before,
                },
                None => GrowthOutcome::Failed { requested },
            },
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new(GrowthPolicy::default())
    }
}

/// Marking over a shared view of the region.
struct Marker<'m, 'r> {
    memory: MemoryView<'m>,
    base: Address,
    top: Address,
    verify: bool,
    references: &'r dyn ReferenceWalker,
    image: &'r dyn ImageRegion,
    state: &'m mut CollectionState,
}

impl Marker<'_, '_> {
    fn scan_roots(&mut self, stack: &dyn StackWalker) {
        let memory = self.memory;
        let image = self.image;

        image.for_each_writable_slot(&mut |slot| {
            let target = memory.read_address(slot);
            self.shade(target);
        });

        stack.for_each_frame(memory, &mut |frame| {
            stack.for_each_root_slot(frame, &mut |slot| {
                let target = memory.read_address(slot);
                self.shade(target);
            });
        });
    }

    /// White → Gray, pushing the object if the stack has room.
    fn shade(&mut self, object: Address) {
        if object.is_null() || self.image.contains(object) {
            return;
        }
        if self.verify {
            self.check_object(object);
        }

        let header = ColorHeader::from_raw(self.memory.read_word(object));
        if !header.is_white() {
            return;
        }
        self.memory.write_word(object, header.mark_gray().raw());
        self.state.gray_count += 1;
        if !self.state.stack.push(object) {
            // Stays Gray; picked up by the next rescan
            self.state.overflows += 1;
        }
    }

    /// Scan a Gray object's references, then turn it Black.
    fn blacken(&mut self, object: Address) {
        let memory = self.memory;
        let references = self.references;

        references.for_each_reference(memory, object, &mut |target| self.shade(target));
        if let Some(referent) = references.referent(memory, object) {
            self.shade(referent);
        }

        let header = ColorHeader::from_raw(memory.read_word(object));
        debug_assert!(header.is_gray(), "blackening a non-gray object at {object}");
        memory.write_word(object, header.mark_black().raw());
        self.state.gray_count -= 1;
        self.state.marked_objects += 1;
    }

    fn drain(&mut self) {
        while let Some(object) = self.state.stack.pop() {
            self.blacken(object);
        }
    }

    fn blacken_all(&mut self) {
        self.drain();

        while self.state.gray_count > 0 {
            self.state.rescans += 1;
            tracing::trace!(
                target: "linmem::gc",
                gray = self.state.gray_count,
                rescan = self.state.rescans,
                "mark stack overflowed, rescanning heap"
            );

            let mut found = false;
            let mut cursor = (self.base < self.top).then_some(self.base);
            while let Some(block) = cursor {
                let header = BlockHeader::from_raw(self.memory.read_word(block));
                if header.is_allocated() && header.is_object() {
                    let object = inner_of(block);
                    if ColorHeader::from_raw(self.memory.read_word(object)).is_gray() {
                        found = true;
                        self.blacken(object);
                        self.drain();
                        if self.state.gray_count == 0 {
                            break;
                        }
                    }
                }
                cursor = self.next_block(block, header);
            }

            if !found {
                fatal(HeapError::CorruptHeader {
                    address: self.base,
                    reason: "gray count does not match the heap",
                });
            }
        }
    }

    fn next_block(&self, block: Address, header: BlockHeader) -> Option<Address> {
        if header.size() < MIN_BLOCK_SIZE {
            fatal(HeapError::CorruptHeader {
                address: block,
                reason: "block smaller than the minimum block size",
            });
        }
        let next = block.add(header.size());
        (next < self.top).then_some(next)
    }

    /// Verification mode: references must name allocated object blocks.
    fn check_object(&self, object: Address) {
        let in_heap = object >= self.base.add(HEADER_SIZE) && object < self.top;
        if !in_heap || !object.is_aligned(HEADER_SIZE) {
            fatal(HeapError::CorruptHeader {
                address: object,
                reason: "reference outside the heap and the image",
            });
        }
        let header = BlockHeader::from_raw(self.memory.read_word(block_of(object)));
        if !header.is_allocated() || !header.is_object() {
            fatal(HeapError::CorruptHeader {
                address: object,
                reason: "reference to a block that is not a live object",
            });
        }
    }
}

/// Release White objects and reset Black ones.
fn sweep<H: RegionHost>(allocator: &mut BlockAllocator<H>) -> SweepTotals {
    let mut totals = SweepTotals::default();
    let mut cursor = allocator.first_block();

    while let Some(block) = cursor {
        let header = allocator.header(block);
        if header.is_allocated() {
            if header.is_object() {
                let object = inner_of(block);
                let color = ColorHeader::from_raw(allocator.read_word(object));
                match color.color() {
                    Color::White => {
                        allocator.release(block);
                        totals.reclaimed_bytes += header.size();
                        totals.freed_objects += 1;
                    }
                    Color::Black => {
                        allocator.write_word(object, color.mark_white().raw());
                        totals.live_bytes += header.size();
                        totals.live_objects += 1;
                    }
                    Color::Gray => fatal(HeapError::CorruptHeader {
                        address: object,
                        reason: "gray object left after marking",
                    }),
                }
            } else {
                totals.live_bytes += header.size();
            }
        }
        cursor = allocator.next_block(block);
    }

    totals
}
