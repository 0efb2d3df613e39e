//! # linmem-gc
//!
//! Memory manager for a program running inside one growable linear memory.
//!
//! ## Design
//!
//! - **Region layout**: guard page, image, stack, then an allocator region
//!   that grows by whole pages at the end of the memory
//! - **Block allocator**: headered blocks, explicit doubly linked free list,
//!   first fit with splitting, forward coalescing
//! - **Collector**: stop-the-world tri-color mark/sweep with a fixed-capacity
//!   mark stack and heap rescans on overflow
//! - **Collaborators**: stack, reference and image walkers supplied by the
//!   runtime (see [`roots`])

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod block;
pub mod collector;
pub mod color;
pub mod error;
pub mod heap;
pub mod layout;
pub mod memory;
pub mod roots;
pub mod verify;

pub use address::Address;
pub use allocator::{AllocatorOptions, AllocatorStats, BlockAllocator, CANARY};
pub use block::BlockHeader;
pub use collector::{
    CollectionOutcome, Collector, GcCause, GcPhase, GcStats, GrowthOutcome, GrowthPolicy,
    MARK_STACK_CAPACITY,
};
pub use color::{Color, ColorHeader};
pub use error::{HeapError, Result};
pub use heap::{Heap, HeapConfig};
pub use layout::RegionLayout;
pub use memory::{LinearMemory, MemoryView, RegionHost, WASM_PAGE_SIZE};
pub use roots::{GcRoots, ImageRegion, NoRoots, ReferenceWalker, StackFrame, StackWalker};
pub use verify::AllocatorReport;
