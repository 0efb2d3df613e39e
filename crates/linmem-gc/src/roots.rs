//! Collaborator interfaces used by the collector.
//!
//! The collector does not know the mutator's frame layout or object layout.
//! The surrounding runtime supplies three walkers:
//!
//! - [`StackWalker`]: frames of the single mutator and their live root slots
//! - [`ReferenceWalker`]: outgoing references of an object
//! - [`ImageRegion`]: membership test for the immutable image and its writable
//!   reference slots
//!
//! Every callback runs inside a collection. Walkers only ever see a
//! [`MemoryView`], never the heap, so they cannot allocate.

use crate::address::Address;
use crate::memory::MemoryView;

/// One frame of the mutator's call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackFrame {
    /// Code address the frame is suspended at (selects the root map)
    pub code_address: Address,
    /// Base of the frame in the stack region
    pub frame_base: Address,
}

/// Walks the mutator's call stack.
pub trait StackWalker {
    /// Visit every frame, innermost first.
    fn for_each_frame(&self, memory: MemoryView<'_>, visit: &mut dyn FnMut(StackFrame));

    /// Visit the address of every slot of `frame` that holds a live reference.
    fn for_each_root_slot(&self, frame: StackFrame, visit: &mut dyn FnMut(Address));
}

/// Walks the reference fields of managed objects.
pub trait ReferenceWalker {
    /// Visit every outgoing reference of `object` (null references may be
    /// skipped or reported; the collector ignores them).
    fn for_each_reference(&self, memory: MemoryView<'_>, object: Address, visit: &mut dyn FnMut(Address));

    /// Referent of a reference-kind object, if `object` is one.
    ///
    /// Referents are treated as strongly reachable.
    fn referent(&self, _memory: MemoryView<'_>, _object: Address) -> Option<Address> {
        None
    }
}

/// The immutable, pre-populated part of memory.
pub trait ImageRegion {
    /// True if `address` lies in the image. Image objects are never collected
    /// and count as Black.
    fn contains(&self, address: Address) -> bool;

    /// Visit the address of every writable image slot that may hold a
    /// reference into the heap.
    fn for_each_writable_slot(&self, _visit: &mut dyn FnMut(Address)) {}
}

/// The walkers a collection needs, bundled.
#[derive(Clone, Copy)]
pub struct GcRoots<'a> {
    /// Stack walker
    pub stack: &'a dyn StackWalker,
    /// Interior reference walker
    pub references: &'a dyn ReferenceWalker,
    /// Image membership and writable slots
    pub image: &'a dyn ImageRegion,
}

impl<'a> GcRoots<'a> {
    /// Bundle three walkers.
    pub fn new(
        stack: &'a dyn StackWalker,
        references: &'a dyn ReferenceWalker,
        image: &'a dyn ImageRegion,
    ) -> Self {
        Self {
            stack,
            references,
            image,
        }
    }

    /// Use one runtime object that implements every walker.
    pub fn from_runtime<R>(runtime: &'a R) -> Self
    where
        R: StackWalker + ReferenceWalker + ImageRegion,
    {
        Self::new(runtime, runtime, runtime)
    }
}

/// A runtime with no frames, no references and an empty image.
///
/// Handy for raw-allocation users and for tearing a heap down: collecting
/// with `NoRoots` frees every managed object.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRoots;

impl StackWalker for NoRoots {
    fn for_each_frame(&self, _memory: MemoryView<'_>, _visit: &mut dyn FnMut(StackFrame)) {}

    fn for_each_root_slot(&self, _frame: StackFrame, _visit: &mut dyn FnMut(Address)) {}
}

impl ReferenceWalker for NoRoots {
    fn for_each_reference(&self, _memory: MemoryView<'_>, _object: Address, _visit: &mut dyn FnMut(Address)) {}
}

impl ImageRegion for NoRoots {
    fn contains(&self, _address: Address) -> bool {
        false
    }
}
