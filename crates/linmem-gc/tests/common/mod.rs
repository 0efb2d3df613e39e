//! Test runtime shared by the integration tests
//!
//! Object format understood by [`TestRuntime`]:
//!
//! ```text
//! object:     [ color header → descriptor ][ field 0 ][ field 1 ] ...
//! descriptor: [ reference field count ][ flags ]     (lives in the image)
//! ```
//!
//! A descriptor with [`REFERENCE_KIND`] set describes a reference object with
//! no ordinary fields and its referent in the word after the header.
//!
//! Frames are a shadow stack in the stack region. Each frame has a code
//! address whose root map lists the live slot offsets.

#![allow(dead_code)]

use std::collections::HashMap;

use linmem_gc::{
    Address, ColorHeader, GcRoots, Heap, HeapConfig, ImageRegion, LinearMemory, MemoryView,
    ReferenceWalker, Result, StackFrame, StackWalker,
};

pub const PAGE: usize = 4096;
pub const IMAGE_SIZE: usize = 1024;

/// Descriptor flag: the object is a reference object.
pub const REFERENCE_KIND: u64 = 1;

const DESCRIPTOR_SIZE: usize = 16;

/// Heap with verification and poisoning, an image and a small page cap.
pub fn debug_heap(max_pages: usize) -> Heap {
    let config = HeapConfig {
        image_size: IMAGE_SIZE,
        ..HeapConfig::debug()
    };
    Heap::with_config(config, LinearMemory::new(PAGE, 0, max_pages)).unwrap()
}

pub struct TestRuntime {
    image_start: Address,
    image_end: Address,
    image_cursor: Address,
    stack_cursor: Address,
    stack_end: Address,
    writable_slots: Vec<Address>,
    frames: Vec<StackFrame>,
    root_maps: HashMap<Address, Vec<usize>>,
    object_sizes: HashMap<Address, usize>,
}

impl TestRuntime {
    pub fn new(heap: &Heap) -> Self {
        let layout = heap.layout();
        Self {
            image_start: layout.image_start(),
            image_end: layout.image_end(),
            image_cursor: layout.image_start(),
            stack_cursor: layout.stack_start(),
            stack_end: layout.stack_end(),
            writable_slots: Vec::new(),
            frames: Vec::new(),
            root_maps: HashMap::new(),
            object_sizes: HashMap::new(),
        }
    }

    pub fn roots(&self) -> GcRoots<'_> {
        GcRoots::from_runtime(self)
    }

    fn reserve_image(&mut self, bytes: usize) -> Address {
        let at = self.image_cursor;
        assert!(at.add(bytes) <= self.image_end, "test image full");
        self.image_cursor = at.add(bytes);
        at
    }

    /// Define a type with `ref_fields` reference fields.
    pub fn define_type(&mut self, heap: &mut Heap, ref_fields: usize) -> Address {
        let descriptor = self.reserve_image(DESCRIPTOR_SIZE);
        heap.write_word(descriptor, ref_fields as u64);
        heap.write_word(descriptor.add(8), 0);
        self.object_sizes.insert(descriptor, 8 * (1 + ref_fields));
        descriptor
    }

    /// Define a reference-object type.
    pub fn define_reference_type(&mut self, heap: &mut Heap) -> Address {
        let descriptor = self.reserve_image(DESCRIPTOR_SIZE);
        heap.write_word(descriptor, 0);
        heap.write_word(descriptor.add(8), REFERENCE_KIND);
        self.object_sizes.insert(descriptor, 16);
        descriptor
    }

    /// Reserve a writable image slot, initially null.
    pub fn add_global(&mut self, heap: &mut Heap) -> Address {
        let slot = self.reserve_image(8);
        heap.write_word(slot, 0);
        self.writable_slots.push(slot);
        slot
    }

    /// Push a frame of `slots` words whose root map lists `live` offsets.
    ///
    /// Returns the frame base.
    pub fn push_frame(&mut self, heap: &mut Heap, slots: usize, live: &[usize]) -> Address {
        let base = self.stack_cursor;
        assert!(base.add(8 * slots) <= self.stack_end, "test stack overflow");
        for i in 0..slots {
            heap.write_word(base.add(8 * i), 0);
        }
        self.stack_cursor = base.add(8 * slots);

        let code_address = Address::new(0x100 * (self.frames.len() + 1));
        self.root_maps
            .insert(code_address, live.iter().map(|&slot| 8 * slot).collect());
        self.frames.push(StackFrame {
            code_address,
            frame_base: base,
        });
        base
    }

    pub fn pop_frame(&mut self) {
        let frame = self.frames.pop().expect("no frame to pop");
        self.root_maps.remove(&frame.code_address);
        self.stack_cursor = frame.frame_base;
    }

    /// Allocate an object of type `ty`, collecting with this runtime's roots
    /// if needed.
    pub fn alloc(&self, heap: &mut Heap, ty: Address) -> Result<Address> {
        let size = self.object_sizes[&ty];
        heap.allocate_object(&self.roots(), ty, size)
    }
}

impl StackWalker for TestRuntime {
    fn for_each_frame(&self, _memory: MemoryView<'_>, visit: &mut dyn FnMut(StackFrame)) {
        for frame in self.frames.iter().rev() {
            visit(*frame);
        }
    }

    fn for_each_root_slot(&self, frame: StackFrame, visit: &mut dyn FnMut(Address)) {
        if let Some(offsets) = self.root_maps.get(&frame.code_address) {
            for &offset in offsets {
                visit(frame.frame_base.add(offset));
            }
        }
    }
}

impl ReferenceWalker for TestRuntime {
    fn for_each_reference(&self, memory: MemoryView<'_>, object: Address, visit: &mut dyn FnMut(Address)) {
        let descriptor = ColorHeader::from_raw(memory.read_word(object)).type_descriptor();
        let count = memory.read_word(descriptor) as usize;
        for i in 0..count {
            visit(memory.read_address(object.add(8 * (i + 1))));
        }
    }

    fn referent(&self, memory: MemoryView<'_>, object: Address) -> Option<Address> {
        let descriptor = ColorHeader::from_raw(memory.read_word(object)).type_descriptor();
        let flags = memory.read_word(descriptor.add(8));
        (flags & REFERENCE_KIND != 0).then(|| memory.read_address(object.add(8)))
    }
}

impl ImageRegion for TestRuntime {
    fn contains(&self, address: Address) -> bool {
        address >= self.image_start && address < self.image_end
    }

    fn for_each_writable_slot(&self, visit: &mut dyn FnMut(Address)) {
        for &slot in &self.writable_slots {
            visit(slot);
        }
    }
}

// ---------------------------------------------------------------
// Field access
// ---------------------------------------------------------------

pub fn set_field(heap: &mut Heap, object: Address, index: usize, target: Address) {
    heap.write_word(object.add(8 * (index + 1)), target.to_word());
}

pub fn field(heap: &Heap, object: Address, index: usize) -> Address {
    Address::from_word(heap.read_word(object.add(8 * (index + 1))))
}

pub fn set_slot(heap: &mut Heap, slot: Address, target: Address) {
    heap.write_word(slot, target.to_word());
}

/// Addresses of all managed objects.
pub fn objects(heap: &Heap) -> Vec<Address> {
    let mut objects = Vec::new();
    heap.for_each_object(|object, _| objects.push(object));
    objects
}
