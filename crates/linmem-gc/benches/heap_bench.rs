//! Heap Performance Benchmarks
//!
//! Measures raw allocation throughput and collection pause times.
//!
//! Run with: `cargo bench -p linmem-gc`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use linmem_gc::{
    Address, ColorHeader, GcCause, GcRoots, Heap, HeapConfig, ImageRegion, LinearMemory,
    MemoryView, NoRoots, ReferenceWalker, StackFrame, StackWalker, WASM_PAGE_SIZE,
};
use std::hint::black_box;

/// Objects are a header word plus `descriptor[0]` reference fields; the only
/// roots are writable image slots.
struct BenchRuntime {
    image_start: Address,
    image_end: Address,
    globals: Vec<Address>,
}

impl StackWalker for BenchRuntime {
    fn for_each_frame(&self, _memory: MemoryView<'_>, _visit: &mut dyn FnMut(StackFrame)) {}

    fn for_each_root_slot(&self, _frame: StackFrame, _visit: &mut dyn FnMut(Address)) {}
}

impl ReferenceWalker for BenchRuntime {
    fn for_each_reference(&self, memory: MemoryView<'_>, object: Address, visit: &mut dyn FnMut(Address)) {
        let descriptor = ColorHeader::from_raw(memory.read_word(object)).type_descriptor();
        for i in 0..memory.read_word(descriptor) as usize {
            visit(memory.read_address(object.add(8 * (i + 1))));
        }
    }
}

impl ImageRegion for BenchRuntime {
    fn contains(&self, address: Address) -> bool {
        address >= self.image_start && address < self.image_end
    }

    fn for_each_writable_slot(&self, visit: &mut dyn FnMut(Address)) {
        self.globals.iter().copied().for_each(visit);
    }
}

/// Heap with a two-field node type and `globals` root slots.
fn create_heap(globals: usize) -> (Heap, BenchRuntime, Address) {
    let config = HeapConfig {
        image_size: 16 + 8 * globals,
        initial_heap_pages: 4,
        ..HeapConfig::default()
    };
    let mut heap = Heap::with_config(config, LinearMemory::with_max_pages(1024)).unwrap();
    let image_start = heap.layout().image_start();
    let node = image_start;
    heap.write_word(node, 2);

    let runtime = BenchRuntime {
        image_start,
        image_end: heap.layout().image_end(),
        globals: (0..globals).map(|i| image_start.add(16 + 8 * i)).collect(),
    };
    (heap, runtime, node)
}

/// Benchmark raw malloc/free throughput
fn malloc_free_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("malloc_free");

    for size in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("bytes", size), &size, |b, &size| {
            let config = HeapConfig {
                initial_heap_pages: 16,
                ..HeapConfig::default()
            };
            let mut heap = Heap::with_config(config, LinearMemory::with_max_pages(1024)).unwrap();
            let mut blocks = Vec::with_capacity(64);
            b.iter(|| {
                for _ in 0..64 {
                    blocks.push(heap.malloc(size).unwrap());
                }
                for block in blocks.drain(..).rev() {
                    heap.free(black_box(block));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark collection pause for binary trees of various sizes
fn gc_pause_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_pause");
    group.sample_size(20);

    for num_objects in [1_000usize, 10_000, 50_000] {
        group.bench_with_input(BenchmarkId::new("objects", num_objects), &num_objects, |b, &n| {
            b.iter_custom(|iters| {
                let mut total = std::time::Duration::ZERO;
                for _ in 0..iters {
                    let (mut heap, runtime, node) = create_heap(1);
                    let global = runtime.globals[0];

                    // Live binary tree in heap order plus as much garbage
                    let mut nodes = Vec::with_capacity(n);
                    for i in 0..n {
                        let object = heap
                            .allocate_object(&GcRoots::from_runtime(&runtime), node, 24)
                            .unwrap();
                        if i == 0 {
                            heap.write_word(global, object.to_word());
                        } else {
                            let parent: Address = nodes[(i - 1) / 2];
                            heap.write_word(parent.add(8 * (1 + (i - 1) % 2)), object.to_word());
                        }
                        nodes.push(object);
                        heap.allocate_object(&GcRoots::from_runtime(&runtime), node, 24).unwrap();
                    }

                    let start = std::time::Instant::now();
                    let outcome = heap.collect_completely(&GcRoots::from_runtime(&runtime), GcCause::Explicit);
                    total += start.elapsed();
                    black_box(outcome);
                }
                total
            });
        });
    }

    group.finish();
}

/// Benchmark tearing down a heap full of garbage
fn sweep_benchmark(c: &mut Criterion) {
    c.bench_function("sweep_all_garbage", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..iters {
                let (mut heap, _runtime, node) = create_heap(0);
                let roots = GcRoots::from_runtime(&NoRoots);
                let pages = heap.stats().heap_bytes / WASM_PAGE_SIZE;
                for _ in 0..(pages * WASM_PAGE_SIZE / 32) {
                    heap.allocate_object(&roots, node, 24).unwrap();
                }
                let start = std::time::Instant::now();
                black_box(heap.collect_completely(&roots, GcCause::Explicit));
                total += start.elapsed();
            }
            total
        });
    });
}

criterion_group!(benches, malloc_free_benchmark, gc_pause_benchmark, sweep_benchmark);
criterion_main!(benches);
