use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quasar::{GlobalAllocator, LocalAllocator, STANDARD_OBJECT_MAX_SIZE};

// Pointer-free class: the visitor slot is zero.
static CLASS: [usize; 1] = [0];

fn class_descriptor() -> *mut u8 {
    CLASS.as_ptr() as *mut u8
}

pub fn bench_allocation(c: &mut Criterion) {
    let global: &'static GlobalAllocator = Box::leak(Box::new(GlobalAllocator::new(false)));
    let mut local = LocalAllocator::new(global);

    let mut group = c.benchmark_group("allocation");
    group.sample_size(50);

    for size in [16u32, 64, 200, 1024, 4096] {
        group.bench_function(BenchmarkId::new("standard", size), |b| {
            b.iter(|| black_box(local.allocate(size, class_descriptor())));
        });
    }

    group.bench_function("large", |b| {
        b.iter(|| {
            black_box(local.allocate_large_object(
                STANDARD_OBJECT_MAX_SIZE + 4096,
                class_descriptor(),
            ))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_allocation);
criterion_main!(benches);
