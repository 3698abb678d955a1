//! Benchmark: bitmap primitives on a realistic group bitmap.
//!
//! Exercises the helpers the COW hot path leans on: run-length probing
//! and the alloc-AND-NOT-exclude derivation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use snapfs_alloc::{bitmap_and_not, bitmap_count_free, bitmap_find_contiguous, bitmap_run_len};

/// 4096 bytes (32768 bits), ~5% free blocks scattered in clusters.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; 4096];
    let mut pos = 100_usize;
    while pos + 32 < 32768 {
        for i in pos..pos + 32 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
    }
    bm
}

/// A sparse exclude mask: every 97th bit set.
fn make_mask() -> Vec<u8> {
    let mut bm = vec![0u8; 4096];
    let mut i = 0;
    while i < 32768 {
        bm[i / 8] |= 1 << (i % 8);
        i += 97;
    }
    bm
}

fn bench_run_len(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("bitmap_run_len", |b| {
        b.iter(|| black_box(bitmap_run_len(black_box(&bm), 32768, black_box(200), true, 4096)));
    });
}

fn bench_count_free(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("bitmap_count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), 32768)));
    });
}

fn bench_find_contiguous(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("bitmap_find_contiguous_16", |b| {
        b.iter(|| black_box(bitmap_find_contiguous(black_box(&bm), 32768, 16)));
    });
}

fn bench_and_not(c: &mut Criterion) {
    let alloc = make_bitmap();
    let mask = make_mask();
    let mut dst = vec![0u8; 4096];
    c.bench_function("bitmap_and_not_4k", |b| {
        b.iter(|| {
            bitmap_and_not(black_box(&mut dst), black_box(&alloc), black_box(&mask));
        });
    });
}

criterion_group!(
    benches,
    bench_run_len,
    bench_count_free,
    bench_find_contiguous,
    bench_and_not,
);
criterion_main!(benches);
