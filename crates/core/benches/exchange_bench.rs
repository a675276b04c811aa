//! Criterion benchmarks for the host reference paths of the exchange.
//!
//! Covers the stride permutation, split-plan slicing, the location cumsum and
//! the sparse dispatch operator, plus a single-participant scatter/gather
//! through the simulated platform.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use expertlink_core::distributed::{SimBackend, SimNetwork};
use expertlink_core::exchange::stride_copy::stride_copy_host;
use expertlink_core::exchange::{Direction, SplitPlan};
use expertlink_core::ops::cumsum_host;
use expertlink_core::ops::sparse_dispatch::{encode_forward, DispatchShape, Routing};
use expertlink_core::runtime::host::HostRuntime;
use expertlink_core::runtime::CallTrace;
use expertlink_core::{DeviceBuffer, ExchangeContext, RuntimeConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 251) as u8).collect()
}

/// Deterministic top-1 routing of `samples` samples over `experts` experts.
fn make_routing(samples: usize, experts: usize) -> (Vec<i64>, Vec<i64>) {
    let indices: Vec<i64> = (0..samples).map(|s| ((s * 7) % experts) as i64).collect();
    let mask: Vec<i64> = (0..samples * experts)
        .map(|i| (indices[i / experts] == (i % experts) as i64) as i64)
        .collect();
    let per_expert = cumsum_host(&mask, samples, experts);
    let locations = (0..samples)
        .map(|s| per_expert[s * experts + indices[s] as usize])
        .collect();
    (indices, locations)
}

// ---------------------------------------------------------------------------
// Host references
// ---------------------------------------------------------------------------

fn bench_stride_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("stride_copy_host");
    // (chunk bytes, local_size, nodes)
    for &(chunk, local, nodes) in &[(3, 8, 4), (1024, 8, 4), (16 * 1024, 8, 8)] {
        let input = make_bytes(chunk * local * nodes);
        let mut out = vec![0u8; input.len()];
        group.bench_with_input(
            BenchmarkId::new("chunk", chunk),
            &chunk,
            |b, _| {
                b.iter(|| stride_copy_host(&mut out, black_box(&input), chunk, local, nodes));
            },
        );
    }
    group.finish();
}

fn bench_split_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_plan_ranges");
    for &world_size in &[8usize, 64] {
        group.bench_with_input(
            BenchmarkId::new("world", world_size),
            &world_size,
            |b, &world_size| {
                b.iter(|| {
                    let plan = SplitPlan::new(
                        black_box(world_size * 4 * 4096),
                        4,
                        world_size,
                        world_size,
                        8,
                        Direction::Backward,
                    )
                    .unwrap();
                    let mut total = 0;
                    for stage in plan.stage_order() {
                        for j in 0..world_size {
                            total += plan.fused_range(j, stage).len() + plan.stage_range(j).start;
                        }
                    }
                    total
                });
            },
        );
    }
    group.finish();
}

fn bench_cumsum(c: &mut Criterion) {
    let mut group = c.benchmark_group("cumsum_host");
    for &samples in &[1024usize, 16_384] {
        let mask: Vec<i64> = (0..samples * 16).map(|i| (i % 3 == 0) as i64).collect();
        group.bench_with_input(BenchmarkId::new("samples", samples), &samples, |b, _| {
            b.iter(|| cumsum_host(black_box(&mask), samples, 16));
        });
    }
    group.finish();
}

fn bench_sparse_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse_encode_forward");
    let (experts, hidden) = (16, 256);
    for &samples in &[512usize, 4096] {
        let (indices, locations) = make_routing(samples, experts);
        let shape = DispatchShape {
            samples,
            hidden,
            capacity: samples / experts + 1,
        };
        let dispatched_len = experts * shape.capacity * hidden;
        let gates = vec![0.5f32; samples];
        let input: Vec<f32> = (0..samples * hidden).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut dispatched = vec![0f32; dispatched_len];
        group.bench_with_input(BenchmarkId::new("samples", samples), &samples, |b, _| {
            b.iter(|| {
                let routing =
                    Routing::new("bench", &indices, &locations, shape, dispatched_len).unwrap();
                encode_forward(&routing, &gates, black_box(&input), &mut dispatched).unwrap();
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Simulated exchange
// ---------------------------------------------------------------------------

fn bench_scatter_gather_single_rank(c: &mut Criterion) {
    let runtime = Arc::new(HostRuntime::new(1));
    let backend = SimBackend::new(SimNetwork::new(), CallTrace::new());
    let mut ctx = ExchangeContext::new(runtime, backend, RuntimeConfig::default())
        .expect("failed to create context");
    let id = ctx.rendezvous_id().expect("failed to create rendezvous id");
    ctx.init_global(&id, 1, 0, 0)
        .expect("failed to form single-rank group");

    let mut group = c.benchmark_group("scatter_gather_single_rank");
    for &len in &[4096usize, 1 << 20] {
        let values: Vec<f32> = (0..len).map(|i| i as f32).collect();
        let input = DeviceBuffer::from_slice(0, &values, &[len]).expect("failed to create input");
        group.bench_with_input(BenchmarkId::new("elems", len), &len, |b, &len| {
            b.iter(|| {
                let stages = ctx
                    .scatter_async(&input, &[len / 4], 4, 1, Direction::Forward)
                    .unwrap();
                ctx.gather_async(&stages, &[len], 4, 1, Direction::Forward)
                    .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_stride_copy,
    bench_split_plan,
    bench_cumsum,
    bench_sparse_forward,
    bench_scatter_gather_single_rank,
);
criterion_main!(benches);
