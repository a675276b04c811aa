//! Integration tests for the split-pipelined and hierarchical exchanges.
//!
//! Every participant runs on its own thread with its own simulated platform
//! and call trace; all of them share one simulated network.

use std::sync::Arc;
use std::thread;

use candle_core::DType;
use expertlink_core::distributed::{CollectiveBackend, DistributedError, SimBackend, SimNetwork};
use expertlink_core::exchange::Direction;
use expertlink_core::runtime::host::HostRuntime;
use expertlink_core::runtime::{CallTrace, StreamKind, TraceEvent};
use expertlink_core::{DeviceBuffer, ExchangeContext, RuntimeConfig};

type SimContext = ExchangeContext<HostRuntime, SimBackend>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Run `body` on `world_size` participants of one freshly formed global
/// group. Each trace is cleared after setup.
fn run_group<T, F>(world_size: usize, config: RuntimeConfig, body: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize, &SimContext, &CallTrace) -> T + Sync,
{
    let network = SimNetwork::new();
    let rendezvous = SimBackend::new(Arc::clone(&network), CallTrace::new())
        .unique_id()
        .unwrap();

    thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let (network, rendezvous, config, body) =
                    (Arc::clone(&network), rendezvous.clone(), config.clone(), &body);
                scope.spawn(move || {
                    let trace = CallTrace::new();
                    let runtime = Arc::new(HostRuntime::with_trace(1, trace.clone()));
                    let backend = SimBackend::new(network, trace.clone());
                    let mut ctx = ExchangeContext::new(runtime, backend, config).unwrap();
                    ctx.init_global(&rendezvous, world_size, rank, 0).unwrap();
                    trace.clear();
                    body(rank, &ctx, &trace)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn first_send(trace: &CallTrace) -> Option<std::ops::Range<usize>> {
    trace.events().into_iter().find_map(|e| match e {
        TraceEvent::Send { bytes, .. } => Some(bytes),
        _ => None,
    })
}

// ─── Split-pipelined scatter / gather ────────────────────────────────────────

#[test]
fn test_scatter_then_gather_restores_input() {
    for world_size in [1usize, 2, 8] {
        let num_split = 2;
        let nsps = world_size * 2;
        let len = num_split * nsps * 3;
        let results = run_group(world_size, RuntimeConfig::default(), |rank, ctx, _| {
            let values: Vec<f32> = (0..len).map(|i| (rank * 1000 + i) as f32).collect();
            let input = DeviceBuffer::from_slice(0, &values, &[len]).unwrap();
            let stages = ctx
                .scatter_async(&input, &[nsps, 3], num_split, nsps, Direction::Forward)
                .unwrap();
            let fused = ctx
                .gather_async(&stages, &[len], num_split, nsps, Direction::Forward)
                .unwrap();
            (values, fused.to_vec::<f32>().unwrap())
        });
        for (rank, (sent, back)) in results.into_iter().enumerate() {
            assert_eq!(sent, back, "world_size {world_size}, rank {rank}");
        }
    }
}

#[test]
fn test_scatter_delivers_slices_by_peer() {
    let results = run_group(2, RuntimeConfig::default(), |rank, ctx, _| {
        let values: Vec<i64> = (0..8).map(|k| 10 * rank as i64 + k).collect();
        let input = DeviceBuffer::from_slice(0, &values, &[8]).unwrap();
        let stages = ctx
            .scatter_async(&input, &[4], 2, 2, Direction::Forward)
            .unwrap();
        stages
            .iter()
            .map(|s| s.to_vec::<i64>().unwrap())
            .collect::<Vec<_>>()
    });
    // Rank r, stage s, slice j comes from fused slice (r * 2 + s) of rank j.
    assert_eq!(results[0], vec![vec![0, 1, 10, 11], vec![2, 3, 12, 13]]);
    assert_eq!(results[1], vec![vec![4, 5, 14, 15], vec![6, 7, 16, 17]]);
}

#[test]
fn test_stage_order_follows_direction() {
    for (direction, order, first) in [
        (Direction::Forward, vec![0, 1], 0..16),
        (Direction::Backward, vec![1, 0], 16..32),
    ] {
        let traces = run_group(2, RuntimeConfig::default(), |_, ctx, trace| {
            let input = DeviceBuffer::zeros_host(0, DType::I64, &[8]);
            ctx.scatter_async(&input, &[4], 2, 2, direction).unwrap();
            trace.clone()
        });
        for trace in traces {
            assert_eq!(trace.acquired_slots(StreamKind::Comm), vec![0]);
            assert_eq!(trace.released_slots(StreamKind::Comm), order);
            assert_eq!(first_send(&trace), Some(first.clone()));
        }
    }
}

#[test]
fn test_gather_waits_on_each_stage() {
    let traces = run_group(2, RuntimeConfig::default(), |_, ctx, trace| {
        let stages: Vec<_> = (0..3)
            .map(|_| DeviceBuffer::zeros_host(0, DType::F32, &[4]))
            .collect();
        ctx.gather_async(&stages, &[12], 3, 2, Direction::Backward)
            .unwrap();
        trace.clone()
    });
    for trace in traces {
        assert_eq!(trace.acquired_slots(StreamKind::Comm), vec![2, 1, 0]);
        assert_eq!(trace.released_slots(StreamKind::Comm), vec![0]);
    }
}

#[test]
fn test_indivisible_split_fails_before_device_work() {
    let results = run_group(2, RuntimeConfig::default(), |_, ctx, trace| {
        let input = DeviceBuffer::zeros_host(0, DType::F32, &[12]);
        let err = ctx
            .scatter_async(&input, &[4], 2, 3, Direction::Forward)
            .unwrap_err();
        (err, trace.events())
    });
    for (err, events) in results {
        assert!(matches!(err, DistributedError::InvalidSplit(_)));
        assert!(events.is_empty(), "unexpected device work: {events:?}");
    }
}

#[test]
fn test_outputs_are_registered_with_compute_stream() {
    let results = run_group(1, RuntimeConfig::default(), |_, ctx, _| {
        let input = DeviceBuffer::zeros_host(0, DType::F32, &[8]);
        let stages = ctx
            .scatter_async(&input, &[4], 2, 1, Direction::Forward)
            .unwrap();
        (input, stages)
    });
    let (input, stages) = &results[0];
    assert!(input.used_by().iter().any(|s| s.kind == StreamKind::Comm));
    for stage in stages {
        let kinds: Vec<_> = stage.used_by().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StreamKind::Comm, StreamKind::Compute]);
    }
}

// ─── Hierarchical all-to-all ─────────────────────────────────────────────────

/// Chunk `dest` of rank `src`, `chunk` values long.
fn chunk_values(src: usize, dest: usize, chunk: usize) -> Vec<u8> {
    (0..chunk).map(|e| (src * 31 + dest * 7 + e) as u8).collect()
}

fn hierarchical_case(chunk: usize) {
    let world_size = 8;
    let config = RuntimeConfig {
        local_size: Some(4),
        ..Default::default()
    };
    let results = run_group(world_size, config, |rank, ctx, trace| {
        let data: Vec<u8> = (0..world_size)
            .flat_map(|dest| chunk_values(rank, dest, chunk))
            .collect();
        let input = DeviceBuffer::from_slice(0, &data, &[data.len()]).unwrap();
        let output = ctx.hierarchical_exchange(&input).unwrap();
        let launches = trace
            .events()
            .iter()
            .filter(|e| matches!(e, TraceEvent::Launch { .. }))
            .count();
        (
            output.same_allocation(&input),
            output.to_vec::<u8>().unwrap(),
            launches,
        )
    });
    for (rank, (in_place, output, launches)) in results.into_iter().enumerate() {
        let expected: Vec<u8> = (0..world_size)
            .flat_map(|src| chunk_values(src, rank, chunk))
            .collect();
        assert!(in_place);
        assert_eq!(output, expected, "rank {rank}, chunk {chunk}");
        assert_eq!(launches, 2);
    }
}

#[test]
fn test_hierarchical_matches_flat_two_nodes_of_four() {
    hierarchical_case(32);
}

#[test]
fn test_hierarchical_with_byte_sized_chunks() {
    hierarchical_case(3);
}

#[test]
fn test_single_node_runs_flat() {
    let config = RuntimeConfig {
        local_size: Some(4),
        ..Default::default()
    };
    let results = run_group(4, config, |rank, ctx, trace| {
        let data: Vec<u8> = (0..4).flat_map(|dest| chunk_values(rank, dest, 2)).collect();
        let input = DeviceBuffer::from_slice(0, &data, &[data.len()]).unwrap();
        let output = ctx.hierarchical_exchange(&input).unwrap();
        let launched = trace
            .events()
            .iter()
            .any(|e| matches!(e, TraceEvent::Launch { .. }));
        (output.same_allocation(&input), output.to_vec::<u8>().unwrap(), launched)
    });
    for (rank, (in_place, output, launched)) in results.into_iter().enumerate() {
        let expected: Vec<u8> = (0..4).flat_map(|src| chunk_values(src, rank, 2)).collect();
        assert!(!in_place);
        assert!(!launched);
        assert_eq!(output, expected);
    }
}
