//! Integration tests for kernel injection, caching and launch.
//!
//! The host platform tests run everywhere; the CUDA ones need a device and
//! a toolchain.

use std::sync::Arc;
use std::thread;

use candle_core::DType;
use expertlink_core::exchange::stride_copy::{stride_copy_host, StrideCopyKernels};
use expertlink_core::jit::{JitError, KernelInvoker, LaunchOverride};
use expertlink_core::ops::{cumsum_host, CumsumKernel};
use expertlink_core::runtime::cuda::CudaPlatform;
use expertlink_core::runtime::host::{scalar_usize, split_args, HostRuntime};
use expertlink_core::distributed::{SimBackend, SimNetwork};
use expertlink_core::runtime::{CallTrace, DeviceError, DeviceRuntime, ScalarArg, StreamKind};
use expertlink_core::{DeviceBuffer, ExchangeContext, RuntimeConfig};

// ─── Helpers ─────────────────────────────────────────────────────────────────

const AXPY: &str = r#"
// [thread_extent] blockIdx.x = 4
// [thread_extent] threadIdx.x = 128
extern "C" __global__ void axpy(float* out, const float* x, const float* y, float a, int n) {
    for (int i = blockIdx.x * blockDim.x + threadIdx.x; i < n; i += gridDim.x * blockDim.x)
        out[i] = a * x[i] + y[i];
}
"#;

fn axpy_reference(a: f32, x: &[f32], y: &[f32]) -> Vec<f32> {
    x.iter().zip(y).map(|(x, y)| a * x + y).collect()
}

fn host_platform(devices: usize) -> Arc<HostRuntime> {
    let runtime = Arc::new(HostRuntime::new(devices));
    runtime.register_kernel("axpy", |_, args| {
        let (bufs, scalars) = split_args("axpy", args, 3, 2)?;
        let ScalarArg::F32(a) = scalars[0] else {
            return Err(DeviceError::InvalidArguments {
                entry: "axpy".to_string(),
                reason: "scalar 0 must be f32".to_string(),
            });
        };
        let n = scalar_usize("axpy", &scalars, 1)?;
        let (x, y) = (bufs[1].to_vec::<f32>()?, bufs[2].to_vec::<f32>()?);
        bufs[0].write_slice(&axpy_reference(a, &x[..n], &y[..n]))
    });
    runtime
}

fn inputs(device: usize, n: usize) -> (Vec<f32>, Vec<f32>, DeviceBuffer, DeviceBuffer) {
    let x: Vec<f32> = (0..n).map(|i| (i as f32).sin()).collect();
    let y: Vec<f32> = (0..n).map(|i| 1.0 / (i as f32 + 1.0)).collect();
    let xb = DeviceBuffer::from_slice(device, &x, &[n]).unwrap();
    let yb = DeviceBuffer::from_slice(device, &y, &[n]).unwrap();
    (x, y, xb, yb)
}

// ─── Host platform ───────────────────────────────────────────────────────────

#[test]
fn test_invoke_is_bit_identical_to_reference() {
    let runtime = host_platform(1);
    let invoker = KernelInvoker::new(Arc::clone(&runtime), &RuntimeConfig::default());
    let handle = invoker.inject_source(AXPY).unwrap();
    let n = 1000;
    let (x, y, xb, yb) = inputs(0, n);
    let out = DeviceBuffer::zeros_host(0, DType::F32, &[n]);
    let scalars = [ScalarArg::F32(0.75), ScalarArg::I32(n as i32)];

    for _ in 0..2 {
        invoker
            .invoke(handle, 0, &[&out, &xb, &yb], &scalars, None)
            .unwrap();
        let expected = axpy_reference(0.75, &x, &y);
        let got = out.to_vec::<f32>().unwrap();
        assert!(got
            .iter()
            .zip(&expected)
            .all(|(a, b)| a.to_bits() == b.to_bits()));
    }
    assert_eq!(invoker.stats().compilations(), 1);
    assert_eq!(runtime.trace().compile_count("axpy"), 1);
}

#[test]
fn test_concurrent_first_use_compiles_once_per_device() {
    let runtime = host_platform(2);
    let invoker = KernelInvoker::new(Arc::clone(&runtime), &RuntimeConfig::default());
    let handle = invoker.inject_source(AXPY).unwrap();

    thread::scope(|scope| {
        for worker in 0..8 {
            let invoker = &invoker;
            scope.spawn(move || {
                let device = worker % 2;
                let (_, _, xb, yb) = inputs(device, 64);
                let out = DeviceBuffer::zeros_host(device, DType::F32, &[64]);
                invoker
                    .invoke(
                        handle,
                        device,
                        &[&out, &xb, &yb],
                        &[ScalarArg::F32(2.0), ScalarArg::I32(64)],
                        Some(LaunchOverride::blocks(&[1])),
                    )
                    .unwrap();
            });
        }
    });
    assert_eq!(invoker.stats().compilations(), 2);
    assert_eq!(invoker.stats().launches(), 8);
    assert_eq!(runtime.trace().compile_count("axpy"), 2);
}

#[test]
fn test_handles_are_never_reused() {
    let invoker = KernelInvoker::new(host_platform(1), &RuntimeConfig::default());
    let handles: Vec<_> = (0..4).map(|_| invoker.inject_source(AXPY).unwrap()).collect();
    for (i, a) in handles.iter().enumerate() {
        for b in &handles[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn test_source_without_entry_point_is_malformed() {
    let invoker = KernelInvoker::new(host_platform(1), &RuntimeConfig::default());
    for text in [
        "__device__ float twice(float x) { return 2 * x; }",
        "extern \"C\" __global__ void a(int* x) {}\nextern \"C\" __global__ void b(int* x) {}",
        "__global__ int not_void(int* x) {}",
    ] {
        assert!(matches!(
            invoker.inject_source(text),
            Err(JitError::MalformedSource(_))
        ));
    }
}

#[test]
fn test_context_injects_and_invokes_without_groups() {
    let runtime = host_platform(1);
    let backend = SimBackend::new(SimNetwork::new(), CallTrace::new());
    let ctx = ExchangeContext::new(runtime, backend, RuntimeConfig::default()).unwrap();
    let handle = ctx.inject_source(AXPY).unwrap();
    let (x, y, xb, yb) = inputs(0, 16);
    let out = DeviceBuffer::zeros_host(0, DType::F32, &[16]);
    ctx.invoke(
        handle,
        0,
        &[&out, &xb, &yb],
        &[ScalarArg::F32(-1.0), ScalarArg::I32(16)],
        None,
    )
    .unwrap();
    assert_eq!(out.to_vec::<f32>().unwrap(), axpy_reference(-1.0, &x, &y));
    assert!(!ctx.is_initialized());
}

// ─── CUDA platform ───────────────────────────────────────────────────────────

#[test]
#[ignore = "Requires CUDA"]
fn test_cuda_axpy_matches_reference() {
    let runtime = Arc::new(CudaPlatform::new().unwrap());
    let invoker = KernelInvoker::new(Arc::clone(&runtime), &RuntimeConfig::from_env().unwrap());
    let handle = invoker.inject_source(AXPY).unwrap();
    let n = 4096;
    let (x, y, _, _) = inputs(0, n);
    let stream = runtime.stream(0, StreamKind::Compute).unwrap();
    let upload = |values: &[f32]| {
        let buf = runtime.alloc(DType::F32, &[n], stream).unwrap();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        runtime.write_buffer(&buf, &bytes).unwrap();
        buf
    };
    let (xb, yb) = (upload(&x), upload(&y));
    let out = runtime.alloc(DType::F32, &[n], stream).unwrap();
    invoker
        .invoke(
            handle,
            0,
            &[&out, &xb, &yb],
            &[ScalarArg::F32(0.5), ScalarArg::I32(n as i32)],
            None,
        )
        .unwrap();
    runtime.synchronize(stream).unwrap();
    let got: Vec<f32> = runtime
        .read_buffer(&out)
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(got, axpy_reference(0.5, &x, &y));
}

#[test]
#[ignore = "Requires CUDA"]
fn test_cuda_stride_copy_and_cumsum() {
    let runtime = Arc::new(CudaPlatform::new().unwrap());
    let invoker = KernelInvoker::new(Arc::clone(&runtime), &RuntimeConfig::from_env().unwrap());
    let stride = StrideCopyKernels::install(&invoker, 0).unwrap();
    let stream = runtime.stream(0, StreamKind::Comm).unwrap();

    let bytes: Vec<u8> = (0..32 * 8).map(|i| (i % 251) as u8).collect();
    let input = runtime.alloc(DType::U8, &[bytes.len()], stream).unwrap();
    runtime.write_buffer(&input, &bytes).unwrap();
    let out = runtime.alloc(DType::U8, &[bytes.len()], stream).unwrap();
    stride
        .launch(&invoker, stream, &out, &input, 32, 4, 2)
        .unwrap();
    runtime.synchronize(stream).unwrap();
    let mut expected = vec![0u8; bytes.len()];
    stride_copy_host(&mut expected, &bytes, 32, 4, 2);
    assert_eq!(runtime.read_buffer(&out).unwrap(), expected);

    let cumsum = CumsumKernel::install(&invoker).unwrap();
    let mask: Vec<i64> = (0..3000 * 4).map(|i| (i % 3 == 0) as i64).collect();
    let compute = runtime.stream(0, StreamKind::Compute).unwrap();
    let mask_buf = runtime.alloc(DType::I64, &[3000, 4], compute).unwrap();
    let mask_bytes: Vec<u8> = mask.iter().flat_map(|v| v.to_ne_bytes()).collect();
    runtime.write_buffer(&mask_buf, &mask_bytes).unwrap();
    let locations = cumsum.run(&invoker, &mask_buf).unwrap();
    runtime.synchronize(compute).unwrap();
    let got: Vec<i64> = runtime
        .read_buffer(&locations)
        .unwrap()
        .chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(got, cumsum_host(&mask, 3000, 4));
}
