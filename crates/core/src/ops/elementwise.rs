//! Elementwise `out = x + y`.
//!
//! One grid-stride kernel per element type. The host platform computes the
//! sum with candle on CPU tensors.

use candle_core::DType;

use super::{OpsError, Result};
use crate::buffer::DeviceBuffer;
use crate::jit::{self, KernelHandle, KernelInvoker, LaunchOverride};
use crate::runtime::host::{scalar_usize, split_args, HostRuntime};
use crate::runtime::{DeviceError, DeviceRuntime, ScalarArg, StreamKind};

const TEMPLATE: &str = r#"
// [thread_extent] threadIdx.x = 256
extern "C" __global__ void x_add_y_$N(
    const $T *__restrict__ x, const $T *__restrict__ y, $T *__restrict__ out, const size_t n) {
    for (size_t i = blockIdx.x * blockDim.x + threadIdx.x; i < n; i += gridDim.x * blockDim.x)
        out[i] = x[i] + y[i];
}
"#;

const THREADS: usize = 256;
const MAX_BLOCKS: usize = 65535;

const VARIANTS: [DType; 5] = [DType::F16, DType::F32, DType::F64, DType::I64, DType::U32];

fn names(dtype: DType) -> Option<(&'static str, &'static str)> {
    match dtype {
        DType::F16 => Some(("f16", "__half")),
        DType::F32 => Some(("f32", "float")),
        DType::F64 => Some(("f64", "double")),
        DType::I64 => Some(("i64", "long long")),
        DType::U32 => Some(("u32", "unsigned int")),
        _ => None,
    }
}

/// Entry point of the `dtype` variant.
pub fn add_entry(dtype: DType) -> Option<String> {
    names(dtype).map(|(suffix, _)| format!("x_add_y_{suffix}"))
}

/// Kernel source of the `dtype` variant.
pub fn add_source(dtype: DType) -> Option<String> {
    names(dtype).map(|(suffix, c_type)| TEMPLATE.replace("$N", suffix).replace("$T", c_type))
}

pub(super) fn register_host_kernels(runtime: &HostRuntime) {
    for entry in VARIANTS.iter().filter_map(|&dtype| add_entry(dtype)) {
        let name = entry.clone();
        runtime.register_kernel(entry, move |_geometry, args| {
            let (buffers, scalars) = split_args(&name, args, 3, 1)?;
            let n = scalar_usize(&name, &scalars, 0)?;
            if buffers.iter().any(|b| b.numel() != n) {
                return Err(DeviceError::InvalidArguments {
                    entry: name.clone(),
                    reason: format!("every buffer must hold {n} values"),
                });
            }
            let sum = (buffers[0].to_tensor()? + buffers[1].to_tensor()?)?;
            let bytes = DeviceBuffer::from_tensor(&sum, buffers[2].device())?.host_bytes()?;
            buffers[2].with_host_bytes_mut(|out| out.copy_from_slice(&bytes))
        });
    }
}

/// All variants, injected once; each compiles on its first use per device.
#[derive(Debug, Clone)]
pub struct AddKernels {
    handles: Vec<(DType, KernelHandle)>,
}

impl AddKernels {
    pub fn install<R: DeviceRuntime>(invoker: &KernelInvoker<R>) -> jit::Result<Self> {
        let mut handles = Vec::with_capacity(VARIANTS.len());
        for dtype in VARIANTS {
            if let Some(source) = add_source(dtype) {
                handles.push((dtype, invoker.inject_source(&source)?));
            }
        }
        Ok(Self { handles })
    }

    pub fn handle(&self, dtype: DType) -> Option<KernelHandle> {
        self.handles
            .iter()
            .find(|(d, _)| *d == dtype)
            .map(|(_, h)| *h)
    }

    /// `x + y` into a fresh buffer, enqueued on the compute stream of `x`'s
    /// device.
    pub fn add<R: DeviceRuntime>(
        &self,
        invoker: &KernelInvoker<R>,
        x: &DeviceBuffer,
        y: &DeviceBuffer,
    ) -> Result<DeviceBuffer> {
        const OP: &str = "x_add_y";
        if x.dtype() != y.dtype() {
            return Err(OpsError::DtypeMismatch {
                op: OP,
                expected: x.dtype(),
                actual: y.dtype(),
            });
        }
        if x.shape() != y.shape() {
            return Err(OpsError::ShapeMismatch {
                op: OP,
                expected: x.shape().to_vec(),
                actual: y.shape().to_vec(),
            });
        }
        let handle = self.handle(x.dtype()).ok_or(OpsError::UnsupportedDtype {
            op: OP,
            dtype: x.dtype(),
        })?;

        let runtime = invoker.runtime();
        let stream = runtime.stream(x.device(), StreamKind::Compute)?;
        let out = runtime.alloc(x.dtype(), x.shape(), stream)?;
        let n = x.numel();
        if n == 0 {
            return Ok(out);
        }
        let blocks = n.div_ceil(THREADS).min(MAX_BLOCKS) as u32;
        invoker.invoke_on(
            stream,
            handle,
            &[x, y, &out],
            &[ScalarArg::U64(n as u64)],
            Some(LaunchOverride::blocks(&[blocks])),
        )?;
        Ok(out)
    }
}
