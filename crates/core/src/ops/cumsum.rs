//! Column-wise running location.
//!
//! For an `[num_samples, batch]` mask of 0/1 entries, output row `i` of
//! column `c` is the number of ones in rows `0..=i` minus one, i.e. the
//! zero-based slot a sample takes within its expert. One block scans one
//! column, 1024 rows at a time.

use candle_core::DType;

use super::{OpsError, Result};
use crate::buffer::DeviceBuffer;
use crate::jit::{self, KernelHandle, KernelInvoker, LaunchOverride};
use crate::runtime::host::{scalar_usize, split_args, HostRuntime};
use crate::runtime::{DeviceError, DeviceRuntime, ScalarArg, StreamKind};

pub const CUMSUM_ENTRY: &str = "cumsum_i64";

const SOURCE: &str = r#"
// [thread_extent] threadIdx.x = 1024
extern "C" __global__ void __launch_bounds__(1024) cumsum_i64(
    const long long *input, long long *output, const int num_samples) {
    #define thread_num 1024
    #define batch_num ((int)gridDim.x)

    __shared__ long long temp[thread_num + 1];
    const int thid = threadIdx.x, bid = blockIdx.x;
    long long last_sum = -1;

    for (int S = 0; S < num_samples;
         S += thread_num, output += thread_num * batch_num, input += thread_num * batch_num) {
        int offset = 1;
        temp[thid] = (S + thid < num_samples) ? input[thid * batch_num + bid] : 0;
        for (int d = thread_num >> 1; d > 0; d >>= 1) {
            __syncthreads();
            if (thid < d)
                temp[offset * (2 * thid + 2) - 1] += temp[offset * (2 * thid + 1) - 1];
            offset *= 2;
        }
        if (thid == 0)
            temp[thread_num] = temp[thread_num - 1], temp[thread_num - 1] = 0;
        for (int d = 1; d < thread_num; d *= 2) {
            offset >>= 1;
            __syncthreads();
            if (thid < d) {
                const int ai = offset * (2 * thid + 1) - 1;
                const int bi = offset * (2 * thid + 2) - 1;
                const long long t = temp[ai];
                temp[ai] = temp[bi];
                temp[bi] += t;
            }
        }
        __syncthreads();
        if (S + thid < num_samples)
            output[thid * batch_num + bid] = temp[thid + 1] + last_sum;
        __syncthreads();
        last_sum += temp[thread_num];
    }
}
"#;

/// Host reference over a row-major `[num_samples, batch]` slice.
pub fn cumsum_host(input: &[i64], num_samples: usize, batch: usize) -> Vec<i64> {
    let mut out = vec![0; num_samples * batch];
    for col in 0..batch {
        let mut running = -1i64;
        for row in 0..num_samples {
            running = running.wrapping_add(input[row * batch + col]);
            out[row * batch + col] = running;
        }
    }
    out
}

pub(super) fn register_host_kernel(runtime: &HostRuntime) {
    runtime.register_kernel(CUMSUM_ENTRY, |geometry, args| {
        let (buffers, scalars) = split_args(CUMSUM_ENTRY, args, 2, 1)?;
        let num_samples = scalar_usize(CUMSUM_ENTRY, &scalars, 0)?;
        let batch = geometry.blocks.x as usize;
        let reject = |reason: String| DeviceError::InvalidArguments {
            entry: CUMSUM_ENTRY.to_string(),
            reason,
        };
        for buffer in &buffers {
            if buffer.numel() != num_samples * batch {
                return Err(reject(format!(
                    "buffer of {} values for a {num_samples}x{batch} scan",
                    buffer.numel()
                )));
            }
        }
        let input = buffers[0].to_vec::<i64>()?;
        buffers[1].write_slice(&cumsum_host(&input, num_samples, batch))
    });
}

/// Compiled-on-demand cumsum operator.
#[derive(Debug, Clone, Copy)]
pub struct CumsumKernel {
    handle: KernelHandle,
}

impl CumsumKernel {
    pub fn install<R: DeviceRuntime>(invoker: &KernelInvoker<R>) -> jit::Result<Self> {
        Ok(Self {
            handle: invoker.inject_source(SOURCE)?,
        })
    }

    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    /// Running locations of a 2-D `I64` mask, enqueued on the compute stream
    /// of the mask's device.
    pub fn run<R: DeviceRuntime>(
        &self,
        invoker: &KernelInvoker<R>,
        input: &DeviceBuffer,
    ) -> Result<DeviceBuffer> {
        const OP: &str = "cumsum";
        if input.dtype() != DType::I64 {
            return Err(OpsError::DtypeMismatch {
                op: OP,
                expected: DType::I64,
                actual: input.dtype(),
            });
        }
        let &[num_samples, batch] = input.shape() else {
            return Err(OpsError::ShapeMismatch {
                op: OP,
                expected: vec![0, 0],
                actual: input.shape().to_vec(),
            });
        };
        let (Ok(samples_arg), Ok(blocks)) = (i32::try_from(num_samples), u32::try_from(batch))
        else {
            return Err(OpsError::ShapeMismatch {
                op: OP,
                expected: vec![i32::MAX as usize, u32::MAX as usize],
                actual: input.shape().to_vec(),
            });
        };

        let runtime = invoker.runtime();
        let stream = runtime.stream(input.device(), StreamKind::Compute)?;
        let output = runtime.alloc(DType::I64, input.shape(), stream)?;
        if num_samples == 0 || batch == 0 {
            return Ok(output);
        }
        invoker.invoke_on(
            stream,
            self.handle,
            &[input, &output],
            &[ScalarArg::I32(samples_arg)],
            Some(LaunchOverride::blocks(&[blocks])),
        )?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::jit::KernelSource;
    use std::sync::Arc;

    #[test]
    fn source_parses_with_full_block() {
        let source = KernelSource::parse(SOURCE).unwrap();
        assert_eq!(source.entry(), CUMSUM_ENTRY);
        assert_eq!(source.geometry().threads.x, 1024);
        assert_eq!(source.launch_bound(), 1024);
    }

    #[test]
    fn host_reference_counts_per_column() {
        // Two experts, four samples.
        let mask = [1, 0, 0, 1, 1, 1, 0, 0];
        assert_eq!(cumsum_host(&mask, 4, 2), vec![0, -1, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn run_on_host_matches_reference() {
        let runtime = Arc::new(HostRuntime::new(1));
        let invoker = KernelInvoker::new(Arc::clone(&runtime), &RuntimeConfig::default());
        let kernel = CumsumKernel::install(&invoker).unwrap();
        let mask: Vec<i64> = (0..30).map(|i| (i * 7 % 3 == 0) as i64).collect();
        let input = DeviceBuffer::from_slice(0, &mask, &[10, 3]).unwrap();
        let output = kernel.run(&invoker, &input).unwrap();
        assert_eq!(output.to_vec::<i64>().unwrap(), cumsum_host(&mask, 10, 3));
    }

    #[test]
    fn rejects_non_matrix_input() {
        let runtime = Arc::new(HostRuntime::new(1));
        let invoker = KernelInvoker::new(runtime, &RuntimeConfig::default());
        let kernel = CumsumKernel::install(&invoker).unwrap();
        let input = DeviceBuffer::zeros_host(0, DType::I64, &[8]);
        assert!(matches!(
            kernel.run(&invoker, &input),
            Err(OpsError::ShapeMismatch { op: "cumsum", .. })
        ));
        let input = DeviceBuffer::zeros_host(0, DType::F32, &[2, 2]);
        assert!(matches!(
            kernel.run(&invoker, &input),
            Err(OpsError::DtypeMismatch { .. })
        ));
    }
}
