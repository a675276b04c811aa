//! Stride permutation kernel.
//!
//! Views the input as a `width x height` grid of `size`-unit chunks (chunk
//! `i` at row `i / height`, column `i % height`) and writes its transpose:
//! chunk `i` lands at `width * (i % height) + i / height`. The hierarchical
//! exchange uses it to regroup per-rank chunks by destination device and
//! then by destination node.
//!
//! Two variants are compiled: one moving single bytes, one moving 16-byte
//! vectors when a chunk is a whole number of them.

use crate::buffer::DeviceBuffer;
use crate::jit::{self, KernelHandle, KernelInvoker, LaunchOverride};
use crate::runtime::host::{scalar_usize, split_args, HostRuntime};
use crate::runtime::{DeviceError, DeviceRuntime, Dim3, ScalarArg, Stream};

const TEMPLATE: &str = r#"
extern "C" __global__ void stride_copy_$N(
    $T *__restrict__ out, const $T *__restrict__ in,
    const size_t size, const int height, const int width) {
    const size_t tid = blockIdx.x * blockDim.x + threadIdx.x;
    for (size_t i = tid; i < size * height * width; i += gridDim.x * blockDim.x) {
        const size_t index = i / size, offset = i % size;
        const size_t j = (width * (index % height) + (index / height)) * size + offset;
        out[j] = in[i];
    }
}
"#;

/// Unit moved per element by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrideUnit {
    Byte,
    Vec16,
}

impl StrideUnit {
    /// 16-byte vectors when `chunk_bytes` is a non-zero multiple of 16.
    pub fn for_chunk(chunk_bytes: usize) -> Self {
        if chunk_bytes > 0 && chunk_bytes % 16 == 0 {
            Self::Vec16
        } else {
            Self::Byte
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Vec16 => 16,
        }
    }

    pub fn entry(self) -> &'static str {
        match self {
            Self::Byte => "stride_copy_u8",
            Self::Vec16 => "stride_copy_u128",
        }
    }

    fn c_type(self) -> &'static str {
        match self {
            Self::Byte => "char",
            Self::Vec16 => "uint4",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Byte => "u8",
            Self::Vec16 => "u128",
        }
    }

    /// Kernel source of this variant.
    pub fn source(self) -> String {
        TEMPLATE
            .replace("$N", self.suffix())
            .replace("$T", self.c_type())
    }
}

/// Host reference: permute `height * width` chunks of `chunk_bytes` each.
pub fn stride_copy_host(
    out: &mut [u8],
    input: &[u8],
    chunk_bytes: usize,
    height: usize,
    width: usize,
) {
    for index in 0..height * width {
        let src = index * chunk_bytes;
        let dst = (width * (index % height) + index / height) * chunk_bytes;
        out[dst..dst + chunk_bytes].copy_from_slice(&input[src..src + chunk_bytes]);
    }
}

/// Register both variants with the host platform.
pub fn register_host_kernels(runtime: &HostRuntime) {
    for unit in [StrideUnit::Byte, StrideUnit::Vec16] {
        let entry = unit.entry();
        runtime.register_kernel(entry, move |_geometry, args| {
            let (buffers, scalars) = split_args(entry, args, 2, 3)?;
            let size = scalar_usize(entry, &scalars, 0)?;
            let height = scalar_usize(entry, &scalars, 1)?;
            let width = scalar_usize(entry, &scalars, 2)?;
            let chunk_bytes = size * unit.bytes();
            let needed = chunk_bytes * height * width;
            if buffers.iter().any(|b| b.nbytes() < needed) {
                return Err(DeviceError::InvalidArguments {
                    entry: entry.to_string(),
                    reason: format!("{needed} bytes exceed a buffer argument"),
                });
            }
            let input = buffers[1].host_bytes()?;
            buffers[0].with_host_bytes_mut(|out| {
                stride_copy_host(out, &input, chunk_bytes, height, width)
            })
        });
    }
}

/// Both compiled variants plus the occupancy-derived launch geometry.
#[derive(Debug, Clone, Copy)]
pub struct StrideCopyKernels {
    byte: KernelHandle,
    vec16: KernelHandle,
    blocks: u32,
    threads: u32,
}

impl StrideCopyKernels {
    /// Inject both variants and size the launch from the vector variant's
    /// occupancy on `device`.
    pub fn install<R: DeviceRuntime>(invoker: &KernelInvoker<R>, device: usize) -> jit::Result<Self> {
        let byte = invoker.inject_source(&StrideUnit::Byte.source())?;
        let vec16 = invoker.inject_source(&StrideUnit::Vec16.source())?;
        let function = invoker.function(vec16, device)?;
        let (blocks, threads) = invoker.runtime().max_potential_geometry(&function)?;
        tracing::debug!(device, blocks, threads, "stride copy kernels ready");
        Ok(Self {
            byte,
            vec16,
            blocks: blocks.max(1),
            threads: threads.max(1),
        })
    }

    pub fn geometry(&self) -> (u32, u32) {
        (self.blocks, self.threads)
    }

    /// Enqueue the permutation of `height * width` chunks of `chunk_bytes`
    /// from `input` into `out` on `stream`.
    #[allow(clippy::too_many_arguments)]
    pub fn launch<R: DeviceRuntime>(
        &self,
        invoker: &KernelInvoker<R>,
        stream: Stream,
        out: &DeviceBuffer,
        input: &DeviceBuffer,
        chunk_bytes: usize,
        height: usize,
        width: usize,
    ) -> jit::Result<()> {
        let unit = StrideUnit::for_chunk(chunk_bytes);
        let handle = match unit {
            StrideUnit::Byte => self.byte,
            StrideUnit::Vec16 => self.vec16,
        };
        let scalars = [
            ScalarArg::U64((chunk_bytes / unit.bytes()) as u64),
            ScalarArg::I32(height as i32),
            ScalarArg::I32(width as i32),
        ];
        let launch = LaunchOverride {
            blocks: Some(Dim3::from(self.blocks)),
            threads: Some(Dim3::from(self.threads)),
        };
        invoker.invoke_on(stream, handle, &[out, input], &scalars, Some(launch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use candle_core::DType;
    use crate::runtime::StreamKind;
    use std::sync::Arc;

    #[test]
    fn unit_selection() {
        assert_eq!(StrideUnit::for_chunk(32), StrideUnit::Vec16);
        assert_eq!(StrideUnit::for_chunk(24), StrideUnit::Byte);
        assert_eq!(StrideUnit::for_chunk(8), StrideUnit::Byte);
        assert_eq!(StrideUnit::for_chunk(0), StrideUnit::Byte);
    }

    #[test]
    fn source_variants_have_distinct_entries() {
        let byte = StrideUnit::Byte.source();
        let vec = StrideUnit::Vec16.source();
        assert!(byte.contains("void stride_copy_u8(") && byte.contains("char *__restrict__ out"));
        assert!(vec.contains("void stride_copy_u128(") && vec.contains("uint4 *__restrict__ out"));
        assert!(!vec.contains('$'));
    }

    #[test]
    fn host_reference_transposes_chunks() {
        // height 2, width 3: chunk i goes to 3 * (i % 2) + i / 2.
        let input: Vec<u8> = (0..6).collect();
        let mut out = vec![0u8; 6];
        stride_copy_host(&mut out, &input, 1, 2, 3);
        assert_eq!(out, vec![0, 2, 4, 1, 3, 5]);
    }

    #[test]
    fn launch_matches_reference_for_both_units() {
        let runtime = Arc::new(HostRuntime::new(1));
        let invoker = KernelInvoker::new(Arc::clone(&runtime), &RuntimeConfig::default());
        let kernels = StrideCopyKernels::install(&invoker, 0).unwrap();
        assert_eq!(kernels.geometry(), (1, 1024));
        let stream = runtime.stream(0, StreamKind::Comm).unwrap();

        for chunk in [3usize, 32] {
            let bytes: Vec<u8> = (0..chunk * 8).map(|i| (i * 7 % 251) as u8).collect();
            let input = DeviceBuffer::from_slice(0, &bytes, &[bytes.len()]).unwrap();
            let out = DeviceBuffer::zeros_host(0, DType::U8, &[bytes.len()]);
            kernels
                .launch(&invoker, stream, &out, &input, chunk, 4, 2)
                .unwrap();
            let mut expected = vec![0u8; bytes.len()];
            stride_copy_host(&mut expected, &bytes, chunk, 4, 2);
            assert_eq!(out.host_bytes().unwrap(), expected);
        }
        let entries: Vec<_> = runtime
            .trace()
            .events()
            .into_iter()
            .filter_map(|e| match e {
                crate::runtime::TraceEvent::Launch { entry, .. } => Some(entry),
                _ => None,
            })
            .collect();
        assert_eq!(entries, vec!["stride_copy_u8", "stride_copy_u128"]);
    }
}
