//! Dense device buffers.
//!
//! A [`DeviceBuffer`] is a typed, shaped view of one allocation that lives
//! either in host memory (simulated platform) or in CUDA device memory. Clones
//! share the allocation. The allocation remembers every stream that used it so
//! a stream-ordered free can wait for all of them.

use std::sync::{Arc, Mutex, RwLock};

use candle_core::{DType, Device, Tensor, WithDType};

use crate::runtime::cuda::CudaMemory;
use crate::runtime::{DeviceError, Result, Stream};

pub(crate) enum Memory {
    Host(RwLock<Vec<u8>>),
    Cuda(CudaMemory),
}

impl Memory {
    fn kind(&self) -> &'static str {
        match self {
            Memory::Host(_) => "host",
            Memory::Cuda(_) => "cuda",
        }
    }
}

struct Allocation {
    memory: Memory,
    used_by: Mutex<Vec<Stream>>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Memory::Cuda(mem) = &self.memory {
            let streams = self
                .used_by
                .get_mut()
                .map(|s| std::mem::take(s))
                .unwrap_or_default();
            mem.release(&streams);
        }
    }
}

/// Typed, shaped handle to device or host memory.
#[derive(Clone)]
pub struct DeviceBuffer {
    dtype: DType,
    shape: Vec<usize>,
    device: usize,
    alloc: Arc<Allocation>,
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device)
            .field("memory", &self.alloc.memory.kind())
            .finish()
    }
}

impl DeviceBuffer {
    pub(crate) fn from_memory(
        memory: Memory,
        dtype: DType,
        shape: &[usize],
        device: usize,
        owner: Stream,
    ) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            device,
            alloc: Arc::new(Allocation {
                memory,
                used_by: Mutex::new(vec![owner]),
            }),
        }
    }

    /// Zero-filled host buffer attributed to simulated `device`.
    pub fn zeros_host(device: usize, dtype: DType, shape: &[usize]) -> Self {
        let bytes = shape.iter().product::<usize>() * dtype.size_in_bytes();
        Self::host_from_bytes_unchecked(device, dtype, shape, vec![0; bytes])
    }

    /// Host buffer holding `bytes`, which must match `shape` and `dtype`.
    pub fn host_from_bytes(
        device: usize,
        dtype: DType,
        shape: &[usize],
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(DeviceError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self::host_from_bytes_unchecked(device, dtype, shape, bytes))
    }

    fn host_from_bytes_unchecked(
        device: usize,
        dtype: DType,
        shape: &[usize],
        bytes: Vec<u8>,
    ) -> Self {
        let owner = Stream::new(device, crate::runtime::StreamKind::Compute, 0);
        Self::from_memory(Memory::Host(RwLock::new(bytes)), dtype, shape, device, owner)
    }

    /// Host buffer copied from a typed slice.
    pub fn from_slice<T: WithDType>(device: usize, data: &[T], shape: &[usize]) -> Result<Self> {
        Self::host_from_bytes(device, T::DTYPE, shape, bytes_of(data))
    }

    /// Host buffer copied from a candle tensor (any candle device).
    pub fn from_tensor(tensor: &Tensor, device: usize) -> Result<Self> {
        let flat = tensor.flatten_all()?;
        let bytes = match tensor.dtype() {
            DType::U8 => bytes_of(&flat.to_vec1::<u8>()?),
            DType::U32 => bytes_of(&flat.to_vec1::<u32>()?),
            DType::I64 => bytes_of(&flat.to_vec1::<i64>()?),
            DType::F16 => bytes_of(&flat.to_vec1::<half::f16>()?),
            DType::BF16 => bytes_of(&flat.to_vec1::<half::bf16>()?),
            DType::F32 => bytes_of(&flat.to_vec1::<f32>()?),
            DType::F64 => bytes_of(&flat.to_vec1::<f64>()?),
            other => {
                return Err(DeviceError::UnsupportedImage {
                    runtime: "host",
                    reason: format!("tensor dtype {other:?} has no buffer mapping"),
                })
            }
        };
        Self::host_from_bytes(device, tensor.dtype(), tensor.dims(), bytes)
    }

    /// Copy a host buffer into a CPU candle tensor.
    pub fn to_tensor(&self) -> Result<Tensor> {
        let shape = self.shape.clone();
        let tensor = match self.dtype {
            DType::U8 => Tensor::from_vec(self.to_vec::<u8>()?, shape, &Device::Cpu)?,
            DType::U32 => Tensor::from_vec(self.to_vec::<u32>()?, shape, &Device::Cpu)?,
            DType::I64 => Tensor::from_vec(self.to_vec::<i64>()?, shape, &Device::Cpu)?,
            DType::F16 => Tensor::from_vec(self.to_vec::<half::f16>()?, shape, &Device::Cpu)?,
            DType::BF16 => Tensor::from_vec(self.to_vec::<half::bf16>()?, shape, &Device::Cpu)?,
            DType::F32 => Tensor::from_vec(self.to_vec::<f32>()?, shape, &Device::Cpu)?,
            DType::F64 => Tensor::from_vec(self.to_vec::<f64>()?, shape, &Device::Cpu)?,
            other => {
                return Err(DeviceError::UnsupportedImage {
                    runtime: "host",
                    reason: format!("buffer dtype {other:?} has no tensor mapping"),
                })
            }
        };
        Ok(tensor)
    }

    /// Copy a host buffer out as typed values. `T` must match the buffer dtype.
    pub fn to_vec<T: WithDType>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(DeviceError::InvalidArguments {
                entry: "to_vec".to_string(),
                reason: format!("buffer holds {:?}, requested {:?}", self.dtype, T::DTYPE),
            });
        }
        self.with_host_bytes(|bytes| values_of::<T>(bytes))
    }

    /// Overwrite a host buffer with typed values of matching dtype and length.
    pub fn write_slice<T: WithDType>(&self, data: &[T]) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(DeviceError::InvalidArguments {
                entry: "write_slice".to_string(),
                reason: format!("buffer holds {:?}, got {:?}", self.dtype, T::DTYPE),
            });
        }
        let bytes = bytes_of(data);
        if bytes.len() != self.nbytes() {
            return Err(DeviceError::SizeMismatch {
                expected: self.nbytes(),
                actual: bytes.len(),
            });
        }
        self.with_host_bytes_mut(|dst| dst.copy_from_slice(&bytes))
    }

    /// Copy of the raw host bytes.
    pub fn host_bytes(&self) -> Result<Vec<u8>> {
        self.with_host_bytes(|bytes| bytes.to_vec())
    }

    /// Run `f` over the bytes of a host buffer.
    pub fn with_host_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        match &self.alloc.memory {
            Memory::Host(bytes) => {
                let guard = bytes.read().unwrap_or_else(|e| e.into_inner());
                Ok(f(&guard))
            }
            Memory::Cuda(_) => Err(DeviceError::MemoryKind {
                expected: "host",
                actual: "cuda",
            }),
        }
    }

    /// Run `f` over the mutable bytes of a host buffer.
    pub fn with_host_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        match &self.alloc.memory {
            Memory::Host(bytes) => {
                let mut guard = bytes.write().unwrap_or_else(|e| e.into_inner());
                Ok(f(&mut guard))
            }
            Memory::Cuda(_) => Err(DeviceError::MemoryKind {
                expected: "host",
                actual: "cuda",
            }),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn elem_size(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.elem_size()
    }

    pub fn is_host(&self) -> bool {
        matches!(self.alloc.memory, Memory::Host(_))
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.alloc, &other.alloc)
    }

    /// Device address of a CUDA buffer.
    pub fn device_ptr(&self) -> Option<u64> {
        match &self.alloc.memory {
            Memory::Cuda(mem) => Some(mem.ptr()),
            Memory::Host(_) => None,
        }
    }

    /// Streams registered as users of this allocation, allocating stream first.
    pub fn used_by(&self) -> Vec<Stream> {
        self.alloc
            .used_by
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub(crate) fn mark_used_by(&self, stream: Stream) {
        if let Ok(mut streams) = self.alloc.used_by.lock() {
            if !streams.contains(&stream) {
                streams.push(stream);
            }
        }
    }
}

fn bytes_of<T: WithDType>(data: &[T]) -> Vec<u8> {
    let len = std::mem::size_of_val(data);
    // SAFETY: every `WithDType` type is plain old data without padding, so
    // viewing the slice as bytes is valid for its whole length.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, len) }.to_vec()
}

fn values_of<T: WithDType>(bytes: &[u8]) -> Vec<T> {
    let count = bytes.len() / std::mem::size_of::<T>();
    let mut out: Vec<T> = Vec::with_capacity(count);
    // SAFETY: `out` has capacity for `count` values, the copy covers exactly
    // `count * size_of::<T>()` bytes, and any bit pattern is a valid `T`.
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            out.as_mut_ptr() as *mut u8,
            count * std::mem::size_of::<T>(),
        );
        out.set_len(count);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::StreamKind;

    #[test]
    fn slice_roundtrip_and_sizes() {
        let buf = DeviceBuffer::from_slice(1, &[1.5f32, -2.0, 3.25, 0.0], &[2, 2]).unwrap();
        assert_eq!(buf.device(), 1);
        assert_eq!(buf.numel(), 4);
        assert_eq!(buf.nbytes(), 16);
        assert_eq!(buf.to_vec::<f32>().unwrap(), vec![1.5, -2.0, 3.25, 0.0]);
    }

    #[test]
    fn shape_must_match_data() {
        let err = DeviceBuffer::from_slice(0, &[1u32, 2, 3], &[2, 2]).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::SizeMismatch {
                expected: 16,
                actual: 12
            }
        ));
    }

    #[test]
    fn typed_read_checks_dtype() {
        let buf = DeviceBuffer::from_slice(0, &[1u32, 2], &[2]).unwrap();
        assert!(buf.to_vec::<f32>().is_err());
    }

    #[test]
    fn tensor_interop() {
        let t = Tensor::new(&[[1i64, 2], [3, 4]], &Device::Cpu).unwrap();
        let buf = DeviceBuffer::from_tensor(&t, 0).unwrap();
        assert_eq!(buf.shape(), &[2, 2]);
        let back = buf.to_tensor().unwrap();
        assert_eq!(back.to_vec2::<i64>().unwrap(), vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn clones_share_allocation_and_stream_registry() {
        let buf = DeviceBuffer::zeros_host(0, DType::U8, &[8]);
        let clone = buf.clone();
        assert!(buf.same_allocation(&clone));
        clone.mark_used_by(Stream::new(0, StreamKind::Comm, 0));
        clone.mark_used_by(Stream::new(0, StreamKind::Comm, 0));
        let used: Vec<_> = buf.used_by().iter().map(|s| s.kind).collect();
        assert_eq!(used, vec![StreamKind::Compute, StreamKind::Comm]);

        clone.with_host_bytes_mut(|b| b[3] = 9).unwrap();
        assert_eq!(buf.host_bytes().unwrap()[3], 9);
    }
}
