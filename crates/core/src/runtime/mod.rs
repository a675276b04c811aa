//! Device platform abstraction.
//!
//! Everything the core needs from an accelerator runtime sits behind
//! [`DeviceRuntime`]: architecture queries, stream-ordered allocation, module
//! loading, kernel launch, and cross-stream events.
//!
//! Two implementations ship with the crate:
//! - [`cuda::CudaPlatform`] - dynamically loads `libcudart` and `libcuda`
//!   (no link-time CUDA dependency, same approach as the NCCL bindings)
//! - [`host::HostRuntime`] - executes registered host kernels synchronously on
//!   host memory, simulating N devices in one process; used by tests

pub mod cuda;
mod error;
pub mod host;
mod trace;

use std::fmt;

use candle_core::DType;

use crate::buffer::DeviceBuffer;

pub use error::{DeviceError, Result};
pub use trace::{CallTrace, TraceEvent};

/// Which of the two per-device execution queues an operation goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Queue used by the compute path (kernels of the surrounding model).
    Compute,
    /// Queue used by the communication path (collectives, permutations).
    Comm,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Comm => write!(f, "comm"),
        }
    }
}

/// Handle to a device execution queue.
///
/// `raw` is the platform handle (a `cudaStream_t` on CUDA, 0 on the host
/// platform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    pub device: usize,
    pub kind: StreamKind,
    raw: usize,
}

impl Stream {
    pub fn new(device: usize, kind: StreamKind, raw: usize) -> Self {
        Self { device, kind, raw }
    }

    pub fn raw(&self) -> usize {
        self.raw
    }

    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.raw as *mut std::ffi::c_void
    }
}

/// Three-axis extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const ONE: Self = Self { x: 1, y: 1, z: 1 };

    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Build from up to three extents; missing axes default to 1.
    pub fn from_slice(extents: &[u32]) -> Self {
        Self {
            x: extents.first().copied().unwrap_or(1),
            y: extents.get(1).copied().unwrap_or(1),
            z: extents.get(2).copied().unwrap_or(1),
        }
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::ONE
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }
}

/// Block and thread extents for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchGeometry {
    pub blocks: Dim3,
    pub threads: Dim3,
}

impl LaunchGeometry {
    pub fn new(blocks: impl Into<Dim3>, threads: impl Into<Dim3>) -> Self {
        Self {
            blocks: blocks.into(),
            threads: threads.into(),
        }
    }
}

/// Compiled kernel code ready to be loaded by a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelImage {
    /// Native device binary (fatbin) produced by the ahead-of-time toolchain.
    Binary(Vec<u8>),
    /// PTX text produced by the runtime compiler.
    Ptx(String),
    /// Host platform image: resolved by entry name against registered host kernels.
    Host { entry: String },
}

impl KernelImage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Binary(_) => "binary",
            Self::Ptx(_) => "ptx",
            Self::Host { .. } => "host",
        }
    }
}

/// Scalar kernel argument, passed by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarArg {
    I32(i32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl ScalarArg {
    /// Value widened to `u64` bit pattern in native byte order, as stored in
    /// the launch parameter block.
    pub fn to_bits(self) -> u64 {
        match self {
            Self::I32(v) => v as u32 as u64,
            Self::I64(v) => v as u64,
            Self::U64(v) => v,
            Self::F32(v) => v.to_bits() as u64,
            Self::F64(v) => v.to_bits(),
        }
    }

    pub fn as_usize(self) -> Option<usize> {
        match self {
            Self::I32(v) => usize::try_from(v).ok(),
            Self::I64(v) => usize::try_from(v).ok(),
            Self::U64(v) => usize::try_from(v).ok(),
            Self::F32(_) | Self::F64(_) => None,
        }
    }
}

/// One kernel launch argument: device buffers come first, scalars after.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Buffer(&'a DeviceBuffer),
    Scalar(ScalarArg),
}

/// Accelerator platform used by the JIT invoker, the event pool and the
/// exchange scheduler.
///
/// All enqueue operations return as soon as the work is queued; only
/// [`DeviceRuntime::synchronize`] and buffer reads block the host.
pub trait DeviceRuntime: Send + Sync + 'static {
    /// Loaded kernel function.
    type Function: Send + Sync;
    /// Cross-stream synchronization token.
    type Event: Send + Sync;

    /// Short platform name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Number of devices visible to this process.
    fn device_count(&self) -> usize;

    /// Architecture string of `device` (e.g. `"80"` for compute capability 8.0).
    fn arch(&self, device: usize) -> Result<String>;

    /// Whether compiled images for this platform come from the host registry.
    fn is_host(&self) -> bool {
        false
    }

    /// Execution queue `kind` of `device`, created on first use.
    fn stream(&self, device: usize, kind: StreamKind) -> Result<Stream>;

    /// Allocate an uninitialized buffer in `stream`'s allocation context.
    fn alloc(&self, dtype: DType, shape: &[usize], stream: Stream) -> Result<DeviceBuffer>;

    /// Tell the allocator that `stream` uses `buffer`, so freeing it waits
    /// for `stream` as well as the allocating stream.
    fn record_stream(&self, buffer: &DeviceBuffer, stream: Stream) -> Result<()> {
        buffer.mark_used_by(stream);
        Ok(())
    }

    /// Copy host bytes into `buffer` (blocking).
    fn write_buffer(&self, buffer: &DeviceBuffer, bytes: &[u8]) -> Result<()>;

    /// Copy `buffer` to host memory (blocking).
    fn read_buffer(&self, buffer: &DeviceBuffer) -> Result<Vec<u8>>;

    /// Load `image` on `device` and resolve `entry`.
    fn load_function(
        &self,
        device: usize,
        image: &KernelImage,
        entry: &str,
        launch_bound: u32,
    ) -> Result<Self::Function>;

    /// Enqueue a kernel launch.
    fn launch(
        &self,
        function: &Self::Function,
        geometry: &LaunchGeometry,
        args: &[KernelArg<'_>],
        stream: Stream,
    ) -> Result<()>;

    /// Grid and block size that maximize occupancy for `function`.
    fn max_potential_geometry(&self, function: &Self::Function) -> Result<(u32, u32)>;

    /// Create the event backing pool slot `slot` on `device`.
    fn create_event(&self, device: usize, slot: usize) -> Result<Self::Event>;

    /// Record `event` at the current tail of `stream`.
    fn record_event(&self, event: &Self::Event, stream: Stream) -> Result<()>;

    /// Make `stream` wait until `event` has been reached.
    fn wait_event(&self, event: &Self::Event, stream: Stream) -> Result<()>;

    /// Block the host until `stream` drains.
    fn synchronize(&self, stream: Stream) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dim3_from_slice_defaults_missing_axes() {
        assert_eq!(Dim3::from_slice(&[]), Dim3::ONE);
        assert_eq!(Dim3::from_slice(&[4]), Dim3::new(4, 1, 1));
        assert_eq!(Dim3::from_slice(&[4, 2]), Dim3::new(4, 2, 1));
        assert_eq!(Dim3::from_slice(&[4, 2, 3]).volume(), 24);
    }

    #[test]
    fn scalar_bits() {
        assert_eq!(ScalarArg::I32(-1).to_bits(), 0xffff_ffff);
        assert_eq!(ScalarArg::U64(7).to_bits(), 7);
        assert_eq!(ScalarArg::F32(1.0).to_bits(), 1.0f32.to_bits() as u64);
        assert_eq!(ScalarArg::I64(12).as_usize(), Some(12));
        assert_eq!(ScalarArg::I32(-3).as_usize(), None);
        assert_eq!(ScalarArg::F64(2.0).as_usize(), None);
    }

    #[test]
    fn stream_kind_display() {
        assert_eq!(StreamKind::Compute.to_string(), "compute");
        assert_eq!(StreamKind::Comm.to_string(), "comm");
    }
}
