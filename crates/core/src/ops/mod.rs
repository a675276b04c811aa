//! Point operators that reuse the compile/cache/launch machinery.
//!
//! - [`CumsumKernel`]: per-column running location of routing masks
//! - [`AddKernels`]: elementwise `x + y`, used by `allreduce_add`
//! - [`sparse_dispatch`]: host implementation of the sparse encode/decode
//!   operators

mod cumsum;
mod elementwise;
pub mod sparse_dispatch;

use thiserror::Error;

use crate::jit::JitError;
use crate::runtime::host::HostRuntime;
use crate::runtime::DeviceError;

pub use cumsum::{cumsum_host, CumsumKernel, CUMSUM_ENTRY};
pub use elementwise::{add_entry, add_source, AddKernels};

/// Errors raised by the operators.
#[derive(Error, Debug)]
pub enum OpsError {
    #[error("{op}: shape mismatch, expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{op}: dtype mismatch, expected {expected:?}, got {actual:?}")]
    DtypeMismatch {
        op: &'static str,
        expected: candle_core::DType,
        actual: candle_core::DType,
    },

    #[error("{op}: no kernel for dtype {dtype:?}")]
    UnsupportedDtype {
        op: &'static str,
        dtype: candle_core::DType,
    },

    /// A routed sample points outside the dispatched buffer.
    #[error("{op}: sample {sample} routes to offset {offset}, buffer holds {len} values")]
    IndexOutOfRange {
        op: &'static str,
        sample: usize,
        offset: usize,
        len: usize,
    },

    #[error(transparent)]
    Jit(#[from] JitError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, OpsError>;

/// Register the operator kernels with the host platform.
pub fn register_host_kernels(runtime: &HostRuntime) {
    cumsum::register_host_kernel(runtime);
    elementwise::register_host_kernels(runtime);
}
