//! Just-in-time kernel compilation and launch.
//!
//! Kernels are registered as source text with [`KernelInvoker::inject_source`]
//! and compiled lazily, once per device, the first time they are invoked on
//! that device. Compiled functions stay cached for the life of the invoker.
//!
//! # Usage
//!
//! ```ignore
//! use expertlink_core::jit::{KernelInvoker, LaunchOverride};
//!
//! let invoker = KernelInvoker::new(runtime, &config);
//! let scale = invoker.inject_source(r#"
//! // [thread_extent] threadIdx.x = 256
//! extern "C" __global__ void scale(float* out, const float* in, int n) { ... }
//! "#)?;
//! invoker.invoke(scale, 0, &[&out, &input], &[ScalarArg::I32(n)], Some(LaunchOverride::blocks(&[blocks])))?;
//! ```

mod compiler;
mod error;
mod invoker;
mod nvrtc;
mod source;
mod table;

pub use compiler::{CompileTarget, CompilerChain, HostCompiler, KernelCompiler, NvccCompiler};
pub use error::{JitError, Result};
pub use invoker::{JitStats, KernelInvoker, LaunchOverride};
pub use nvrtc::NvrtcCompiler;
pub use source::{KernelSource, DEFAULT_LAUNCH_BOUND, SOURCE_PRELUDE};
pub use table::{KernelDescriptor, KernelHandle, KernelTable};
