//! JIT kernel cache and pipelined all-to-all exchange for expert-parallel
//! workloads.
//!
//! - [`jit`]: compile kernel sources on first use per device and launch them
//! - [`distributed`]: communicators, rendezvous and cross-stream event slots
//! - [`exchange`]: split-pipelined scatter/gather and the hierarchical
//!   all-to-all
//! - [`ops`]: cumsum, elementwise add and the host sparse dispatch operators
//! - [`context`]: one process-scoped object tying them together
//!
//! Two platforms are provided: CUDA ([`runtime::cuda`]) and an in-process
//! host simulation ([`runtime::host`]) that backs the test suite.

pub mod buffer;
pub mod config;
pub mod context;
pub mod distributed;
pub mod exchange;
pub mod jit;
pub mod logging;
pub mod ops;
pub mod runtime;

pub use buffer::DeviceBuffer;
pub use config::RuntimeConfig;
pub use context::ExchangeContext;
