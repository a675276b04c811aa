//! Expert-parallel exchange on top of the collective layer.
//!
//! - [`plan`]: byte layouts of the split and hierarchical exchanges
//! - [`stride_copy`]: the chunk permutation kernel used between the
//!   hierarchical rounds
//! - [`ExchangeScheduler`]: issues the rounds and the stream hand-offs

mod plan;
mod scheduler;
pub mod stride_copy;

pub use plan::{Direction, HierarchyPlan, SplitPlan};
pub use scheduler::ExchangeScheduler;
pub use stride_copy::{StrideCopyKernels, StrideUnit};
